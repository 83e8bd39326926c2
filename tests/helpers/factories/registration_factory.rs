use crate::command::{CommandInfo, RegistrationDocument};
use std::collections::BTreeMap;

/// Builds registration documents as written by a peer listener.
pub struct RegistrationFactory {
    uuid: String,
    node: String,
    commands: Vec<String>,
}

impl RegistrationFactory {
    pub fn new() -> Self {
        Self {
            uuid: "peer-node".to_string(),
            node: "peer-host".to_string(),
            commands: vec!["echo".to_string()],
        }
    }

    pub fn with_uuid(mut self, uuid: &str) -> Self {
        self.uuid = uuid.to_string();
        self
    }

    pub fn with_commands(mut self, names: &[&str]) -> Self {
        self.commands = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn create(self) -> RegistrationDocument {
        let keys: BTreeMap<String, CommandInfo> = self
            .commands
            .into_iter()
            .map(|name| {
                let info = format!("{name} on {}", self.node);
                (name, CommandInfo { info })
            })
            .collect();
        RegistrationDocument::new(self.uuid, self.node, keys, Vec::new())
    }
}
