use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use super::errors::DispatchError;
use crate::shared::time::response_timestamp;

pub const COMMAND_TYPE: &str = "command";
pub const REGISTRATION_TYPE: &str = "export_commands";
pub const HEARTBEAT_TYPE: &str = "heartbeat";

/// Prefix of `content` in every failed response.
pub const EXCEPTION_PREFIX: &str = "Exception";

/// A request to run `execute` with positional `arguments`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDocument {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub execute: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl CommandDocument {
    pub fn new(execute: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            doc_type: COMMAND_TYPE.to_string(),
            execute: execute.into(),
            arguments,
        }
    }

    /// Validates a raw document from the feed. A missing `arguments` field
    /// means no arguments; anything but a list is rejected.
    pub fn from_value(doc: &Value) -> Result<Self, DispatchError> {
        let execute = match doc.get("execute") {
            Some(Value::String(name)) => name.clone(),
            Some(_) => return Err(DispatchError::InvalidExecute),
            None => return Err(DispatchError::MissingExecute),
        };
        let arguments = match doc.get("arguments") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(args)) => args.clone(),
            Some(_) => return Err(DispatchError::ArgumentsNotList { command: execute }),
        };
        Ok(Self::new(execute, arguments))
    }

    pub fn to_value(&self) -> Value {
        json!({
            "type": self.doc_type,
            "execute": self.execute,
            "arguments": self.arguments,
        })
    }
}

/// Outcome of a command, stored under the `response` field of the command
/// document that requested it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
}

impl ResponseEnvelope {
    pub fn success(command: &str, result: Value) -> Self {
        Self {
            content: format!("'{command}' success"),
            timestamp: response_timestamp(),
            return_value: Some(result),
            ok: Some(true),
        }
    }

    pub fn failure(diagnostic: &str) -> Self {
        Self {
            content: format!("{EXCEPTION_PREFIX}:\n{diagnostic}"),
            timestamp: response_timestamp(),
            return_value: None,
            ok: None,
        }
    }

    /// The only place a dispatch outcome becomes a response.
    pub fn from_outcome(outcome: &Result<(String, Value), DispatchError>) -> Self {
        match outcome {
            Ok((command, result)) => Self::success(command, result.clone()),
            Err(err) => Self::failure(&err.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.ok != Some(true) && self.content.starts_with(EXCEPTION_PREFIX)
    }

    /// Fields merged into the originating command document.
    pub fn to_update(&self) -> Result<Value, serde_json::Error> {
        Ok(json!({ "response": serde_json::to_value(self)? }))
    }
}

/// Per-command entry of a registration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    #[serde(rename = "Info")]
    pub info: String,
}

/// Advertises the command vocabulary of one running listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationDocument {
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Stable identity of the node hosting the listener.
    pub uuid: String,
    pub node: String,
    pub keys: BTreeMap<String, CommandInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_servers: Vec<String>,
    pub timestamp: String,
}

impl RegistrationDocument {
    pub fn new(
        uuid: impl Into<String>,
        node: impl Into<String>,
        keys: BTreeMap<String, CommandInfo>,
        log_servers: Vec<String>,
    ) -> Self {
        Self {
            doc_type: REGISTRATION_TYPE.to_string(),
            uuid: uuid.into(),
            node: node.into(),
            keys,
            log_servers,
            timestamp: response_timestamp(),
        }
    }

    pub fn command_names(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Periodic liveness marker of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatDocument {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub node_id: String,
    pub timestamp: String,
}

impl HeartbeatDocument {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            doc_type: HEARTBEAT_TYPE.to_string(),
            node_id: node_id.into(),
            timestamp: response_timestamp(),
        }
    }

    /// Document id of the heartbeat for `node_id`.
    pub fn doc_id(node_id: &str) -> String {
        format!("{HEARTBEAT_TYPE}_{node_id}")
    }

    pub fn to_value(&self) -> Value {
        json!({
            "type": self.doc_type,
            "node_id": self.node_id,
            "timestamp": self.timestamp,
        })
    }
}
