use serde_json::{Map, Value, json};

/// Builds raw command documents as they appear on the change feed,
/// including malformed ones.
pub struct CommandDocFactory {
    execute: Option<Value>,
    arguments: Option<Value>,
    extra: Map<String, Value>,
}

impl CommandDocFactory {
    pub fn new() -> Self {
        Self {
            execute: Some(json!("echo")),
            arguments: Some(json!([])),
            extra: Map::new(),
        }
    }

    pub fn with_execute(mut self, name: &str) -> Self {
        self.execute = Some(json!(name));
        self
    }

    pub fn with_raw_execute(mut self, value: Value) -> Self {
        self.execute = Some(value);
        self
    }

    pub fn without_execute(mut self) -> Self {
        self.execute = None;
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.arguments = Some(Value::Array(args));
        self
    }

    /// Sets `arguments` to any JSON value, lists or not.
    pub fn with_raw_arguments(mut self, value: Value) -> Self {
        self.arguments = Some(value);
        self
    }

    pub fn without_arguments(mut self) -> Self {
        self.arguments = None;
        self
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn create(self) -> Value {
        let mut doc = Map::new();
        doc.insert("type".to_string(), json!("command"));
        if let Some(execute) = self.execute {
            doc.insert("execute".to_string(), execute);
        }
        if let Some(arguments) = self.arguments {
            doc.insert("arguments".to_string(), arguments);
        }
        doc.extend(self.extra);
        Value::Object(doc)
    }
}
