use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

/// Handles one remote command. Receives `arg` and returns the response body;
/// an empty response (null, `{}`, `[]`, `""`) is sent without a `res` key.
pub type CommandHandler = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
    fallback: CommandHandler,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(command_not_found),
        }
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CommandRegistry {
    pub fn add(&mut self, name: impl Into<String>, handler: CommandHandler) {
        let name = name.into();
        debug!("Registering command {}", name);
        self.handlers.insert(name, handler);
    }

    /// Returns the handler for `name`, or the built-in "not found" handler.
    pub fn resolve(&self, name: &str) -> CommandHandler {
        match self.handlers.get(name) {
            Some(handler) => handler.clone(),
            None => {
                warn!("No handler registered for command {:?}", name);
                self.fallback.clone()
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn command_not_found(_arg: &Value) -> Value {
    warn!("Command not found");
    json!({"info": "Command not found"})
}

pub fn is_empty_response(response: &Value) -> bool {
    match response {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
