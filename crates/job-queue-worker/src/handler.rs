use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Result type for job functions: a value to encode, or an application error
pub type HandlerResult = Result<Value, String>;

/// A callable that jobs invoke by name
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn call(&self, args: Value) -> HandlerResult;
}

/// Registry of job functions by name
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under `function`
    pub fn register<H: JobHandler + 'static>(&self, function: impl Into<String>, handler: H) {
        let mut handlers = self.handlers.write();
        handlers.insert(function.into(), Arc::new(handler));
    }

    pub fn get(&self, function: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read();
        handlers.get(function).cloned()
    }

    pub fn has_handler(&self, function: &str) -> bool {
        let handlers = self.handlers.read();
        handlers.contains_key(function)
    }

    /// All registered function names, sorted
    pub fn functions(&self) -> Vec<String> {
        let handlers = self.handlers.read();
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the built-in example functions
pub fn default_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry.register("echo", EchoHandler);
    registry.register("sleep", SleepHandler);
    registry.register("json_keys", JsonKeysHandler);
    registry.register("fail", FailHandler);
    registry
}

/// Returns its arguments unchanged
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn call(&self, args: Value) -> HandlerResult {
        Ok(args)
    }
}

/// Sleeps for `args` seconds (a number, or `{"seconds": n}`)
pub struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    async fn call(&self, args: Value) -> HandlerResult {
        let seconds = args
            .as_f64()
            .or_else(|| args.get("seconds").and_then(Value::as_f64))
            .ok_or_else(|| format!("expected a number of seconds, got {}", args))?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(format!("invalid sleep duration: {}", seconds));
        }

        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(Value::from(seconds))
    }
}

/// Counts the keys of an object argument
pub struct JsonKeysHandler;

#[async_trait]
impl JobHandler for JsonKeysHandler {
    async fn call(&self, args: Value) -> HandlerResult {
        let result = if let Some(obj) = args.as_object() {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            serde_json::json!({
                "key_count": obj.len(),
                "keys": keys,
            })
        } else {
            return Err(format!("expected an object, got {}", args));
        };

        Ok(result)
    }
}

/// Always fails with its argument as the message
pub struct FailHandler;

#[async_trait]
impl JobHandler for FailHandler {
    async fn call(&self, args: Value) -> HandlerResult {
        match args {
            Value::String(message) => Err(message),
            other => Err(format!("job failed: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_handler() {
        let result = EchoHandler.call(json!([1, "two"])).await.unwrap();
        assert_eq!(result, json!([1, "two"]));
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = default_registry();

        assert!(registry.has_handler("echo"));
        assert!(!registry.has_handler("unknown"));
        assert_eq!(registry.functions(), vec!["echo", "fail", "json_keys", "sleep"]);

        let handler = registry.get("json_keys").unwrap();
        let result = handler.call(json!({"b": 1, "a": 2})).await.unwrap();
        assert_eq!(result, json!({"key_count": 2, "keys": ["a", "b"]}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_accepts_both_shapes() {
        assert_eq!(SleepHandler.call(json!(0.5)).await.unwrap(), json!(0.5));
        assert_eq!(SleepHandler.call(json!({"seconds": 2})).await.unwrap(), json!(2.0));
        assert!(SleepHandler.call(json!("soon")).await.is_err());
        assert!(SleepHandler.call(json!(-1)).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_handler_raises() {
        assert_eq!(FailHandler.call(json!("boom")).await.unwrap_err(), "boom");
    }
}
