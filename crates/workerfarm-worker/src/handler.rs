use crate::WorkerContext;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Result type for task modules; the error text becomes the call's failure
pub type TaskResult<T = Value> = Result<T, String>;

/// The code a worker runs.
///
/// `init` is invoked once per configuration generation before any `run`
/// observes that generation.
#[async_trait]
pub trait TaskModule: Send + Sync {
    async fn init(&self, _options: Value) -> TaskResult<()> {
        Ok(())
    }

    async fn run(&self, ctx: &WorkerContext, args: Vec<Value>) -> TaskResult;
}

/// Registry of task modules by name
pub struct ModuleRegistry {
    modules: Arc<RwLock<HashMap<String, Arc<dyn TaskModule>>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            modules: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a module under `name`, replacing any previous one
    pub fn register<M: TaskModule + 'static>(&self, name: impl Into<String>, module: M) {
        let mut modules = self.modules.write();
        modules.insert(name.into(), Arc::new(module));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskModule>> {
        let modules = self.modules.read();
        modules.get(name).cloned()
    }

    pub fn has_module(&self, name: &str) -> bool {
        let modules = self.modules.read();
        modules.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let modules = self.modules.read();
        let mut names: Vec<String> = modules.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::EchoModule;

    #[tokio::test]
    async fn test_registry() {
        let registry = ModuleRegistry::new();
        registry.register("echo", EchoModule);

        assert!(registry.has_module("echo"));
        assert!(!registry.has_module("unknown"));
        assert_eq!(registry.names(), vec!["echo".to_string()]);

        let module = registry.get("echo").unwrap();
        let ctx = WorkerContext::detached();
        let result = module.run(&ctx, vec![Value::from("hi")]).await.unwrap();
        assert_eq!(result, Value::from("hi"));
    }
}
