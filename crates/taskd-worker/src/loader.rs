//! Resolving the implementation of a run request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use taskd_core::{Args, CoreError, HookType, Registry, TaskType};
use tracing::debug;

/// Looks task types up by module and class, caching each module's types for
/// the lifetime of the worker process.
pub struct Loader {
    registry: Arc<Registry>,
    cache: Mutex<HashMap<String, HashMap<String, Arc<TaskType>>>>,
}

impl Loader {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(&self, module: &str, class: &str) -> Result<Arc<TaskType>, CoreError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let classes = cache.entry(module.to_string()).or_insert_with(|| {
            debug!(module, "Loading module");
            HashMap::new()
        });
        if let Some(task_type) = classes.get(class) {
            return Ok(Arc::clone(task_type));
        }
        let task_type = self.registry.resolve(module, class)?;
        classes.insert(class.to_string(), Arc::clone(&task_type));
        Ok(task_type)
    }

    /// Whether `module` has been loaded by this process.
    pub fn is_loaded(&self, module: &str) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(module)
    }

    pub fn hooks(&self, hook_type: HookType, task_name: &str, args: &Args) -> Vec<String> {
        self.registry.hooks_for(hook_type, task_name, args)
    }
}
