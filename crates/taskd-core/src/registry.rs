//! Task-type table and hook table, built once at startup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugin::{TaskEnv, TaskPlugin};
use crate::{Args, CoreError};

/// Builds a fresh implementation instance for one task run.
pub trait TaskFactory: Send + Sync {
    fn create(&self, env: &TaskEnv) -> Box<dyn TaskPlugin>;
}

impl<F> TaskFactory for F
where
    F: Fn(&TaskEnv) -> Box<dyn TaskPlugin> + Send + Sync,
{
    fn create(&self, env: &TaskEnv) -> Box<dyn TaskPlugin> {
        self(env)
    }
}

/// One registered task type.
pub struct TaskType {
    /// Submission key, e.g. `disk.erase`.
    pub name: String,
    /// Implementation unit the class lives in; the worker caches loads by it.
    pub module: String,
    pub class_name: String,
    /// Per-position parameter schemas. Arguments of a type without one are
    /// not validated.
    pub params_schema: Option<Vec<Value>>,
    /// Class-level description shown before `verify()` has run.
    pub early_description: Option<String>,
    factory: Arc<dyn TaskFactory>,
}

impl TaskType {
    pub fn new(
        name: impl Into<String>,
        module: impl Into<String>,
        class_name: impl Into<String>,
        factory: impl TaskFactory + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            class_name: class_name.into(),
            params_schema: None,
            early_description: None,
            factory: Arc::new(factory),
        }
    }

    pub fn with_schema(mut self, params_schema: Vec<Value>) -> Self {
        self.params_schema = Some(params_schema);
        self
    }

    pub fn with_early_description(mut self, description: impl Into<String>) -> Self {
        self.early_description = Some(description.into());
        self
    }

    pub fn instantiate(&self, env: &TaskEnv) -> Box<dyn TaskPlugin> {
        self.factory.create(env)
    }
}

impl fmt::Debug for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskType")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("class_name", &self.class_name)
            .finish_non_exhaustive()
    }
}

/// When a hook runs relative to the hooked task's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookType {
    Before,
    After,
    Error,
}

pub type HookCondition = Arc<dyn Fn(&Args) -> bool + Send + Sync>;

/// A task type run as a subtask around every task whose name matches `pattern`.
#[derive(Clone)]
pub struct TaskHook {
    pub hook_type: HookType,
    pub pattern: String,
    /// Name of the task type to run.
    pub task: String,
    matcher: GlobMatcher,
    condition: Option<HookCondition>,
}

impl TaskHook {
    pub fn new(
        hook_type: HookType,
        pattern: impl Into<String>,
        task: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let pattern = pattern.into();
        let matcher = Glob::new(&pattern)
            .map_err(|e| CoreError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?
            .compile_matcher();
        Ok(Self {
            hook_type,
            pattern,
            task: task.into(),
            matcher,
            condition: None,
        })
    }

    /// Only run the hook when `condition` holds for the hooked task's args.
    pub fn with_condition(mut self, condition: impl Fn(&Args) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn applies_to(&self, task_name: &str, args: &Args) -> bool {
        self.matcher.is_match(task_name) && self.condition.as_ref().map_or(true, |c| c(args))
    }
}

impl fmt::Debug for TaskHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHook")
            .field("hook_type", &self.hook_type)
            .field("pattern", &self.pattern)
            .field("task", &self.task)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

/// Every task type and hook known to this process.
#[derive(Debug, Default)]
pub struct Registry {
    types: HashMap<String, Arc<TaskType>>,
    hooks: Vec<TaskHook>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_task(&mut self, task_type: TaskType) -> Result<(), CoreError> {
        if self.types.contains_key(&task_type.name) {
            return Err(CoreError::DuplicateTaskType(task_type.name));
        }
        self.types.insert(task_type.name.clone(), Arc::new(task_type));
        Ok(())
    }

    pub fn register_hook(&mut self, hook: TaskHook) {
        self.hooks.push(hook);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<TaskType>, CoreError> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownTaskType(name.to_string()))
    }

    /// Find the task type implemented by `class` inside `module`.
    pub fn resolve(&self, module: &str, class: &str) -> Result<Arc<TaskType>, CoreError> {
        self.types
            .values()
            .find(|t| t.module == module && t.class_name == class)
            .cloned()
            .ok_or_else(|| CoreError::ClassNotFound {
                module: module.to_string(),
                class: class.to_string(),
            })
    }

    /// Names of the hook tasks of `hook_type` that apply to this invocation,
    /// in registration order.
    pub fn hooks_for(&self, hook_type: HookType, task_name: &str, args: &Args) -> Vec<String> {
        self.hooks
            .iter()
            .filter(|h| h.hook_type == hook_type && h.applies_to(task_name, args))
            .map(|h| h.task.clone())
            .collect()
    }

    /// Registered task type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::TaskContext;
    use crate::TaskError;
    use async_trait::async_trait;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl TaskPlugin for Noop {
        fn verify(&self, _args: &Args) -> Result<Vec<String>, TaskError> {
            Ok(vec!["system".to_string()])
        }

        async fn run(&self, _ctx: &dyn TaskContext, _args: &Args) -> Result<Value, TaskError> {
            Ok(Value::Null)
        }
    }

    fn noop_type(name: &str) -> TaskType {
        TaskType::new(name, "plugins/test", "NoopTask", |_: &TaskEnv| {
            Box::new(Noop) as Box<dyn TaskPlugin>
        })
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = Registry::new();
        registry.register_task(noop_type("test.noop")).unwrap();

        let task_type = registry.get("test.noop").unwrap();
        let instance = task_type.instantiate(&TaskEnv::default());
        assert_eq!(instance.verify(&Args::default()).unwrap(), vec!["system"]);
        assert!(matches!(
            registry.get("test.missing"),
            Err(CoreError::UnknownTaskType(_))
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = Registry::new();
        registry.register_task(noop_type("test.noop")).unwrap();
        assert!(matches!(
            registry.register_task(noop_type("test.noop")),
            Err(CoreError::DuplicateTaskType(_))
        ));
    }

    #[test]
    fn test_resolve_by_module_and_class() {
        let mut registry = Registry::new();
        registry.register_task(noop_type("test.noop")).unwrap();
        assert_eq!(registry.resolve("plugins/test", "NoopTask").unwrap().name, "test.noop");
        assert!(registry.resolve("plugins/disk", "NoopTask").is_err());
    }

    #[test]
    fn test_hooks_filter_by_pattern_and_condition() {
        let mut registry = Registry::new();
        registry.register_hook(TaskHook::new(HookType::Before, "volume.*", "hook.snapshot").unwrap());
        registry.register_hook(
            TaskHook::new(HookType::Before, "volume.delete", "hook.detach")
                .unwrap()
                .with_condition(|args| args.str(0) == Some("tank")),
        );
        registry.register_hook(TaskHook::new(HookType::After, "*", "hook.audit").unwrap());

        let tank = Args::new(vec![json!("tank")]);
        let other = Args::new(vec![json!("scratch")]);

        assert_eq!(
            registry.hooks_for(HookType::Before, "volume.delete", &tank),
            vec!["hook.snapshot", "hook.detach"]
        );
        assert_eq!(
            registry.hooks_for(HookType::Before, "volume.delete", &other),
            vec!["hook.snapshot"]
        );
        assert!(registry.hooks_for(HookType::Before, "disk.erase", &tank).is_empty());
        assert_eq!(registry.hooks_for(HookType::After, "disk.erase", &tank), vec!["hook.audit"]);
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            TaskHook::new(HookType::Error, "volume.[", "hook.x"),
            Err(CoreError::InvalidPattern { .. })
        ));
    }
}
