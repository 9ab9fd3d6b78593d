//! Diagnostic task types for exercising the dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use taskd_core::{
    errno, Abortable, Args, CoreError, HookType, Registry, Rollback, StatusReporter, TaskContext,
    TaskEnv, TaskError, TaskHook, TaskPlugin, TaskState, TaskStatus, TaskType,
};
use tokio::sync::Notify;
use tracing::{debug, info};

const MODULE: &str = "plugins/testing";

fn task_type<T>(name: &str, class: &str) -> TaskType
where
    T: TaskPlugin + Default + 'static,
{
    TaskType::new(name, MODULE, class, |_: &TaskEnv| {
        Box::new(T::default()) as Box<dyn TaskPlugin>
    })
}

pub fn register(registry: &mut Registry) -> Result<(), CoreError> {
    registry.register_task(task_type::<EchoTask>("test.echo", "EchoTask"))?;
    registry.register_task(
        task_type::<SleepTask>("test.sleep", "SleepTask").with_schema(vec![
            json!({"type": "number", "minimum": 0, "mandatory": true}),
            json!({"type": "array", "items": {"type": "string"}}),
        ]),
    )?;
    registry.register_task(task_type::<FailTask>("test.fail", "FailTask"))?;
    registry.register_task(task_type::<RollbackTask>("test.rollback", "RollbackTask"))?;
    registry.register_task(task_type::<WarningTask>("test.warnings", "WarningTask"))?;
    registry.register_task(task_type::<SubtasksTask>("test.subtasks", "SubtasksTask"))?;
    registry.register_task(task_type::<RegisterResourceTask>(
        "test.register_resource",
        "RegisterResourceTask",
    ))?;
    registry.register_task(task_type::<UnregisterResourceTask>(
        "test.unregister_resource",
        "UnregisterResourceTask",
    ))?;
    registry.register_task(
        task_type::<EchoTask>("test.hooked", "HookedTask")
            .with_early_description("Task with hooks attached"),
    )?;

    registry.register_hook(TaskHook::new(HookType::Before, "test.hooked", "test.echo")?);
    registry.register_hook(
        TaskHook::new(HookType::After, "test.hooked", "test.echo")?
            .with_condition(|args| args.get(0) != Some(&Value::Bool(false))),
    );
    registry.register_hook(TaskHook::new(HookType::Error, "test.rollback", "test.echo")?);
    Ok(())
}

/// Returns its arguments.
#[derive(Default)]
pub struct EchoTask;

#[async_trait]
impl TaskPlugin for EchoTask {
    fn verify(&self, _args: &Args) -> Result<Vec<String>, TaskError> {
        Ok(Vec::new())
    }

    async fn run(&self, _ctx: &dyn TaskContext, args: &Args) -> Result<Value, TaskError> {
        Ok(args.to_value())
    }
}

/// Sleeps for `args[0]` seconds holding the resources listed in `args[1]`.
#[derive(Default)]
pub struct SleepTask {
    /// Percent done, as f64 bits.
    done: AtomicU64,
    aborted: Arc<Notify>,
}

impl SleepTask {
    const STEPS: u32 = 10;

    fn duration(args: &Args) -> Duration {
        let secs = args.get(0).and_then(Value::as_f64).unwrap_or(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or_default()
    }
}

#[async_trait]
impl TaskPlugin for SleepTask {
    fn verify(&self, args: &Args) -> Result<Vec<String>, TaskError> {
        let resources = match args.get(1) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|r| {
                    r.as_str().map(str::to_string).ok_or_else(|| {
                        TaskError::verify(errno::EINVAL, format!("Invalid resource name {}", r))
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(TaskError::verify(
                    errno::EINVAL,
                    format!("Invalid resource list {}", other),
                ))
            }
        };
        Ok(resources)
    }

    fn describe(&self, args: &Args) -> Option<String> {
        Some(format!("Sleeping for {:?}", Self::duration(args)))
    }

    async fn run(&self, ctx: &dyn TaskContext, args: &Args) -> Result<Value, TaskError> {
        let step = Self::duration(args) / Self::STEPS;
        for i in 1..=Self::STEPS {
            tokio::select! {
                _ = self.aborted.notified() => {
                    info!(task_id = %ctx.task_id(), "Sleep aborted");
                    return Err(TaskError::aborted("Sleep aborted"));
                }
                _ = tokio::time::sleep(step) => {}
            }
            let percentage = f64::from(i * 100 / Self::STEPS);
            self.done.store(percentage.to_bits(), Ordering::Relaxed);
        }
        Ok(json!(true))
    }

    fn as_abortable(&self) -> Option<&dyn Abortable> {
        Some(self)
    }

    fn as_status_reporter(&self) -> Option<&dyn StatusReporter> {
        Some(self)
    }
}

impl Abortable for SleepTask {
    fn abort(&self) -> Result<(), TaskError> {
        self.aborted.notify_one();
        Ok(())
    }
}

impl StatusReporter for SleepTask {
    fn get_status(&self) -> TaskStatus {
        TaskStatus::new(f64::from_bits(self.done.load(Ordering::Relaxed)), "Sleeping")
    }
}

/// Fails in `verify()` when `args[0]` is `"verify"`, otherwise in `run()`,
/// with `args[1]` as the message.
#[derive(Default)]
pub struct FailTask;

impl FailTask {
    fn message(args: &Args) -> String {
        args.str(1).unwrap_or("Task failed on request").to_string()
    }
}

#[async_trait]
impl TaskPlugin for FailTask {
    fn verify(&self, args: &Args) -> Result<Vec<String>, TaskError> {
        if args.str(0) == Some("verify") {
            return Err(TaskError::verify(errno::EBUSY, Self::message(args)));
        }
        Ok(Vec::new())
    }

    async fn run(&self, _ctx: &dyn TaskContext, args: &Args) -> Result<Value, TaskError> {
        Err(TaskError::new(errno::EINVAL, Self::message(args)))
    }
}

/// Fails in `run()` and compensates in `rollback()`.
#[derive(Default)]
pub struct RollbackTask;

#[async_trait]
impl TaskPlugin for RollbackTask {
    fn verify(&self, _args: &Args) -> Result<Vec<String>, TaskError> {
        Ok(Vec::new())
    }

    async fn run(&self, ctx: &dyn TaskContext, _args: &Args) -> Result<Value, TaskError> {
        ctx.put_progress(TaskStatus::new(40.0, "Applying")).await?;
        Err(TaskError::new(errno::EINVAL, "Cannot apply configuration"))
    }

    fn as_rollback(&self) -> Option<&dyn Rollback> {
        Some(self)
    }
}

#[async_trait]
impl Rollback for RollbackTask {
    async fn rollback(&self, ctx: &dyn TaskContext, _args: &Args) -> Result<(), TaskError> {
        debug!(task_id = %ctx.task_id(), "Rolling back");
        ctx.put_progress(TaskStatus::new(40.0, "Rolled back")).await
    }
}

/// Emits `args[0]` warnings, then finishes.
#[derive(Default)]
pub struct WarningTask;

#[async_trait]
impl TaskPlugin for WarningTask {
    fn verify(&self, _args: &Args) -> Result<Vec<String>, TaskError> {
        Ok(Vec::new())
    }

    async fn run(&self, ctx: &dyn TaskContext, args: &Args) -> Result<Value, TaskError> {
        let count = args.get(0).and_then(Value::as_u64).unwrap_or(1);
        for i in 0..count {
            ctx.add_warning(TaskError::new(errno::EINVAL, format!("Warning {}", i)))
                .await?;
        }
        Ok(json!(count))
    }
}

/// Runs each `[name, args]` pair of `args[0]` as a subtask, joins them all,
/// and returns their end states.
#[derive(Default)]
pub struct SubtasksTask;

impl SubtasksTask {
    fn children(args: &Args) -> Result<Vec<(String, Args)>, TaskError> {
        let invalid = || TaskError::verify(errno::EINVAL, "Expected a list of [name, args] pairs");
        let list = args.get(0).and_then(Value::as_array).ok_or_else(invalid)?;
        list.iter()
            .map(|child| {
                let name = child.get(0).and_then(Value::as_str).ok_or_else(invalid)?;
                let child_args = match child.get(1) {
                    Some(Value::Array(a)) => Args::new(a.clone()),
                    None => Args::default(),
                    Some(_) => return Err(invalid()),
                };
                Ok((name.to_string(), child_args))
            })
            .collect()
    }
}

#[async_trait]
impl TaskPlugin for SubtasksTask {
    fn verify(&self, args: &Args) -> Result<Vec<String>, TaskError> {
        Self::children(args)?;
        Ok(Vec::new())
    }

    async fn run(&self, ctx: &dyn TaskContext, args: &Args) -> Result<Value, TaskError> {
        let mut ids = Vec::new();
        for (name, child_args) in Self::children(args)? {
            ids.push(ctx.run_subtask(&name, child_args, None).await?);
        }
        let outcomes = ctx.join_subtasks(&ids).await?;
        let states: Vec<TaskState> = outcomes.iter().map(|o| o.state).collect();
        Ok(json!(states))
    }
}

/// Adds resource `args[0]` under the parents listed in `args[1]`.
#[derive(Default)]
pub struct RegisterResourceTask;

#[async_trait]
impl TaskPlugin for RegisterResourceTask {
    fn verify(&self, args: &Args) -> Result<Vec<String>, TaskError> {
        args.str(0)
            .ok_or_else(|| TaskError::verify(errno::EINVAL, "Resource name not given"))?;
        Ok(Vec::new())
    }

    async fn run(&self, ctx: &dyn TaskContext, args: &Args) -> Result<Value, TaskError> {
        let name = args.str(0).unwrap_or_default();
        let parents: Vec<String> = args
            .get(1)
            .and_then(Value::as_array)
            .map(|p| p.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        ctx.register_resource(name, &parents).await?;
        Ok(json!(name))
    }
}

/// Removes resource `args[0]`.
#[derive(Default)]
pub struct UnregisterResourceTask;

#[async_trait]
impl TaskPlugin for UnregisterResourceTask {
    fn verify(&self, args: &Args) -> Result<Vec<String>, TaskError> {
        args.str(0)
            .ok_or_else(|| TaskError::verify(errno::EINVAL, "Resource name not given"))?;
        Ok(Vec::new())
    }

    async fn run(&self, ctx: &dyn TaskContext, args: &Args) -> Result<Value, TaskError> {
        let name = args.str(0).unwrap_or_default();
        ctx.unregister_resource(name).await?;
        Ok(Value::Null)
    }
}

#[cfg(test)]
pub(crate) use tests::NullContext;
