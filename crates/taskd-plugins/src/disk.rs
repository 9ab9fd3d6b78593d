//! Disk tasks.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use taskd_core::{
    errno, Abortable, Args, CoreError, Registry, StatusReporter, TaskContext, TaskEnv, TaskError,
    TaskPlugin, TaskStatus, TaskType,
};
use tokio::sync::Notify;
use tracing::info;

const ERASE_STEPS: u32 = 4;
const ERASE_STEP: Duration = Duration::from_millis(25);

pub fn register(registry: &mut Registry) -> Result<(), CoreError> {
    registry.register_task(
        TaskType::new("disk.erase", "plugins/disk", "DiskEraseTask", |_: &TaskEnv| {
            Box::new(DiskEraseTask::default()) as Box<dyn TaskPlugin>
        })
        .with_schema(vec![
            json!({"type": "string", "mandatory": true}),
            json!({"type": "string", "enum": ["QUICK", "ZEROS", "RANDOM"]}),
        ])
        .with_early_description("Erasing disk"),
    )
}

/// Wipes a disk, holding `disk:<name>` for the duration.
#[derive(Default)]
pub struct DiskEraseTask {
    status: Mutex<TaskStatus>,
    aborted: Arc<Notify>,
}

impl DiskEraseTask {
    fn disk(args: &Args) -> Result<&str, TaskError> {
        args.str(0)
            .ok_or_else(|| TaskError::verify(errno::EINVAL, "Disk name not given"))
    }

    fn set_status(&self, status: TaskStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[async_trait]
impl TaskPlugin for DiskEraseTask {
    fn verify(&self, args: &Args) -> Result<Vec<String>, TaskError> {
        Ok(vec![format!("disk:{}", Self::disk(args)?)])
    }

    fn describe(&self, args: &Args) -> Option<String> {
        args.str(0).map(|disk| format!("Erasing disk {}", disk))
    }

    async fn run(&self, ctx: &dyn TaskContext, args: &Args) -> Result<Value, TaskError> {
        let disk = Self::disk(args)?;
        let method = args.str(1).unwrap_or("QUICK");
        info!(disk, method, "Erasing disk");

        for step in 1..=ERASE_STEPS {
            tokio::select! {
                _ = self.aborted.notified() => return Err(TaskError::aborted("Erase aborted")),
                _ = tokio::time::sleep(ERASE_STEP) => {}
            }
            let status = TaskStatus::new(
                f64::from(step * 100 / ERASE_STEPS),
                format!("Erasing disk {}", disk),
            );
            self.set_status(status.clone());
            ctx.put_progress(status).await?;
        }
        Ok(json!({"disk": disk, "method": method}))
    }

    fn as_abortable(&self) -> Option<&dyn Abortable> {
        Some(self)
    }

    fn as_status_reporter(&self) -> Option<&dyn StatusReporter> {
        Some(self)
    }
}

impl Abortable for DiskEraseTask {
    fn abort(&self) -> Result<(), TaskError> {
        self.aborted.notify_one();
        Ok(())
    }
}

impl StatusReporter for DiskEraseTask {
    fn get_status(&self) -> TaskStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NullContext;

    #[test]
    fn test_verify_claims_the_disk() {
        let task = DiskEraseTask::default();
        let resources = task.verify(&Args::new(vec![json!("diskA")])).unwrap();
        assert_eq!(resources, vec!["disk:diskA".to_string()]);
        assert_eq!(
            task.describe(&Args::new(vec![json!("diskA")])).as_deref(),
            Some("Erasing disk diskA")
        );

        let err = task.verify(&Args::default()).unwrap_err();
        assert_eq!(err.code, errno::EINVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_progress() {
        let task = DiskEraseTask::default();
        let ctx = NullContext::default();
        let result = task
            .run(&ctx, &Args::new(vec![json!("diskA"), json!("ZEROS")]))
            .await
            .unwrap();
        assert_eq!(result, json!({"disk": "diskA", "method": "ZEROS"}));
        assert_eq!(task.get_status().percentage, 100.0);
        assert_eq!(ctx.progress().len(), ERASE_STEPS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_erase() {
        let task = DiskEraseTask::default();
        task.abort().unwrap();
        let err = task
            .run(&NullContext::default(), &Args::new(vec![json!("diskA")]))
            .await
            .unwrap_err();
        assert!(err.is_abort());
    }
}
