//! Task types shipped with taskd.
//!
//! [`registry`] builds the table both the dispatcher and the worker load at
//! startup, so a task type resolves to the same implementation on either
//! side of the control channel.

pub mod disk;
pub mod testing;

use taskd_core::{CoreError, Registry};

/// Every shipped task type and hook.
pub fn registry() -> Result<Registry, CoreError> {
    let mut registry = Registry::new();
    disk::register(&mut registry)?;
    testing::register(&mut registry)?;
    Ok(registry)
}
