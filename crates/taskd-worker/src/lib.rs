//! taskd Worker Runner
//!
//! The process side of an executor slot. A worker connects back to the
//! dispatcher, checks in with the key it was started with, and then runs one
//! task at a time on the dispatcher's request.

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod loader;
pub mod runner;

pub use config::Config;
pub use connection::{connect_and_run, serve};
pub use context::RemoteContext;
pub use error::WorkerError;
pub use runner::Runner;
