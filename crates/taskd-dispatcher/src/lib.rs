//! taskd Dispatcher Library
//!
//! The scheduling side of taskd: the resource graph, live task handles, the
//! executor pool of worker processes, the balancer, and the control server
//! workers and clients connect to.

pub mod balancer;
pub mod config;
pub mod events;
pub mod executor;
pub mod logging;
pub mod resources;
pub mod schema;
pub mod server;
pub mod spawner;
pub mod store;
pub mod task;

pub use balancer::{Balancer, BalancerDeps, BalancerError, Submission};
pub use config::Config;
pub use events::{BroadcastEventBus, Event, EventBus};
pub use executor::Executor;
pub use resources::{Resource, ResourceGraph};
pub use schema::{BasicValidator, SchemaValidator};
pub use spawner::{OutputBuffer, ProcessSpawner, SpawnError, WorkerProcess, WorkerSpawner};
pub use store::{JsonFileTaskStore, MemoryTaskStore, StoreError, TaskStore};
pub use task::TaskHandle;
