// Library exports for the mailfeed crate
// The binary and the integration tests drive the service through these modules

pub mod config;
pub mod error;
pub mod model;

// Consumed boundaries: mail protocol and persistence
pub mod mail;
pub mod storage;

pub mod matcher;
pub mod retention;
pub mod retry;

// Orchestration
mod state;
pub mod scheduler;
pub mod status;
pub mod supervisor;
pub mod worker;

pub use config::ServiceConfig;
pub use error::{ProcessingError, Result};
pub use status::{LifecycleState, ServiceStatus};
pub use supervisor::{CommandResult, Supervisor};
pub use worker::{AccountWorker, RunReport};
