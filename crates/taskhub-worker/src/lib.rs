//! Worker runtime: one execution server per queue group, with attempt
//! reporting, heartbeats and registration against the control plane.

pub mod config;
pub mod control_plane;
mod error;
pub mod executor;
pub mod handler;
pub mod heartbeat;
pub mod retry;
pub mod server;
pub mod worker;

pub use config::{ReportRetryConfig, WorkerSettings};
pub use control_plane::ControlPlane;
pub use error::{Result, WorkerError};
pub use handler::{handler_fn, HandlerResult, TaskContext, TaskHandler};
pub use retry::ReportError;
pub use worker::{Worker, WorkerBuilder};
