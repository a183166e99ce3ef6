// ABOUTME: Library crate for Execbox exposing the sandboxed code-execution API

pub mod capabilities;
pub mod config;
pub mod gateway;
pub mod models;
pub mod notebook;
pub mod policy;
pub mod sandbox;
pub mod service;
pub mod session;

pub use config::AppConfig;
pub use models::{Session, SessionKey};
pub use policy::{DataSensitivity, NetworkMode};
pub use sandbox::{ExecutionRequest, ExecutionResult, Isolator};
pub use service::{CellRecord, ExecService};
