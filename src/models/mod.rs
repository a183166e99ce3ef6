// ABOUTME: Core data models for Execbox sessions and their persisted state

pub mod session;

pub use session::{Session, SessionKey};
