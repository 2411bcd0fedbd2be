//! Job tracking and orchestration.

mod orchestrator;
mod store;

pub use orchestrator::{EngineStatus, Orchestrator};
pub use store::JobStore;
