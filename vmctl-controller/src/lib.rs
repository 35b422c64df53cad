pub mod commands;
pub mod config;
pub mod controller;
pub mod leader;
pub mod provider_manager;
pub mod queue;
pub mod reconciler;
pub mod routes;
pub mod state_machine;
pub mod store;

pub use controller::{Controller, ControllerHealth, ControllerSettings};
pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler, ReconcilerConfig};
pub use store::{MemoryStore, PgStore, ResourceStore, StoreError};
