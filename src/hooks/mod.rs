//! Hook processing: use case, action routing, and the HTTP listener.

pub mod controller;
pub mod server;
pub mod use_case;

pub use controller::HookController;
pub use server::{AppState, HealthProbes, HookServer};
pub use use_case::HookUseCase;
