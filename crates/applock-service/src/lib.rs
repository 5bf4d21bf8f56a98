pub mod auth;
pub mod desktop;
pub mod engine;
pub mod platform;
pub mod status;

pub use engine::{Collaborators, Engine, EngineHandle, OverlayBinding};
pub use status::EngineStatus;
