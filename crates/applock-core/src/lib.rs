pub mod credentials;
pub mod error;
pub mod event_log;
pub mod paths;
pub mod registry;
pub mod settings;
pub mod storage;

pub use registry::{AppId, AppRegistry, LockRegistry, LockedApp};
