//! Contracts the enforcement engine consumes from the window system.
//!
//! None of these are owned by the engine. A process may terminate at any
//! moment; implementations report that through [`ProcessHandle::is_terminated`]
//! rather than by failing commands.

use applock_core::AppId;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::engine::OverlayBinding;

pub type ProcessId = u32;

pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> ProcessId;
    /// `None` for processes without a stable application identifier.
    fn app_id(&self) -> Option<AppId>;
    fn display_name(&self) -> String;
    fn is_hidden(&self) -> bool;
    fn is_terminated(&self) -> bool;
    fn hide(&self);
    fn unhide(&self);
    fn activate(&self);
    fn terminate(&self);
}

pub type SharedProcess = Arc<dyn ProcessHandle>;

#[derive(Clone)]
pub enum ActivationEvent {
    Activated(SharedProcess),
    Deactivated(SharedProcess),
}

impl fmt::Debug for ActivationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationEvent::Activated(p) => write!(f, "Activated({})", p.pid()),
            ActivationEvent::Deactivated(p) => write!(f, "Deactivated({})", p.pid()),
        }
    }
}

pub trait ActivationEventSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ActivationEvent>;
}

pub trait ProcessDirectory: Send + Sync {
    fn frontmost(&self) -> Option<SharedProcess>;
}

/// Raises the locker itself above every other application.
pub trait FocusController: Send + Sync {
    fn steal_focus(&self);
}

/// Single-slot modal shown over a locked application.
///
/// Presenting while already shown replaces the binding and brings the
/// overlay forward; it never stacks.
pub trait OverlayPresenter: Send + Sync {
    fn present(&self, binding: OverlayBinding);
    fn dismiss(&self);
    fn authentication_failed(&self, _display_name: &str) {}
}

#[async_trait]
pub trait AuthenticationGate: Send + Sync {
    /// Resolves to `true` only when the user proved their identity.
    async fn authenticate(&self) -> bool;
}
