//! Bounded hide retries.
//!
//! A single hide command can lose the race against the application's own
//! window-show animation, so a freshly locked process is hidden several
//! times in a row. The burst stops as soon as the process reports hidden
//! or terminated; anything that slips through afterwards is the
//! re-assertion loop's job.

use std::time::Duration;
use tracing::trace;

use crate::desktop::ProcessHandle;

/// Issues one hide unless the process is already hidden or gone.
/// Returns whether a command was sent.
pub(crate) fn hide_once(handle: &dyn ProcessHandle) -> bool {
    if handle.is_terminated() || handle.is_hidden() {
        return false;
    }
    handle.hide();
    true
}

/// Follow-up attempts after the first, synchronous hide. Returns the
/// number of hide commands issued.
pub(crate) async fn hide_with_retries(
    handle: &dyn ProcessHandle,
    attempts: u32,
    delay: Duration,
) -> u32 {
    let mut issued = 0;
    for attempt in 0..attempts {
        tokio::time::sleep(delay).await;
        if !hide_once(handle) {
            trace!(pid = handle.pid(), attempt, "hide burst settled");
            break;
        }
        issued += 1;
    }
    issued
}

#[cfg(test)]
mod tests {
    use super::*;
    use applock_core::AppId;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Ignores the first `stubborn` hide commands.
    struct Stubborn {
        stubborn: u32,
        hides: AtomicU32,
        hidden: AtomicBool,
        terminated: AtomicBool,
    }

    impl Stubborn {
        fn new(stubborn: u32) -> Self {
            Self {
                stubborn,
                hides: AtomicU32::new(0),
                hidden: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
            }
        }
    }

    impl ProcessHandle for Stubborn {
        fn pid(&self) -> u32 {
            7
        }
        fn app_id(&self) -> Option<AppId> {
            Some(AppId::from("com.test.stubborn"))
        }
        fn display_name(&self) -> String {
            "Stubborn".into()
        }
        fn is_hidden(&self) -> bool {
            self.hidden.load(Ordering::SeqCst)
        }
        fn is_terminated(&self) -> bool {
            self.terminated.load(Ordering::SeqCst)
        }
        fn hide(&self) {
            let n = self.hides.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.stubborn {
                self.hidden.store(true, Ordering::SeqCst);
            }
        }
        fn unhide(&self) {}
        fn activate(&self) {}
        fn terminate(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_hidden() {
        let proc = Stubborn::new(2);
        assert!(hide_once(&proc));
        let issued = hide_with_retries(&proc, 4, Duration::from_millis(50)).await;
        assert_eq!(issued, 2);
        assert_eq!(proc.hides.load(Ordering::SeqCst), 3);
        assert!(proc.is_hidden());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let proc = Stubborn::new(100);
        hide_once(&proc);
        let issued = hide_with_retries(&proc, 4, Duration::from_millis(50)).await;
        assert_eq!(issued, 4);
        assert_eq!(proc.hides.load(Ordering::SeqCst), 5);
        assert!(!proc.is_hidden());
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_process_gets_nothing() {
        let proc = Stubborn::new(0);
        proc.terminated.store(true, Ordering::SeqCst);
        assert!(!hide_once(&proc));
        assert_eq!(hide_with_retries(&proc, 4, Duration::from_millis(50)).await, 0);
        assert_eq!(proc.hides.load(Ordering::SeqCst), 0);
    }
}
