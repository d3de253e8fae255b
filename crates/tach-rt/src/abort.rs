//! ---
//! tach_section: "01-core-functionality"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Run-wide abort signalling shared by clocks, injectors, and runners."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

/// Owner side of the abort switch. Cloning shares the same switch.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

/// Observer side of the abort switch.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<String>>,
}

impl AbortHandle {
    pub fn new() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, AbortSignal { rx })
    }

    /// Trip the switch. Only the first reason is kept; returns whether this call tripped it.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let tripped = self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason.clone());
            true
        });
        if tripped {
            warn!(target: "tach::rt::abort", %reason, "abort requested");
        }
        tripped
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortSignal {
    /// A signal with no handle attached; it never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve once the switch is tripped. Pending forever when every handle is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if rx.borrow_and_update().is_some() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn abort_is_idempotent_and_keeps_first_reason() {
        let (handle, signal) = AbortHandle::new();
        assert!(!signal.is_aborted());
        assert!(handle.abort("ctrl-c"));
        assert!(!handle.abort("second"));
        assert!(signal.is_aborted());
        assert_eq!(signal.reason().as_deref(), Some("ctrl-c"));
        signal.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wakes_waiters() {
        let (handle, signal) = AbortHandle::new();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        handle.abort("operator");
        waiter.await.unwrap();
        assert!(handle.signal().is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn never_signal_stays_pending() {
        let signal = AbortSignal::never();
        let outcome =
            tokio::time::timeout(Duration::from_secs(5), signal.cancelled()).await;
        assert!(outcome.is_err());
        assert!(!signal.is_aborted());
    }
}
