use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, ensure};
use tokio::sync::watch;

/// Worker lifecycle states. A version moves installing -> waiting ->
/// activating -> active; superseded is terminal and entered when a newer
/// version takes control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Installing,
    Waiting,
    Activating,
    Active,
    Superseded,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Installing => "installing",
            WorkerState::Waiting => "waiting",
            WorkerState::Activating => "activating",
            WorkerState::Active => "active",
            WorkerState::Superseded => "superseded",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state holder. The state is observable through a watch channel
/// so the owning page (an external collaborator) can detect the controller
/// change and reload itself; the worker never forces that.
pub struct Lifecycle {
    state: watch::Sender<WorkerState>,
    clients_claimed: AtomicBool,
    navigation_preload: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(WorkerState::Installing);
        Self {
            state,
            clients_claimed: AtomicBool::new(false),
            navigation_preload: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn transition(&self, from: &[WorkerState], to: WorkerState) -> Result<()> {
        let current = self.state();
        ensure!(
            from.contains(&current),
            "invalid lifecycle transition {current} -> {to}"
        );
        self.state.send_replace(to);
        Ok(())
    }

    /// Marks all open pages as controlled by this worker version.
    pub fn claim_clients(&self) {
        self.clients_claimed.store(true, Ordering::SeqCst);
    }

    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::SeqCst)
    }

    pub fn enable_navigation_preload(&self) {
        self.navigation_preload.store(true, Ordering::SeqCst);
    }

    pub fn navigation_preload_enabled(&self) -> bool {
        self.navigation_preload.load(Ordering::SeqCst)
    }

    /// A newer version took control; this instance stops intercepting.
    pub fn supersede(&self) {
        self.state.send_replace(WorkerState::Superseded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_install_activate_sequence() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), WorkerState::Installing);

        lifecycle
            .transition(&[WorkerState::Installing], WorkerState::Waiting)
            .unwrap();
        lifecycle
            .transition(&[WorkerState::Waiting], WorkerState::Activating)
            .unwrap();
        lifecycle
            .transition(&[WorkerState::Activating], WorkerState::Active)
            .unwrap();
        assert_eq!(lifecycle.state(), WorkerState::Active);
    }

    #[test]
    fn rejects_out_of_order_transitions() {
        let lifecycle = Lifecycle::new();
        let result = lifecycle.transition(&[WorkerState::Waiting], WorkerState::Activating);
        assert!(result.is_err());
        assert_eq!(lifecycle.state(), WorkerState::Installing);
    }

    #[tokio::test]
    async fn state_changes_are_observable() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.subscribe();
        lifecycle
            .transition(&[WorkerState::Installing], WorkerState::Waiting)
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), WorkerState::Waiting);
    }

    #[test]
    fn supersede_is_always_allowed() {
        let lifecycle = Lifecycle::new();
        lifecycle.supersede();
        assert_eq!(lifecycle.state(), WorkerState::Superseded);
    }
}
