use crate::error::BotError;
use tracing::debug;

/// Bot lifecycle. The engine moves strictly along this machine; invalid
/// transitions are rejected instead of silently tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Initializing,
    Connecting,
    SyncingState,
    Ready,
    ShuttingDown,
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BotState::Initializing => "Initializing",
            BotState::Connecting => "Connecting",
            BotState::SyncingState => "SyncingState",
            BotState::Ready => "Ready",
            BotState::ShuttingDown => "ShuttingDown",
        };
        write!(f, "{s}")
    }
}

pub struct Lifecycle {
    state: BotState,
}

impl Lifecycle {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            state: BotState::Initializing,
        }
    }

    pub fn state(&self) -> BotState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == BotState::Ready
    }

    fn allowed(from: BotState, to: BotState) -> bool {
        use BotState::*;
        match from {
            Initializing => matches!(to, Connecting | ShuttingDown),
            Connecting => matches!(to, SyncingState | ShuttingDown),
            SyncingState => matches!(to, Ready | ShuttingDown),
            // Ready can fall back to Connecting (feed lost) or re-sync.
            Ready => matches!(to, Connecting | SyncingState | ShuttingDown),
            ShuttingDown => false,
        }
    }

    pub fn transition_to(&mut self, to: BotState) -> Result<(), BotError> {
        if to == self.state {
            return Ok(());
        }
        if !Self::allowed(self.state, to) {
            return Err(BotError::LifecycleError(format!(
                "invalid transition {} -> {}",
                self.state, to
            )));
        }
        debug!(from = %self.state, to = %to, "Lifecycle transition");
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_sequence_is_accepted() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.state(), BotState::Initializing);
        lc.transition_to(BotState::Connecting).unwrap();
        lc.transition_to(BotState::SyncingState).unwrap();
        lc.transition_to(BotState::Ready).unwrap();
        assert!(lc.is_ready());
        lc.transition_to(BotState::ShuttingDown).unwrap();
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut lc = Lifecycle::new();
        assert!(lc.transition_to(BotState::Ready).is_err());
        assert!(lc.transition_to(BotState::SyncingState).is_err());

        lc.transition_to(BotState::Connecting).unwrap();
        assert!(lc.transition_to(BotState::Ready).is_err());
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let mut lc = Lifecycle::new();
        lc.transition_to(BotState::ShuttingDown).unwrap();
        for next in [
            BotState::Initializing,
            BotState::Connecting,
            BotState::SyncingState,
            BotState::Ready,
        ] {
            assert!(lc.transition_to(next).is_err());
        }
        // Re-entering the current state is a no-op, not an error.
        assert!(lc.transition_to(BotState::ShuttingDown).is_ok());
    }

    #[test]
    fn test_ready_can_resync_after_reconnect() {
        let mut lc = Lifecycle::new();
        lc.transition_to(BotState::Connecting).unwrap();
        lc.transition_to(BotState::SyncingState).unwrap();
        lc.transition_to(BotState::Ready).unwrap();

        // Feed drop: back to Connecting, then resync into Ready.
        lc.transition_to(BotState::Connecting).unwrap();
        lc.transition_to(BotState::SyncingState).unwrap();
        lc.transition_to(BotState::Ready).unwrap();
    }
}
