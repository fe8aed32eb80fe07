//! Per-phase cancellation token derivation.
//!
//! Every operation accepts an explicit [`tokio_util::sync::CancellationToken`].
//! This module centralises how the run-level token is split into
//! independently-deadlined child tokens for the connect, setup, test, and
//! teardown phases, per the redesign guidance to avoid smuggling
//! cancellation through global state.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// The phases a single entity run passes through, each with its own
/// cancellation scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Establishing or verifying the DUT connection.
    Connect,
    /// Fixture setup.
    Setup,
    /// The test body itself.
    Test,
    /// Fixture teardown/reset.
    Teardown,
}

impl Phase {
    /// A short, stable name used in log lines and error messages.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Setup => "setup",
            Self::Test => "test",
            Self::Teardown => "teardown",
        }
    }
}

/// A cancellation token scoped to one phase, with its own deadline.
#[derive(Debug, Clone)]
pub struct PhaseToken {
    /// Which phase this token governs.
    pub phase: Phase,
    token: CancellationToken,
}

impl PhaseToken {
    /// Derives a child token from `parent`, scoped to `phase`, and spawns a
    /// background task that cancels it after `deadline` unless the parent
    /// cancels first.
    #[must_use]
    pub fn derive(parent: &CancellationToken, phase: Phase, deadline: Duration) -> Self {
        let token = parent.child_token();
        let watcher = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = sleep(deadline) => watcher.cancel(),
                () = watcher.cancelled() => {}
            }
        });
        Self { phase, token }
    }

    /// The underlying token, for passing to cancellable operations.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether this phase has been cancelled (by its own deadline or by the
    /// parent).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Phase::Connect, "connect")]
    #[case(Phase::Setup, "setup")]
    #[case(Phase::Test, "test")]
    #[case(Phase::Teardown, "teardown")]
    fn label_matches_phase(#[case] phase: Phase, #[case] expected: &str) {
        assert_eq!(phase.label(), expected);
    }

    #[tokio::test]
    async fn child_token_cancels_when_parent_cancels() {
        let parent = CancellationToken::new();
        let phase = PhaseToken::derive(&parent, Phase::Setup, Duration::from_secs(60));
        parent.cancel();
        phase.token().cancelled().await;
        assert!(phase.is_cancelled());
    }

    #[tokio::test]
    async fn phase_token_cancels_on_its_own_deadline() {
        let parent = CancellationToken::new();
        let phase = PhaseToken::derive(&parent, Phase::Test, Duration::from_millis(10));
        phase.token().cancelled().await;
        assert!(phase.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
