// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step results.

use std::time::Duration;

/// Delay used when a step asks to be restarted without an explicit delay.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Outcome of one saga step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The step's effect is already present; move on without side effects.
    AlreadyDone,
    /// The step succeeded; move on to the next step.
    Continue,
    /// Transient failure or not-ready-yet; run the same step again after the delay.
    Restart(Duration),
    /// The saga is done, successfully or with its failure already recorded.
    Finish,
}

impl StepResult {
    /// Restart after [`DEFAULT_RESTART_DELAY`].
    pub const fn restart() -> Self {
        Self::Restart(DEFAULT_RESTART_DELAY)
    }

    /// Restart after `delay`.
    pub const fn restart_after(delay: Duration) -> Self {
        Self::Restart(delay)
    }

    /// Whether the runner moves on to the next step.
    pub fn proceeds(&self) -> bool {
        matches!(self, Self::AlreadyDone | Self::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_delays() {
        assert_eq!(StepResult::restart(), StepResult::Restart(Duration::from_secs(1)));
        assert_eq!(
            StepResult::restart_after(Duration::from_millis(250)),
            StepResult::Restart(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_proceeds() {
        assert!(StepResult::AlreadyDone.proceeds());
        assert!(StepResult::Continue.proceeds());
        assert!(!StepResult::restart().proceeds());
        assert!(!StepResult::Finish.proceeds());
    }
}
