// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fault injection for crash-recovery tests.
//!
//! A [`FailPoints`] registry is shared (via `Arc`) between a test and the code
//! under test. Arming a point makes the next [`FailPoints::check`] on it return
//! [`SagaError::Injected`]; the point then disarms itself. The step runner turns
//! that error into a simulated crash: the operation is left untouched and no
//! compensation runs.
//!
//! Step boundaries use the name `"{saga}/{Step:?}"`, e.g.
//! `"allocate-vm/AllocateTunnel"`. Sagas may define additional in-step points.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::error::SagaError;

/// Registry of armed fault-injection points.
#[derive(Debug, Default)]
pub struct FailPoints {
    armed: Mutex<HashMap<String, u32>>,
}

impl FailPoints {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `point` to fire once.
    pub fn arm(&self, point: impl Into<String>) {
        self.arm_times(point, 1);
    }

    /// Arm `point` to fire on its next `times` checks.
    pub fn arm_times(&self, point: impl Into<String>, times: u32) {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        *armed.entry(point.into()).or_insert(0) += times;
    }

    /// Whether `point` is still armed.
    pub fn is_armed(&self, point: &str) -> bool {
        let armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        armed.get(point).is_some_and(|n| *n > 0)
    }

    /// Disarm every point.
    pub fn clear(&self) {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Fire `point` if armed.
    pub fn check(&self, point: &str) -> Result<(), SagaError> {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        match armed.get_mut(point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                if *remaining == 0 {
                    armed.remove(point);
                }
                warn!(point, "Injected failure fired");
                Err(SagaError::Injected(point.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Check an optional registry. Code built without fault injection passes `None`.
pub fn check(fail_points: Option<&FailPoints>, point: &str) -> Result<(), SagaError> {
    match fail_points {
        Some(fp) => fp.check(point),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once() {
        let fp = FailPoints::new();
        assert!(fp.check("a").is_ok());

        fp.arm("a");
        assert!(fp.is_armed("a"));
        let err = fp.check("a").unwrap_err();
        assert!(err.is_injected());
        assert!(!fp.is_armed("a"));
        assert!(fp.check("a").is_ok());
    }

    #[test]
    fn test_arm_times_and_clear() {
        let fp = FailPoints::new();
        fp.arm_times("b", 2);
        assert!(fp.check("b").is_err());
        assert!(fp.check("b").is_err());
        assert!(fp.check("b").is_ok());

        fp.arm("c");
        fp.clear();
        assert!(check(Some(&fp), "c").is_ok());
        assert!(check(None, "c").is_ok());
    }
}
