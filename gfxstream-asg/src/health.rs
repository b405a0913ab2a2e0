// Stream watchdog
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use log::{error, warn};

use crate::config::AsgConfig;

/// What a stalled writer should do next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StallAction {
    /// Keep waiting for another watchdog interval.
    Retry,
    /// Give up and surface `StreamStalled`.
    Fail,
}

/// Collects stall reports from the streams sharing it and decides whether a
/// stalled writer keeps waiting.
#[derive(Debug)]
pub struct HealthMonitor {
    watchdog: Duration,
    stall_retries: u32,
    stalls: AtomicU64,
    last_stall: Mutex<Option<Duration>>,
}

impl HealthMonitor {
    pub fn new(watchdog: Duration, stall_retries: u32) -> Self {
        Self {
            watchdog,
            stall_retries,
            stalls: AtomicU64::new(0),
            last_stall: Mutex::new(None),
        }
    }

    pub fn from_config(config: &AsgConfig) -> Self {
        Self::new(config.watchdog(), config.stall_retries)
    }

    pub const fn watchdog(&self) -> Duration {
        self.watchdog
    }

    /// The writer on `resource_id` has been waiting `waited` for ring space;
    /// `attempt` counts the watchdog intervals already reported for this
    /// wait, starting at zero.
    pub fn report_stall(&self, resource_id: u32, waited: Duration, attempt: u32) -> StallAction {
        self.stalls.fetch_add(1, Ordering::Relaxed);
        *self.last_stall.lock().unwrap() = Some(waited);

        if attempt < self.stall_retries {
            warn!(
                "stream {resource_id}: no progress for {waited:?}, retry {}/{}",
                attempt + 1,
                self.stall_retries
            );
            StallAction::Retry
        } else {
            error!("stream {resource_id}: stalled for {waited:?}, giving up");
            StallAction::Fail
        }
    }

    /// Stalls reported since creation.
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    pub fn last_stall(&self) -> Option<Duration> {
        *self.last_stall.lock().unwrap()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::from_config(&AsgConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        let monitor = HealthMonitor::new(Duration::from_millis(5), 2);
        let waited = Duration::from_millis(5);
        assert_eq!(monitor.report_stall(1, waited, 0), StallAction::Retry);
        assert_eq!(monitor.report_stall(1, waited * 2, 1), StallAction::Retry);
        assert_eq!(monitor.report_stall(1, waited * 3, 2), StallAction::Fail);
        assert_eq!(monitor.stalls(), 3);
        assert_eq!(monitor.last_stall(), Some(waited * 3));
    }

    #[test]
    fn test_defaults() {
        let monitor = HealthMonitor::default();
        assert_eq!(monitor.watchdog(), Duration::from_secs(2));
        assert_eq!(monitor.last_stall(), None);
        assert_eq!(
            monitor.report_stall(7, Duration::from_secs(2), 0),
            StallAction::Fail
        );
    }
}
