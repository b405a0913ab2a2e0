// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";
const ENV_PREFIX: &str = "ASG_";

/// Tunables of the ring transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsgConfig {
    /// First sleep of the full-ring backoff, in microseconds.
    pub backoff_initial_us: u64,
    /// Cap of the full-ring backoff, in microseconds.
    pub backoff_max_us: u64,
    /// How long a producer may wait on a full ring before a stall is reported.
    pub watchdog_ms: u64,
    /// Watchdog intervals retried by the health monitor before a stall surfaces.
    pub stall_retries: u32,
    /// Attempts made by `BlobResource::wait` while the kernel reports busy.
    pub wait_busy_retries: u32,
    /// Bounded sleep of an idle consumer between two ring checks.
    pub consumer_idle_timeout_ms: u64,
    /// Initial capacity of the staging area used for wrapping writes.
    pub staging_initial_capacity: usize,
    pub render_node: String,
}

impl Default for AsgConfig {
    fn default() -> Self {
        Self {
            backoff_initial_us: 1,
            backoff_max_us: 1000,
            watchdog_ms: 2000,
            stall_retries: 0,
            wait_busy_retries: 100,
            consumer_idle_timeout_ms: 10,
            staging_initial_capacity: 4096,
            render_node: DEFAULT_RENDER_NODE.to_string(),
        }
    }
}

impl AsgConfig {
    /// Builds a configuration from the defaults, an optional YAML file and
    /// `ASG_` prefixed environment variables, in increasing precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            debug!("Loading ring transport configuration from {}", path.display());
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| Error::Config(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_initial_us == 0 {
            return Err(Error::InvalidConfig("backoff_initial_us must be non-zero"));
        }
        if self.backoff_max_us < self.backoff_initial_us {
            return Err(Error::InvalidConfig(
                "backoff_max_us must not be smaller than backoff_initial_us",
            ));
        }
        if self.watchdog_ms == 0 {
            return Err(Error::InvalidConfig("watchdog_ms must be non-zero"));
        }
        if self.consumer_idle_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "consumer_idle_timeout_ms must be non-zero",
            ));
        }
        Ok(())
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_micros(self.backoff_initial_us)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_micros(self.backoff_max_us)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn consumer_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_idle_timeout_ms)
    }
}
