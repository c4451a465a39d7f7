// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Engine configuration
//!
//! Controls the terminology server, the bound on asynchronous evaluation passes,
//! request timeouts and the parsed-expression cache.

use serde::Deserialize;
use std::time::Duration;

/// Default terminology server used when neither the questionnaire nor the caller names one
pub const DEFAULT_TERMINOLOGY_SERVER: &str = "https://tx.fhir.org/r4";

/// Configuration for [`FormEngine`](crate::form::FormEngine) and the async interpreter
///
/// # Examples
///
/// ```rust
/// use octofhir_sdc_forms::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_terminology_server("https://r4.ontoserver.csiro.au/fhir")
///     .with_max_async_iterations(5)
///     .with_terminology_timeout_ms(2000);
/// assert_eq!(config.max_async_iterations, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Base URL of the terminology server. Default: `https://tx.fhir.org/r4`
    pub default_terminology_server: String,

    /// Maximum number of evaluation passes of the asynchronous fixed point.
    /// Exceeding it fails the evaluation. Default: 10
    pub max_async_iterations: usize,

    /// Timeout for a single terminology or resolve request (milliseconds). Default: 5000
    pub terminology_timeout_ms: u64,

    /// Initial state of the enableWhen activation toggle. Default: true
    pub enable_when_activated: bool,

    /// Number of parsed expressions kept in the LRU cache. Default: 1000
    pub expression_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_terminology_server: DEFAULT_TERMINOLOGY_SERVER.to_string(),
            max_async_iterations: 10,
            terminology_timeout_ms: 5000,
            enable_when_activated: true,
            expression_cache_size: 1000,
        }
    }
}

impl EngineConfig {
    /// Create new configuration with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `SDC_TERMINOLOGY_SERVER`, `SDC_MAX_ASYNC_ITERATIONS`
    /// and `SDC_TERMINOLOGY_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(server) = std::env::var("SDC_TERMINOLOGY_SERVER") {
            if !server.trim().is_empty() {
                config.default_terminology_server = server.trim().to_string();
            }
        }
        if let Some(iterations) = env_number::<usize>("SDC_MAX_ASYNC_ITERATIONS") {
            config.max_async_iterations = iterations.max(1);
        }
        if let Some(timeout) = env_number::<u64>("SDC_TERMINOLOGY_TIMEOUT_MS") {
            config.terminology_timeout_ms = timeout;
        }
        config
    }

    /// Set the terminology server base URL
    pub fn with_terminology_server(mut self, url: impl Into<String>) -> Self {
        self.default_terminology_server = url.into();
        self
    }

    /// Set the bound on asynchronous evaluation passes
    pub fn with_max_async_iterations(mut self, iterations: usize) -> Self {
        self.max_async_iterations = iterations.max(1);
        self
    }

    /// Set the per-request terminology timeout
    pub fn with_terminology_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.terminology_timeout_ms = timeout_ms;
        self
    }

    /// Set the initial enableWhen activation state
    pub fn with_enable_when_activated(mut self, activated: bool) -> Self {
        self.enable_when_activated = activated;
        self
    }

    /// Set the parsed-expression cache size
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.expression_cache_size = size;
        self
    }

    /// Per-request timeout as a [`Duration`]
    pub fn terminology_timeout(&self) -> Duration {
        Duration::from_millis(self.terminology_timeout_ms)
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {name}={raw}: not a number");
            None
        }
    }
}
