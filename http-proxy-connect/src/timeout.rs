// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// # Adaptive proxy timeouts
//
// The time allowed for the nested transport connect is derived from
// the HTTP round trip time estimate: `multiplier * rtt`, clamped to
// `[min, max]`. The tunnel phase that follows always gets the fixed
// `TUNNEL_TIMEOUT`.

use crate::error::{Error, Result};
use crate::params::HttpProxySocketParams;
use log::warn;
use std::collections::HashMap;
use std::time::Duration;

/// Time allowed for the tunnel handshake once the transport is up.
#[cfg(any(target_os = "android", target_os = "ios"))]
pub const TUNNEL_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(not(any(target_os = "android", target_os = "ios")))]
pub const TUNNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport phase budget when no RTT estimate is available. Zero
/// leaves the timeout to the nested job.
#[cfg(any(target_os = "android", target_os = "ios"))]
pub const DEFAULT_NESTED_CONNECTION_TIMEOUT: Duration = TUNNEL_TIMEOUT;
#[cfg(not(any(target_os = "android", target_os = "ios")))]
pub const DEFAULT_NESTED_CONNECTION_TIMEOUT: Duration = Duration::ZERO;

const MIN_TIMEOUT_PARAM: &str = "min_proxy_connection_timeout_seconds";
const MAX_TIMEOUT_PARAM: &str = "max_proxy_connection_timeout_seconds";
const SSL_MULTIPLIER_PARAM: &str = "ssl_http_rtt_multiplier";
const NON_SSL_MULTIPLIER_PARAM: &str = "non_ssl_http_rtt_multiplier";

/// Source of the HTTP round trip time estimate.
pub trait NetworkQualityEstimator: Send + Sync {
    fn http_rtt(&self) -> Option<Duration>;
}

/// Bounds and multipliers of the adaptive transport timeout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyTimeoutConfig {
    min_proxy_connection_timeout: Duration,
    max_proxy_connection_timeout: Duration,
    ssl_http_rtt_multiplier: u32,
    non_ssl_http_rtt_multiplier: u32,
}

impl Default for ProxyTimeoutConfig {
    fn default() -> Self {
        ProxyTimeoutConfig {
            min_proxy_connection_timeout: Duration::from_secs(8),
            max_proxy_connection_timeout: Duration::from_secs(30),
            ssl_http_rtt_multiplier: 10,
            non_ssl_http_rtt_multiplier: 5,
        }
    }
}

impl ProxyTimeoutConfig {
    /// # Errors
    /// Returns `Error::InvalidTimeoutConfig` when a multiplier is zero
    /// or `min` is greater than `max`.
    pub fn new(
        min_proxy_connection_timeout: Duration,
        max_proxy_connection_timeout: Duration,
        ssl_http_rtt_multiplier: u32,
        non_ssl_http_rtt_multiplier: u32,
    ) -> Result<Self> {
        if ssl_http_rtt_multiplier == 0 || non_ssl_http_rtt_multiplier == 0 {
            return Err(Error::InvalidTimeoutConfig("multipliers must be positive"));
        }
        if min_proxy_connection_timeout > max_proxy_connection_timeout {
            return Err(Error::InvalidTimeoutConfig("min timeout exceeds max timeout"));
        }
        Ok(ProxyTimeoutConfig {
            min_proxy_connection_timeout,
            max_proxy_connection_timeout,
            ssl_http_rtt_multiplier,
            non_ssl_http_rtt_multiplier,
        })
    }

    /// Builds the config from named string parameters.
    ///
    /// Missing or unparsable parameters take their default value. A
    /// combination that fails validation falls back to the defaults.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let defaults = ProxyTimeoutConfig::default();
        let get = |name: &str, default: u64| -> u64 {
            params.get(name).and_then(|value| value.trim().parse::<u64>().ok()).unwrap_or(default)
        };
        let multiplier = |name: &str, default: u32| -> u32 {
            params.get(name).and_then(|value| value.trim().parse::<u32>().ok()).unwrap_or(default)
        };
        let result = ProxyTimeoutConfig::new(
            Duration::from_secs(get(
                MIN_TIMEOUT_PARAM,
                defaults.min_proxy_connection_timeout.as_secs(),
            )),
            Duration::from_secs(get(
                MAX_TIMEOUT_PARAM,
                defaults.max_proxy_connection_timeout.as_secs(),
            )),
            multiplier(SSL_MULTIPLIER_PARAM, defaults.ssl_http_rtt_multiplier),
            multiplier(NON_SSL_MULTIPLIER_PARAM, defaults.non_ssl_http_rtt_multiplier),
        );
        match result {
            Ok(config) => config,
            Err(err) => {
                warn!("Ignoring proxy timeout params: {}", err);
                defaults
            }
        }
    }

    pub fn min_proxy_connection_timeout(&self) -> Duration {
        self.min_proxy_connection_timeout
    }

    pub fn max_proxy_connection_timeout(&self) -> Duration {
        self.max_proxy_connection_timeout
    }

    pub fn ssl_http_rtt_multiplier(&self) -> u32 {
        self.ssl_http_rtt_multiplier
    }

    pub fn non_ssl_http_rtt_multiplier(&self) -> u32 {
        self.non_ssl_http_rtt_multiplier
    }

    /// Transport phase budget for a secure or insecure proxy.
    pub fn nested_connection_timeout(&self, is_secure: bool, http_rtt: Option<Duration>) -> Duration {
        let Some(rtt) = http_rtt else {
            return DEFAULT_NESTED_CONNECTION_TIMEOUT;
        };
        let multiplier =
            if is_secure { self.ssl_http_rtt_multiplier } else { self.non_ssl_http_rtt_multiplier };
        rtt.saturating_mul(multiplier)
            .clamp(self.min_proxy_connection_timeout, self.max_proxy_connection_timeout)
    }
}

/// The timeout for the nested connect of `params`, replacing the
/// nested job's own TCP/TLS timeouts.
pub fn alternate_nested_connection_timeout(
    params: &HttpProxySocketParams,
    estimator: Option<&dyn NetworkQualityEstimator>,
    config: &ProxyTimeoutConfig,
) -> Duration {
    let is_secure = params.ssl_params().is_some();
    let http_rtt = estimator.and_then(|estimator| estimator.http_rtt());
    config.nested_connection_timeout(is_secure, http_rtt)
}
