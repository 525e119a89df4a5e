// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Connection, retry and logging configuration for a `TpmContext`

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default TCP port of the software TPM 1.2 server
pub const DEFAULT_SERVER_PORT: u16 = 6545;

/// Default character device
pub const DEFAULT_DEVICE: &str = "/dev/tpm0";

/// Where the TPM lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Tcp { host: String, port: u16 },
    Device { path: PathBuf },
    Unix { path: PathBuf },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Device {
            path: PathBuf::from(DEFAULT_DEVICE),
        }
    }
}

/// Bounded retry of `TPM_RETRY` for the ordinals that allow it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    #[serde(with = "secs")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 7,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Emit every command and response buffer hex-encoded at debug level
    pub dump_wire: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpmConfig {
    pub transport: TransportConfig,
    /// Upper bound on one request/response round trip
    #[serde(with = "secs")]
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub log: LogConfig,
    pub max_response_size: usize,
}

impl Default for TpmConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            log: LogConfig::default(),
            max_response_size: 1024 * 1024,
        }
    }
}

impl TpmConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: TransportConfig::Tcp {
                host: host.into(),
                port,
            },
            ..Default::default()
        }
    }

    pub fn device(path: impl Into<PathBuf>) -> Self {
        Self {
            transport: TransportConfig::Device { path: path.into() },
            ..Default::default()
        }
    }

    /// Build from `TPM_UNIX_SOCKET`, `TPM_SERVER_NAME`/`TPM_SERVER_PORT`,
    /// `TPM_DEVICE` and `TPM_TIMEOUT`, in that order of precedence
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let transport = if let Some(path) = lookup("TPM_UNIX_SOCKET") {
            TransportConfig::Unix { path: path.into() }
        } else if let Some(host) = lookup("TPM_SERVER_NAME") {
            let port = match lookup("TPM_SERVER_PORT") {
                Some(port) => port.trim().parse().map_err(|_| {
                    Error::Config(format!("TPM_SERVER_PORT is not a port number: {port}"))
                })?,
                None => DEFAULT_SERVER_PORT,
            };
            TransportConfig::Tcp { host, port }
        } else {
            TransportConfig::Device {
                path: lookup("TPM_DEVICE")
                    .unwrap_or_else(|| DEFAULT_DEVICE.to_string())
                    .into(),
            }
        };

        let mut config = Self {
            transport,
            ..Default::default()
        };
        if let Some(timeout) = lookup("TPM_TIMEOUT") {
            let secs: u64 = timeout.trim().parse().map_err(|_| {
                Error::Config(format!("TPM_TIMEOUT is not a number of seconds: {timeout}"))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_wire_dump(mut self, dump_wire: bool) -> Self {
        self.log.dump_wire = dump_wire;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.retry.attempts == 0 {
            return Err(Error::Config("retry attempts must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be nonzero".into()));
        }
        if self.max_response_size < crate::constants::HEADER_SIZE {
            return Err(Error::Config(format!(
                "max response size {} is smaller than a response header",
                self.max_response_size
            )));
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
