// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::IpAddr;
use std::time::Duration;

use clap::{ArgAction, Args};

use crate::error::UrError;

/// Characters with routing meaning in a topic pattern.
const WILDCARDS: &[char] = &['.', '*', '#', '>'];

/// Broker connection settings.
#[derive(Debug, Clone, Args)]
pub struct BrokerConfig {
    /// Broker login.
    #[arg(long = "broker-login", env = "UR_BROKER_LOGIN", default_value = "guest")]
    pub login: String,

    /// Broker password.
    #[arg(long = "broker-password", env = "UR_BROKER_PASSWORD", default_value = "guest")]
    pub password: String,

    /// Broker host.
    #[arg(long = "broker-host", env = "UR_BROKER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Broker port.
    #[arg(long = "broker-port", env = "UR_BROKER_PORT", default_value = "4222")]
    pub port: u16,

    /// Heartbeat interval in ms. The link is declared dead after 2.5x this
    /// without a heartbeat or delivery.
    #[arg(long, env = "UR_HEARTBEAT_MS", default_value = "15000")]
    pub heartbeat_ms: u64,

    /// Upper bound on a single connect attempt, in ms.
    #[arg(long, env = "UR_CONNECT_TIMEOUT_MS", default_value = "10000")]
    pub connect_timeout_ms: u64,

    /// Reconnect with backoff after the link fails.
    #[arg(long, env = "UR_RECONNECT", default_value_t = true, action = ArgAction::Set)]
    pub reconnect: bool,

    /// Bind `ur.#` and see all agent traffic, not only replies to us.
    #[arg(long, env = "UR_PROMISCUOUS")]
    pub promiscuous: bool,

    /// Consumer name; the reply queue is `<consumer>.<uuid>`.
    #[arg(long, env = "UR_CONSUMER", default_value = "urclient")]
    pub consumer: String,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), UrError> {
        if self.host.is_empty() {
            return Err(UrError::validation("broker host must not be empty"));
        }
        if self.port == 0 {
            return Err(UrError::validation("broker port must not be 0"));
        }
        if self.heartbeat_ms == 0 {
            return Err(UrError::validation("heartbeat must be greater than 0"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(UrError::validation("connect timeout must be greater than 0"));
        }
        if self.consumer.is_empty() {
            return Err(UrError::validation("consumer name must not be empty"));
        }
        if self.consumer.contains(WILDCARDS) {
            return Err(UrError::validation(format!(
                "consumer name must not contain any of . * # >: {:?}",
                self.consumer
            )));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// How long the link may stay silent before it is declared dead.
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.saturating_mul(5) / 2)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Short timings for tests against the in-memory broker.
    #[doc(hidden)]
    pub fn test() -> Self {
        Self {
            login: "guest".into(),
            password: "guest".into(),
            host: "memory".into(),
            port: 1,
            heartbeat_ms: 200,
            connect_timeout_ms: 500,
            reconnect: true,
            promiscuous: false,
            consumer: "urtest".into(),
        }
    }
}

/// Everything a [`UrClient`](crate::client::UrClient) needs.
#[derive(Debug, Clone, Args)]
pub struct ClientConfig {
    #[command(flatten)]
    pub broker: BrokerConfig,

    /// Serve the file side-channel (needed by send-file and recv-file).
    #[arg(long, env = "UR_ENABLE_HTTP", default_value_t = true, action = ArgAction::Set)]
    pub enable_http: bool,

    /// Address for the file side-channel; agents fetch from and push to it.
    #[arg(long, env = "UR_BIND_IP")]
    pub bind_ip: Option<IpAddr>,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), UrError> {
        self.broker.validate()?;
        if self.enable_http && self.bind_ip.is_none() {
            return Err(UrError::validation("bind_ip is required when http is enabled"));
        }
        Ok(())
    }

    #[doc(hidden)]
    pub fn test() -> Self {
        Self {
            broker: BrokerConfig::test(),
            enable_http: true,
            bind_ip: Some(IpAddr::from([127, 0, 0, 1])),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
