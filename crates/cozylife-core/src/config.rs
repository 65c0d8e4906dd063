use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::QueryMode;

pub const DEFAULT_PORT: u16 = 5555;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,
    #[error("port must not be zero")]
    ZeroPort,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("failure threshold must be at least 1")]
    ZeroThreshold,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub retry_delay: Duration,
    pub query_mode: QueryMode,
}

impl Endpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_secs(30),
            query_mode: QueryMode::Attributes,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_query_mode(mut self, mode: QueryMode) -> Self {
        self.query_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("connect timeout"));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("read timeout"));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    pub refresh_timeout: Duration,
    pub failure_threshold: u32,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("poll interval"));
        }
        if self.refresh_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("refresh timeout"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        Ok(())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            refresh_timeout: Duration::from_secs(5),
            failure_threshold: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_match_device_firmware() {
        let endpoint = Endpoint::new("192.168.2.200");

        assert_eq!(endpoint.port, 5555);
        assert_eq!(endpoint.connect_timeout, Duration::from_secs(3));
        assert_eq!(endpoint.read_timeout, Duration::from_secs(2));
        assert_eq!(endpoint.retry_delay, Duration::from_secs(30));
        assert_eq!(endpoint.query_mode, QueryMode::Attributes);
        assert_eq!(endpoint.to_string(), "192.168.2.200:5555");
    }

    #[test]
    fn endpoint_rejects_blank_host_and_zero_port() {
        assert_eq!(Endpoint::new("  ").validate(), Err(ConfigError::EmptyHost));
        assert_eq!(
            Endpoint::new("10.0.0.2").with_port(0).validate(),
            Err(ConfigError::ZeroPort)
        );
        assert!(Endpoint::new("10.0.0.2").validate().is_ok());
    }

    #[test]
    fn coordinator_config_requires_positive_threshold() {
        let config = CoordinatorConfig {
            failure_threshold: 0,
            ..CoordinatorConfig::default()
        };

        assert_eq!(config.validate(), Err(ConfigError::ZeroThreshold));
        assert!(CoordinatorConfig::default().validate().is_ok());
    }
}
