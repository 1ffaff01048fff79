use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionBackend {
    Local,
    Redis { url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Bearer token guarding the MCP routes; `None` leaves them open.
    pub api_token: Option<String>,
    pub bind_addr: String,
    pub bind_port: u16,
    pub session_backend: SessionBackend,
    pub session_key_prefix: String,
    pub session_ttl: Duration,
    pub session_sweep_interval: Duration,
    /// Zero disables rate limiting.
    pub rate_limit_capacity: u64,
    pub rate_limit_refill_per_sec: f64,
    pub progress_stale_after: Duration,
    pub progress_sweep_interval: Duration,
    pub tool_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("SESSION_BACKEND must be 'local' or 'redis'")]
    InvalidSessionBackend,
    #[error("REDIS_URL is required when SESSION_BACKEND=redis")]
    MissingRedisUrl,
    #[error("{0} must be a positive integer")]
    InvalidNumber(&'static str),
    #[error("RATE_LIMIT_REFILL_PER_SEC must be a finite non-negative number")]
    InvalidRefillRate,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_token = var("MCP_API_TOKEN");
        let bind_addr = var("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = var("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let session_backend = match var("SESSION_BACKEND").as_deref() {
            None | Some("local") => SessionBackend::Local,
            Some("redis") => SessionBackend::Redis {
                url: var("REDIS_URL").ok_or(ConfigError::MissingRedisUrl)?,
            },
            Some(_) => return Err(ConfigError::InvalidSessionBackend),
        };
        let session_key_prefix =
            var("SESSION_KEY_PREFIX").unwrap_or_else(|| "mcp:session:".to_string());

        let session_ttl = Duration::from_secs(positive(&var, "SESSION_TTL_SECS", 1800)?);
        let session_sweep_interval =
            Duration::from_secs(positive(&var, "SESSION_SWEEP_SECS", 60)?);

        let rate_limit_capacity = number(&var, "RATE_LIMIT_CAPACITY", 100)?;
        let rate_limit_refill_per_sec = var("RATE_LIMIT_REFILL_PER_SEC")
            .map(|value| {
                value
                    .parse::<f64>()
                    .ok()
                    .filter(|rate| rate.is_finite() && *rate >= 0.0)
                    .ok_or(ConfigError::InvalidRefillRate)
            })
            .transpose()?
            .unwrap_or(10.0);

        let progress_stale_after =
            Duration::from_secs(positive(&var, "PROGRESS_STALE_SECS", 600)?);
        let progress_sweep_interval =
            Duration::from_secs(positive(&var, "PROGRESS_SWEEP_SECS", 60)?);
        let tool_timeout = match number(&var, "TOOL_TIMEOUT_SECS", 30)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let config = Self {
            api_token,
            bind_addr,
            bind_port,
            session_backend,
            session_key_prefix,
            session_ttl,
            session_sweep_interval,
            rate_limit_capacity,
            rate_limit_refill_per_sec,
            progress_stale_after,
            progress_sweep_interval,
            tool_timeout,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn number<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    var(key)
        .map(|value| value.parse::<T>().map_err(|_| ConfigError::InvalidNumber(key)))
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn positive(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match number(var, key, default)? {
        0 => Err(ConfigError::InvalidNumber(key)),
        value => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn parse_defaults() {
        let config = parse(&[]).expect("config should parse");
        assert_eq!(config.api_token, None);
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.session_backend, SessionBackend::Local);
        assert_eq!(config.session_key_prefix, "mcp:session:");
        assert_eq!(config.session_ttl, Duration::from_secs(1800));
        assert_eq!(config.rate_limit_capacity, 100);
        assert_eq!(config.rate_limit_refill_per_sec, 10.0);
        assert_eq!(config.progress_stale_after, Duration::from_secs(600));
        assert_eq!(config.tool_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn blank_token_means_no_auth() {
        let config = parse(&[("MCP_API_TOKEN", "   ")]).expect("config should parse");
        assert_eq!(config.api_token, None);
    }

    #[test]
    fn redis_backend_needs_url() {
        let err = parse(&[("SESSION_BACKEND", "redis")]).expect_err("expected missing url");
        assert!(matches!(err, ConfigError::MissingRedisUrl));

        let config = parse(&[
            ("SESSION_BACKEND", "redis"),
            ("REDIS_URL", "redis://127.0.0.1:6379"),
        ])
        .expect("config should parse");
        assert_eq!(
            config.session_backend,
            SessionBackend::Redis {
                url: "redis://127.0.0.1:6379".to_string()
            }
        );
    }

    #[test]
    fn unknown_backend_fails() {
        let err = parse(&[("SESSION_BACKEND", "memcached")]).expect_err("expected error");
        assert!(matches!(err, ConfigError::InvalidSessionBackend));
    }

    #[test]
    fn zero_ttl_is_rejected_but_zero_capacity_disables_limiting() {
        let err = parse(&[("SESSION_TTL_SECS", "0")]).expect_err("expected invalid ttl");
        assert!(matches!(err, ConfigError::InvalidNumber("SESSION_TTL_SECS")));

        let config = parse(&[("RATE_LIMIT_CAPACITY", "0"), ("TOOL_TIMEOUT_SECS", "0")])
            .expect("config should parse");
        assert_eq!(config.rate_limit_capacity, 0);
        assert_eq!(config.tool_timeout, None);
    }

    #[test]
    fn invalid_numbers_fail() {
        assert!(matches!(
            parse(&[("BIND_PORT", "99999")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            parse(&[("RATE_LIMIT_REFILL_PER_SEC", "-1")]),
            Err(ConfigError::InvalidRefillRate)
        ));
        assert!(matches!(
            parse(&[("BIND_ADDR", "not an address")]),
            Err(ConfigError::InvalidSocket)
        ));
    }
}
