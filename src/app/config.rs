use crate::error::ProbeError;
use crate::services::driver::{DriverSettings, Pacing};
use crate::services::http_client_pool::{PoolConfig, TransportMode};
use crate::services::transport::{ProxyMode, TransportParams};
use crate::utils::auth::Credentials;
use hyper::{Method, Uri};
use serde::Deserialize;
use std::env;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Layered configuration: defaults, then an optional TOML file, then
/// `PROBE_*` environment variables. Command-line flags are applied on top by
/// the binary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub pool: PoolSettings,
    pub transport: TransportSettings,
    pub driver: RunSettings,
    pub demo: DemoSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub size: usize,
    pub username: Option<String>,
    pub password: Option<String>,
    pub transport_mode: TransportMode,
    pub request_timeout_ms: Option<i64>,
    pub local_address: Option<IpAddr>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 10,
            username: Some("username".to_string()),
            password: Some("password".to_string()),
            transport_mode: TransportMode::PerClient,
            request_timeout_ms: None,
            local_address: None,
        }
    }
}

// Durations are signed so that negative values are reported instead of
// failing deserialization with an opaque type error.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    pub dial_timeout_ms: i64,
    pub keep_alive_ms: i64,
    pub max_idle_conns: i64,
    pub max_idle_conns_per_host: i64,
    pub max_conns_per_host: i64,
    pub idle_conn_timeout_ms: i64,
    pub tls_handshake_timeout_ms: i64,
    pub expect_continue_timeout_ms: i64,
    pub force_attempt_http2: bool,
    pub proxy: ProxyMode,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 30_000,
            keep_alive_ms: 30_000,
            max_idle_conns: 100,
            max_idle_conns_per_host: 100,
            max_conns_per_host: 100,
            idle_conn_timeout_ms: 90_000,
            tls_handshake_timeout_ms: 10_000,
            expect_continue_timeout_ms: 1_000,
            force_attempt_http2: true,
            proxy: ProxyMode::Environment,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    pub target: String,
    pub method: String,
    pub concurrency: usize,
    pub requests_per_task: u64,
    /// When set, tasks run for this long instead of a fixed request count.
    pub duration_ms: Option<i64>,
    pub rounds: usize,
    pub round_pause_ms: i64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            target: "http://localhost:8080/".to_string(),
            method: "GET".to_string(),
            concurrency: 10,
            requests_per_task: 6,
            duration_ms: None,
            rounds: 2,
            round_pause_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DemoSettings {
    pub enabled: bool,
    pub bind: SocketAddr,
    pub delay_ms: i64,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            delay_ms: 50,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ProbeError> {
        let mut config = Config::default();
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults (or `path`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ProbeError> {
        let Some(path) = path else {
            return Config::from_env();
        };
        let mut config = Config::from_file(path)?;
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ProbeError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProbeError::config(format!("cannot read {}: {e}", path.display())))?;
        Config::from_toml(&raw)
            .map_err(|e| ProbeError::config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Applies `PROBE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ProbeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pool = &mut self.pool;
        set(&lookup, "PROBE_POOL_SIZE", &mut pool.size)?;
        set_opt(&lookup, "PROBE_USERNAME", &mut pool.username)?;
        set_opt(&lookup, "PROBE_PASSWORD", &mut pool.password)?;
        set(&lookup, "PROBE_TRANSPORT_MODE", &mut pool.transport_mode)?;
        set_opt(&lookup, "PROBE_REQUEST_TIMEOUT_MS", &mut pool.request_timeout_ms)?;
        set_opt(&lookup, "PROBE_LOCAL_ADDRESS", &mut pool.local_address)?;

        let transport = &mut self.transport;
        set(&lookup, "PROBE_DIAL_TIMEOUT_MS", &mut transport.dial_timeout_ms)?;
        set(&lookup, "PROBE_KEEP_ALIVE_MS", &mut transport.keep_alive_ms)?;
        set(&lookup, "PROBE_MAX_IDLE_CONNS", &mut transport.max_idle_conns)?;
        set(&lookup, "PROBE_MAX_IDLE_CONNS_PER_HOST", &mut transport.max_idle_conns_per_host)?;
        set(&lookup, "PROBE_MAX_CONNS_PER_HOST", &mut transport.max_conns_per_host)?;
        set(&lookup, "PROBE_IDLE_CONN_TIMEOUT_MS", &mut transport.idle_conn_timeout_ms)?;
        set(&lookup, "PROBE_TLS_HANDSHAKE_TIMEOUT_MS", &mut transport.tls_handshake_timeout_ms)?;
        set(&lookup, "PROBE_EXPECT_CONTINUE_TIMEOUT_MS", &mut transport.expect_continue_timeout_ms)?;
        set(&lookup, "PROBE_FORCE_HTTP2", &mut transport.force_attempt_http2)?;
        set(&lookup, "PROBE_PROXY", &mut transport.proxy)?;

        let driver = &mut self.driver;
        set(&lookup, "PROBE_TARGET", &mut driver.target)?;
        set(&lookup, "PROBE_METHOD", &mut driver.method)?;
        set(&lookup, "PROBE_CONCURRENCY", &mut driver.concurrency)?;
        set(&lookup, "PROBE_REQUESTS_PER_TASK", &mut driver.requests_per_task)?;
        set_opt(&lookup, "PROBE_DURATION_MS", &mut driver.duration_ms)?;
        set(&lookup, "PROBE_ROUNDS", &mut driver.rounds)?;
        set(&lookup, "PROBE_ROUND_PAUSE_MS", &mut driver.round_pause_ms)?;

        let demo = &mut self.demo;
        set(&lookup, "PROBE_DEMO_ENABLED", &mut demo.enabled)?;
        set(&lookup, "PROBE_DEMO_BIND", &mut demo.bind)?;
        set(&lookup, "PROBE_DEMO_DELAY_MS", &mut demo.delay_ms)?;

        Ok(())
    }

    pub fn transport_params(&self) -> Result<TransportParams, ProbeError> {
        let t = &self.transport;
        Ok(TransportParams {
            dial_timeout: millis("dial_timeout_ms", t.dial_timeout_ms)?,
            keep_alive: millis("keep_alive_ms", t.keep_alive_ms)?,
            max_idle_conns: count("max_idle_conns", t.max_idle_conns)?,
            max_idle_conns_per_host: count("max_idle_conns_per_host", t.max_idle_conns_per_host)?,
            max_conns_per_host: count("max_conns_per_host", t.max_conns_per_host)?,
            idle_conn_timeout: millis("idle_conn_timeout_ms", t.idle_conn_timeout_ms)?,
            tls_handshake_timeout: millis("tls_handshake_timeout_ms", t.tls_handshake_timeout_ms)?,
            expect_continue_timeout: millis(
                "expect_continue_timeout_ms",
                t.expect_continue_timeout_ms,
            )?,
            force_attempt_http2: t.force_attempt_http2,
            proxy: t.proxy,
        })
    }

    pub fn pool_config(&self) -> Result<PoolConfig, ProbeError> {
        let pool = &self.pool;
        if pool.size < 1 {
            return Err(ProbeError::config("pool.size must be at least 1"));
        }

        let credentials = match (&pool.username, &pool.password) {
            (Some(username), password) => Some(Credentials::new(
                username.clone(),
                password.clone().unwrap_or_default(),
            )),
            (None, Some(_)) => {
                return Err(ProbeError::config("pool.password is set without pool.username"))
            }
            (None, None) => None,
        };

        let request_timeout = pool
            .request_timeout_ms
            .map(|ms| millis("request_timeout_ms", ms))
            .transpose()?
            .filter(|limit| !limit.is_zero());

        let transport = self.transport_params()?;
        transport.validate()?;

        Ok(PoolConfig {
            size: pool.size,
            credentials,
            transport,
            transport_mode: pool.transport_mode,
            request_timeout,
            local_address: pool.local_address,
        })
    }

    pub fn driver_settings(&self) -> Result<DriverSettings, ProbeError> {
        let driver = &self.driver;
        let target = parse_target(&driver.target)?;
        let method = Method::from_bytes(driver.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ProbeError::config(format!("invalid HTTP method {:?}", driver.method)))?;

        if driver.concurrency < 1 {
            return Err(ProbeError::config("driver.concurrency must be at least 1"));
        }
        if driver.rounds < 1 {
            return Err(ProbeError::config("driver.rounds must be at least 1"));
        }

        let pacing = match driver.duration_ms {
            Some(ms) => Pacing::Duration(millis("duration_ms", ms)?),
            None => Pacing::Requests(driver.requests_per_task),
        };

        Ok(DriverSettings {
            target,
            method,
            concurrency: driver.concurrency,
            pacing,
            rounds: driver.rounds,
            round_pause: millis("round_pause_ms", driver.round_pause_ms)?,
        })
    }

    pub fn demo_delay(&self) -> Result<Duration, ProbeError> {
        millis("demo.delay_ms", self.demo.delay_ms)
    }
}

fn parse_target(raw: &str) -> Result<Uri, ProbeError> {
    let url = url::Url::parse(raw.trim())
        .map_err(|e| ProbeError::config(format!("invalid target {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProbeError::config(format!(
            "target {raw:?} must use http or https"
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProbeError::config(format!("target {raw:?} has no host")));
    }
    Uri::try_from(url.as_str())
        .map_err(|e| ProbeError::config(format!("invalid target {raw:?}: {e}")))
}

fn millis(name: &str, value: i64) -> Result<Duration, ProbeError> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| ProbeError::config(format!("{name} cannot be negative (got {value})")))
}

fn count(name: &str, value: i64) -> Result<usize, ProbeError> {
    usize::try_from(value)
        .map_err(|_| ProbeError::config(format!("{name} cannot be negative (got {value})")))
}

fn set<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ProbeError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| ProbeError::config(format!("{key}={raw:?}: {e}")))?;
    }
    Ok(())
}

fn set_opt<F, T>(lookup: &F, key: &str, slot: &mut Option<T>) -> Result<(), ProbeError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = lookup(key) {
        *slot = match raw.trim() {
            "" => None,
            value => Some(
                value
                    .parse()
                    .map_err(|e| ProbeError::config(format!("{key}={raw:?}: {e}")))?,
            ),
        };
    }
    Ok(())
}
