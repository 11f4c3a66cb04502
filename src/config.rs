//! Runtime configuration for both binaries.
//!
//! Values come from `POWGATE_*` environment variables layered over the
//! builder defaults; every path ends in `build_validated()`.

use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use derive_builder::Builder;

use crate::blocklist::{DEFAULT_BLOCKLIST_CAPACITY, DEFAULT_BLOCKLIST_TTL};
use crate::error::Error;
use crate::pow::{PowAlgorithm, DEFAULT_DIFFICULTY, MAX_DIFFICULTY};

pub const ENV_PREFIX: &str = "POWGATE_";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SOLVE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on every configured duration.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Handshake and payload on one TCP connection.
    #[default]
    Direct,
    /// UDP handshake, payload on a leased TCP endpoint.
    Rendezvous,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" | "tcp" => Ok(Mode::Direct),
            "rendezvous" | "udp" => Ok(Mode::Rendezvous),
            other => Err(Error::InvalidConfig(format!("unknown mode {other:?}"))),
        }
    }
}

#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct ServerConfig {
    #[builder(default = "\"127.0.0.1\".to_string()")]
    pub host: String,
    #[builder(default = "8080")]
    pub port: u16,
    #[builder(default = "PathBuf::from(\"quotes.txt\")")]
    pub quotes_file: PathBuf,
    /// Session endpoints leased out in rendezvous mode.
    #[builder(default)]
    pub session_addrs: Vec<SocketAddr>,
    #[builder(default = "DEFAULT_DIFFICULTY")]
    pub difficulty: usize,
    /// Bounds every wait on a client: rendezvous state, idle sessions, session accepts.
    #[builder(default = "DEFAULT_TIMEOUT")]
    pub timeout: Duration,
    /// How long an issued challenge waits for its solution.
    #[builder(default = "DEFAULT_CHALLENGE_TIMEOUT")]
    pub challenge_timeout: Duration,
    #[builder(default = "DEFAULT_BLOCKLIST_TTL")]
    pub blocklist_ttl: Duration,
    #[builder(default = "DEFAULT_BLOCKLIST_CAPACITY")]
    pub blocklist_capacity: u64,
    #[builder(default)]
    pub mode: Mode,
    #[builder(default)]
    pub algorithm: PowAlgorithm,
    #[builder(default)]
    pub debug: bool,
}

impl ServerConfigBuilder {
    pub fn build_validated(self) -> Result<ServerConfig, Error> {
        let config = self
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from a variable lookup, `POWGATE_` prefix included in the key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut builder = ServerConfigBuilder::default();
        if let Some(host) = lookup_var(&lookup, "SERVER_HOST") {
            builder = builder.host(host);
        }
        if let Some(port) = parse_var(&lookup, "SERVER_PORT")? {
            builder = builder.port(port);
        }
        if let Some(path) = lookup_var(&lookup, "QUOTES_FILE") {
            builder = builder.quotes_file(PathBuf::from(path));
        }
        if let Some(addrs) = lookup_var(&lookup, "SESSION_ADDRS") {
            builder = builder.session_addrs(parse_addr_list(&addrs)?);
        }
        if let Some(difficulty) = parse_var(&lookup, "DIFFICULTY")? {
            builder = builder.difficulty(difficulty);
        }
        if let Some(ms) = parse_var(&lookup, "TIMEOUT_MS")? {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var(&lookup, "CHALLENGE_TIMEOUT_MS")? {
            builder = builder.challenge_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var(&lookup, "BLOCKLIST_TTL_MS")? {
            builder = builder.blocklist_ttl(Duration::from_millis(ms));
        }
        if let Some(capacity) = parse_var(&lookup, "BLOCKLIST_CAPACITY")? {
            builder = builder.blocklist_capacity(capacity);
        }
        if let Some(mode) = parse_var(&lookup, "MODE")? {
            builder = builder.mode(mode);
        }
        if let Some(algorithm) = parse_var(&lookup, "ALGORITHM")? {
            builder = builder.algorithm(algorithm);
        }
        if let Some(debug) = parse_var(&lookup, "DEBUG")? {
            builder = builder.debug(debug);
        }
        builder.build_validated()
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), Error> {
        validate_difficulty(self.difficulty)?;
        validate_duration("timeout", self.timeout)?;
        validate_duration("challenge timeout", self.challenge_timeout)?;
        validate_duration("blocklist ttl", self.blocklist_ttl)?;
        if self.blocklist_capacity == 0 {
            return Err(Error::InvalidConfig(
                "blocklist capacity must be > 0".into(),
            ));
        }
        if self.mode == Mode::Rendezvous && self.session_addrs.is_empty() {
            return Err(Error::InvalidConfig(
                "rendezvous mode needs at least one session address".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct ClientConfig {
    #[builder(default = "\"127.0.0.1\".to_string()")]
    pub server_host: String,
    #[builder(default = "8080")]
    pub server_port: u16,
    /// Local bind address for the rendezvous socket.
    #[builder(default = "\"0.0.0.0\".to_string()")]
    pub host: String,
    #[builder(default = "0")]
    pub port: u16,
    #[builder(default)]
    pub mode: Mode,
    #[builder(default = "DEFAULT_DIFFICULTY")]
    pub difficulty: usize,
    #[builder(default)]
    pub algorithm: PowAlgorithm,
    /// Reply timeout for each request.
    #[builder(default = "DEFAULT_TIMEOUT")]
    pub timeout: Duration,
    #[builder(default = "DEFAULT_SOLVE_TIMEOUT")]
    pub solve_timeout: Duration,
    #[builder(default = "1")]
    pub solver_threads: usize,
    #[builder(default)]
    pub debug: bool,
}

impl ClientConfigBuilder {
    pub fn build_validated(self) -> Result<ClientConfig, Error> {
        let config = self
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut builder = ClientConfigBuilder::default();
        if let Some(host) = lookup_var(&lookup, "SERVER_HOST") {
            builder = builder.server_host(host);
        }
        if let Some(port) = parse_var(&lookup, "SERVER_PORT")? {
            builder = builder.server_port(port);
        }
        if let Some(host) = lookup_var(&lookup, "CLIENT_HOST") {
            builder = builder.host(host);
        }
        if let Some(port) = parse_var(&lookup, "CLIENT_PORT")? {
            builder = builder.port(port);
        }
        if let Some(mode) = parse_var(&lookup, "MODE")? {
            builder = builder.mode(mode);
        }
        if let Some(difficulty) = parse_var(&lookup, "DIFFICULTY")? {
            builder = builder.difficulty(difficulty);
        }
        if let Some(algorithm) = parse_var(&lookup, "ALGORITHM")? {
            builder = builder.algorithm(algorithm);
        }
        if let Some(ms) = parse_var(&lookup, "TIMEOUT_MS")? {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var(&lookup, "SOLVE_TIMEOUT_MS")? {
            builder = builder.solve_timeout(Duration::from_millis(ms));
        }
        if let Some(threads) = parse_var(&lookup, "SOLVER_THREADS")? {
            builder = builder.solver_threads(threads);
        }
        if let Some(debug) = parse_var(&lookup, "DEBUG")? {
            builder = builder.debug(debug);
        }
        builder.build_validated()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), Error> {
        validate_difficulty(self.difficulty)?;
        validate_duration("timeout", self.timeout)?;
        validate_duration("solve timeout", self.solve_timeout)?;
        if self.solver_threads == 0 {
            return Err(Error::InvalidConfig("solver threads must be >= 1".into()));
        }
        Ok(())
    }
}

fn validate_difficulty(difficulty: usize) -> Result<(), Error> {
    if !(1..=MAX_DIFFICULTY).contains(&difficulty) {
        return Err(Error::InvalidConfig(format!(
            "difficulty must be within 1..={MAX_DIFFICULTY}, got {difficulty}"
        )));
    }
    Ok(())
}

fn validate_duration(name: &str, value: Duration) -> Result<(), Error> {
    if value.is_zero() || value > MAX_DURATION {
        return Err(Error::InvalidConfig(format!(
            "{name} must be within 1ms..={}s, got {value:?}",
            MAX_DURATION.as_secs()
        )));
    }
    Ok(())
}

fn lookup_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(&format!("{ENV_PREFIX}{key}"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: Display,
{
    lookup_var(lookup, key)
        .map(|value| {
            value.parse().map_err(|e| {
                Error::InvalidConfig(format!("{ENV_PREFIX}{key}={value:?}: {e}"))
            })
        })
        .transpose()
}

fn parse_addr_list(raw: &str) -> Result<Vec<SocketAddr>, Error> {
    raw.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(|addr| {
            addr.parse()
                .map_err(|e| Error::InvalidConfig(format!("session address {addr:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn server_defaults() {
        let config = ServerConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(config.difficulty, DEFAULT_DIFFICULTY);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.challenge_timeout, DEFAULT_CHALLENGE_TIMEOUT);
        assert_eq!(config.blocklist_ttl, Duration::from_secs(2));
        assert_eq!(config.blocklist_capacity, 128);
        assert_eq!(config.mode, Mode::Direct);
        assert_eq!(config.algorithm, PowAlgorithm::Sha2_256);
    }

    #[test]
    fn server_reads_prefixed_variables() {
        let config = ServerConfig::from_lookup(vars(&[
            ("SERVER_HOST", "0.0.0.0"),
            ("SERVER_PORT", "4000"),
            ("MODE", "rendezvous"),
            ("SESSION_ADDRS", "127.0.0.1:5001, 127.0.0.1:5002"),
            ("DIFFICULTY", "2"),
            ("TIMEOUT_MS", "500"),
            ("ALGORITHM", "blake3"),
            ("DEBUG", "true"),
        ]))
        .unwrap();
        assert_eq!(config.addr(), "0.0.0.0:4000");
        assert_eq!(config.mode, Mode::Rendezvous);
        assert_eq!(config.session_addrs.len(), 2);
        assert_eq!(config.difficulty, 2);
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.algorithm, PowAlgorithm::Blake3);
        assert!(config.debug);
    }

    #[test]
    fn server_rejects_bad_values() {
        let cases: [&[(&str, &str)]; 10] = [
            &[("DIFFICULTY", "0")],
            &[("DIFFICULTY", "9")],
            &[("SERVER_PORT", "seventy")],
            &[("TIMEOUT_MS", "0")],
            &[("TIMEOUT_MS", "18446744073709551615")],
            &[("BLOCKLIST_TTL_MS", "18446744073709551615")],
            &[("BLOCKLIST_TTL_MS", "86400001")],
            &[("CHALLENGE_TIMEOUT_MS", "0")],
            &[("MODE", "rendezvous")],
            &[("SESSION_ADDRS", "not-an-addr")],
        ];
        for pairs in cases {
            assert!(
                matches!(
                    ServerConfig::from_lookup(vars(pairs)),
                    Err(Error::InvalidConfig(_))
                ),
                "{pairs:?}"
            );
        }
    }

    #[test]
    fn client_reads_prefixed_variables() {
        let config = ClientConfig::from_lookup(vars(&[
            ("SERVER_PORT", "4000"),
            ("CLIENT_PORT", "4001"),
            ("SOLVER_THREADS", "4"),
            ("MODE", "udp"),
        ]))
        .unwrap();
        assert_eq!(config.server_addr(), "127.0.0.1:4000");
        assert_eq!(config.bind_addr(), "0.0.0.0:4001");
        assert_eq!(config.solver_threads, 4);
        assert_eq!(config.mode, Mode::Rendezvous);

        assert!(ClientConfig::from_lookup(vars(&[("SOLVER_THREADS", "0")])).is_err());
        assert!(
            ClientConfig::from_lookup(vars(&[("SOLVE_TIMEOUT_MS", "18446744073709551615")])).is_err()
        );
    }

    #[test]
    fn longest_durations_build_a_gatekeeper() {
        let config = ServerConfig::from_lookup(vars(&[
            ("TIMEOUT_MS", "86400000"),
            ("CHALLENGE_TIMEOUT_MS", "86400000"),
            ("BLOCKLIST_TTL_MS", "86400000"),
        ]))
        .unwrap();
        let payload = std::sync::Arc::new(|| b"quote".to_vec());
        let gate = crate::server::Gatekeeper::from_config(&config, payload);
        gate.blocklist().block("192.0.2.1".parse().unwrap());
        assert!(gate.blocklist().is_blocked("192.0.2.1".parse().unwrap()));
        assert_eq!(gate.challenge_timeout(), MAX_DURATION);
    }
}
