//! Mail server connection configuration
//!
//! Loaded once at process start and borrowed by each session for the
//! duration of a fetch cycle. Credentials never live anywhere else.

use crate::error::{Error, Result};
use std::env;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

/// How the connection to the mail server is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    /// Plain TCP upgraded with STARTTLS before login.
    StartTls,
    /// TLS from the first byte (the conventional port 993 mode).
    Implicit,
}

impl FromStr for TransportSecurity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "starttls" => Ok(Self::StartTls),
            "implicit" | "tls" => Ok(Self::Implicit),
            other => Err(Error::Config(format!(
                "invalid MAIL_SECURITY '{other}' (expected 'starttls' or 'implicit')"
            ))),
        }
    }
}

/// What a fetch cycle does when a single message fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Abort the whole cycle on the first decode failure (default).
    FailFast,
    /// Skip the malformed message, log it, and keep the rest.
    SkipMalformed,
}

impl FromStr for DecodePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fail-fast" => Ok(Self::FailFast),
            "skip-malformed" => Ok(Self::SkipMalformed),
            other => Err(Error::Config(format!(
                "invalid MAIL_DECODE_POLICY '{other}' (expected 'fail-fast' or 'skip-malformed')"
            ))),
        }
    }
}

/// Connection configuration for the mail server.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub security: TransportSecurity,
    /// Bound on opening the TCP connection and the TLS handshake.
    pub connect_timeout: Duration,
    /// Bound on each protocol round-trip (LOGIN, SELECT, SEARCH, and
    /// each FETCH read).
    pub command_timeout: Duration,
    pub decode_policy: DecodePolicy,
    /// Cap on concurrently in-flight message decodes.
    pub max_parallel_decodes: usize,
}

impl MailConfig {
    /// Load configuration from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `MAIL_USERNAME`
    /// - `MAIL_PASSWORD`
    ///
    /// Optional (with defaults):
    /// - `MAIL_HOST` (default: `127.0.0.1`)
    /// - `MAIL_PORT` (default: `993`)
    /// - `MAIL_SECURITY` (`starttls` or `implicit`, default: `implicit`)
    /// - `MAIL_CONNECT_TIMEOUT_SECS` (default: `30`)
    /// - `MAIL_COMMAND_TIMEOUT_SECS` (default: `60`)
    /// - `MAIL_DECODE_POLICY` (`fail-fast` or `skip-malformed`,
    ///   default: `fail-fast`)
    /// - `MAIL_MAX_PARALLEL_DECODES` (default: available CPU
    ///   parallelism)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            host: env::var("MAIL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("MAIL_PORT")
                .unwrap_or_else(|_| "993".to_string())
                .parse()
                .map_err(|e| Error::Config(format!("Invalid MAIL_PORT: {e}")))?,
            username: env::var("MAIL_USERNAME")
                .map_err(|_| Error::Config("MAIL_USERNAME not set".into()))?,
            password: env::var("MAIL_PASSWORD")
                .map_err(|_| Error::Config("MAIL_PASSWORD not set".into()))?,
            security: env::var("MAIL_SECURITY")
                .unwrap_or_else(|_| "implicit".to_string())
                .parse()?,
            connect_timeout: Duration::from_secs(parse_secs("MAIL_CONNECT_TIMEOUT_SECS", 30)?),
            command_timeout: Duration::from_secs(parse_secs("MAIL_COMMAND_TIMEOUT_SECS", 60)?),
            decode_policy: env::var("MAIL_DECODE_POLICY")
                .unwrap_or_else(|_| "fail-fast".to_string())
                .parse()?,
            max_parallel_decodes: match env::var("MAIL_MAX_PARALLEL_DECODES") {
                Ok(v) => v.parse().map_err(|e| {
                    Error::Config(format!("Invalid MAIL_MAX_PARALLEL_DECODES: {e}"))
                })?,
                Err(_) => default_parallelism(),
            },
        })
    }
}

fn parse_secs(var: &str, default: u64) -> Result<u64> {
    match env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {var}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(4, NonZeroUsize::get)
}
