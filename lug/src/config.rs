//! Runtime configuration
//!
//! Two configuration surfaces exist:
//!
//! 1. [`ServerConfig`]: deserialized from the map a script passes to
//!    `server::create`. Scalar fields ride through serde (camelCase keys);
//!    lifecycle callbacks (`onRequest`, ...) are split off before
//!    deserialization because they are script function pointers.
//! 2. [`Mode`]: process-wide run mode loaded from the `LUG_MODE`
//!    environment variable through figment, controlling where script
//!    `debug()` output is routed.

use std::fmt;
use std::time::Duration;

use figment::{providers::Env, Figment};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::Result;

/// Process run mode, from `LUG_MODE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Script `debug()` output goes to stderr
    #[default]
    Debug,
    /// Script `debug()` output is suppressed
    Release,
    /// Script `debug()` output is captured for assertions
    Test,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Release => f.write_str("release"),
            Self::Test => f.write_str("test"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnvConfig {
    #[serde(default)]
    mode: Mode,
}

impl Mode {
    /// Load the run mode from the environment (`LUG_MODE`)
    pub fn from_env() -> Result<Self> {
        let env: EnvConfig = Figment::new().merge(Env::prefixed("LUG_")).extract()?;
        Ok(env.mode)
    }
}

/// Server log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Log nothing per request
    Silent,
    /// Log only failed requests, with the error text
    Error,
    /// Log every request, with the status text
    #[default]
    Info,
}

/// A duration that deserializes from an integer number of seconds, a float
/// number of seconds, or a string with an `ms`/`s`/`m`/`h` suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dur(pub Duration);

impl Dur {
    /// The wrapped duration
    pub fn get(self) -> Duration {
        self.0
    }

    /// Parse a suffixed duration string (`"500ms"`, `"15s"`, `"2m"`, `"1h"`)
    pub fn parse(text: &str) -> Option<Duration> {
        let text = text.trim();
        let (value, unit) = match text.find(|c: char| c.is_ascii_alphabetic()) {
            Some(idx) => text.split_at(idx),
            None => return None,
        };
        let value: f64 = value.trim().parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let millis = match unit {
            "ms" => value,
            "s" => value * 1_000.0,
            "m" => value * 60_000.0,
            "h" => value * 3_600_000.0,
            _ => return None,
        };
        Some(Duration::from_millis(millis as u64))
    }
}

impl<'de> Deserialize<'de> for Dur {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DurVisitor;

        impl de::Visitor<'_> for DurVisitor {
            type Value = Dur;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration (seconds or a suffixed string like \"500ms\")")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Dur, E> {
                if v < 0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(Dur(Duration::from_secs(v as u64)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Dur, E> {
                Ok(Dur(Duration::from_secs(v)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Dur, E> {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(Dur(Duration::from_millis((v * 1000.0) as u64)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Dur, E> {
                Dur::parse(v)
                    .map(Dur)
                    .ok_or_else(|| E::custom(format!("invalid duration string: {v:?}")))
            }
        }

        deserializer.deserialize_any(DurVisitor)
    }
}

impl Serialize for Dur {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0.as_secs_f64())
    }
}

/// Server configuration, deserialized from the `server::create` map
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Per-request log verbosity
    pub log_level: LogLevel,

    /// PEM certificate chain; TLS is enabled when both files are set
    pub cert_file: Option<String>,

    /// PEM private key
    pub key_file: Option<String>,

    /// Listen address; a bare `:port` binds all interfaces
    pub addr: String,

    /// Path to an error-page template overriding the built-in one
    pub error_template: Option<String>,

    /// Maximum in-flight request handlers
    pub workers: usize,

    /// Socket read timeout
    pub read_timeout: Dur,

    /// Socket write timeout
    pub write_timeout: Dur,

    /// Keep-alive idle timeout between requests
    pub idle_timeout: Dur,

    /// Per-request handler deadline
    pub processing_timeout: Dur,

    /// Drain budget for graceful shutdown
    pub shutdown_timeout: Dur,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            cert_file: None,
            key_file: None,
            addr: ":3000".to_string(),
            error_template: None,
            workers: 100,
            read_timeout: Dur(Duration::from_secs(15)),
            write_timeout: Dur(Duration::from_secs(30)),
            idle_timeout: Dur(Duration::from_secs(120)),
            processing_timeout: Dur(Duration::from_secs(30)),
            shutdown_timeout: Dur(Duration::from_secs(60)),
        }
    }
}

impl ServerConfig {
    /// Resolve the listen address into a bindable socket address string
    pub fn bind_addr(&self) -> String {
        if let Some(stripped) = self.addr.strip_prefix(':') {
            format!("0.0.0.0:{stripped}")
        } else {
            self.addr.clone()
        }
    }

    /// Whether TLS is configured
    pub fn tls_enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }
}
