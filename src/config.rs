//! Environment-driven configuration.
//!
//! The binary takes no subcommands; everything is an environment variable
//! with a flag alias for local runs.

use std::path::PathBuf;

use clap::Parser;

use crate::SnowglobeError;

#[derive(Parser, Debug, Clone)]
#[command(name = "snowglobe", version, about = "Local Snowflake emulator")]
pub struct Config {
    /// Plaintext HTTP port.
    #[arg(long, env = "PORT", default_value_t = 8084)]
    pub port: u16,

    /// TLS port, served in addition to the plaintext port when HTTPS is enabled.
    #[arg(long, env = "HTTPS_PORT", default_value_t = 8443)]
    pub https_port: u16,

    /// Bind address for both ports.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Directory for the catalog snapshot and the engine database file.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Serve TLS on the secure port. Requires cert-path and key-path.
    #[arg(long, env = "ENABLE_HTTPS", default_value_t = false)]
    pub enable_https: bool,

    /// PEM certificate chain.
    #[arg(long, env = "CERT_PATH")]
    pub cert_path: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, env = "KEY_PATH")]
    pub key_path: Option<PathBuf>,

    /// Log filter, e.g. `info` or `snowglobe=debug`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Wall-clock deadline for a single statement, in seconds.
    #[arg(long, env = "QUERY_DEADLINE_SECONDS", default_value_t = 300)]
    pub query_deadline_seconds: u64,

    /// Close sessions idle for longer than this many seconds. 0 disables.
    #[arg(long, env = "SESSION_IDLE_TIMEOUT_SECONDS", default_value_t = 0)]
    pub session_idle_timeout_seconds: u64,

    /// How long in-flight requests may run after a termination signal.
    #[arg(long, env = "SHUTDOWN_GRACE_SECONDS", default_value_t = 30)]
    pub shutdown_grace_seconds: u64,
}

impl Config {
    /// Cross-field validation that clap cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        if self.enable_https && (self.cert_path.is_none() || self.key_path.is_none()) {
            return Err(SnowglobeError::BadRequest(
                "ENABLE_HTTPS requires CERT_PATH and KEY_PATH".to_owned(),
            ));
        }
        if self.port == self.https_port {
            return Err(SnowglobeError::BadRequest(format!(
                "PORT and HTTPS_PORT must differ, both are {}",
                self.port
            )));
        }
        Ok(())
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    pub fn worksheets_path(&self) -> PathBuf {
        self.data_dir.join("worksheets.json")
    }

    pub fn engine_path(&self) -> PathBuf {
        self.data_dir.join("snowglobe.duckdb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::parse_from(["snowglobe"])
    }

    #[test]
    fn defaults() {
        let c = base();
        assert_eq!(c.port, 8084);
        assert_eq!(c.https_port, 8443);
        assert_eq!(c.query_deadline_seconds, 300);
        assert!(!c.enable_https);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn https_requires_cert_and_key() {
        let mut c = base();
        c.enable_https = true;
        assert!(c.validate().is_err());
        c.cert_path = Some("cert.pem".into());
        c.key_path = Some("key.pem".into());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn ports_must_differ() {
        let mut c = base();
        c.https_port = c.port;
        assert!(c.validate().is_err());
    }
}
