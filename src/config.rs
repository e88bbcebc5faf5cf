use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("subscriber buffer must be at least 1")]
    SubscriberBuffer,

    #[error("public url must start with http:// or https://, got {0}")]
    PublicUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Capture arbitrary HTTP requests and stream them to live viewers.
#[derive(Debug, Clone, Parser)]
#[command(name = "webhookhub", version)]
pub struct Config {
    /// Address to bind the HTTP server
    #[arg(long, env = "WEBHOOKHUB_BIND", default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,

    /// Base URL used when handing out capture URLs
    #[arg(long, env = "WEBHOOKHUB_PUBLIC_URL", default_value = "http://localhost:3000")]
    public_url: String,

    /// Persist endpoints and captured requests here (in-memory if unset)
    #[arg(long, env = "WEBHOOKHUB_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Live push queue size per viewer; overflow drops pushes
    #[arg(long, env = "WEBHOOKHUB_SUBSCRIBER_BUFFER", default_value_t = 256)]
    pub subscriber_buffer: usize,

    /// Largest request body accepted on capture URLs
    #[arg(long, env = "WEBHOOKHUB_MAX_BODY_BYTES", default_value_t = 5 * 1024 * 1024)]
    pub max_body_bytes: usize,

    #[arg(long, env = "WEBHOOKHUB_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn public_url(&self) -> &str {
        self.public_url.trim_end_matches('/')
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::SubscriberBuffer);
        }
        if !(self.public_url.starts_with("http://") || self.public_url.starts_with("https://")) {
            return Err(ConfigError::PublicUrl(self.public_url.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::try_parse_from(["webhookhub"]).unwrap();
        assert_eq!(config.bind, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.subscriber_buffer, 256);
        assert!(config.data_dir.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn public_url_is_normalised_and_checked() {
        let config =
            Config::try_parse_from(["webhookhub", "--public-url", "https://hooks.example.com/"])
                .unwrap();
        assert_eq!(config.public_url(), "https://hooks.example.com");

        let bad =
            Config::try_parse_from(["webhookhub", "--public-url", "hooks.example.com"]).unwrap();
        assert!(matches!(bad.validate(), Err(ConfigError::PublicUrl(_))));

        let zero = Config::try_parse_from(["webhookhub", "--subscriber-buffer", "0"]).unwrap();
        assert!(matches!(zero.validate(), Err(ConfigError::SubscriberBuffer)));
    }
}
