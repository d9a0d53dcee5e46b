//! Server configuration from command-line flags and environment variables.

use clap::Parser;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::ConfigError;

#[derive(Parser, Clone)]
#[command(name = "bulb_server")]
#[command(about = "Quiz-card collections API", long_about = None)]
pub struct ServerConfig {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory of the Sled database
    #[arg(long, env = "DATA_DIR", default_value = "bulb_data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Access token lifetime in hours
    #[arg(long, env = "JWT_EXPIRES_IN", default_value_t = 24)]
    pub jwt_expires_in: i64,

    /// bcrypt work factor for new password hashes
    #[arg(long, env = "BCRYPT_COST", default_value_t = bcrypt::DEFAULT_COST,
          value_parser = clap::value_parser!(u32).range(4..=31))]
    pub bcrypt_cost: u32,

    /// Write a daily rolling log file into this directory
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            secret: self.jwt_secret.clone(),
            access_ttl_hours: self.jwt_expires_in,
        }
    }
}

/// Signing secret and access token lifetime, fixed at startup.
#[derive(Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub access_ttl_hours: i64,
}

impl TokenConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        if self.access_ttl_hours < 1 {
            return Err(ConfigError::AccessTtl(self.access_ttl_hours));
        }
        Ok(())
    }
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .field("access_ttl_hours", &self.access_ttl_hours)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config = ServerConfig::try_parse_from(["bulb_server", "--jwt-secret", "s3cret"]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.jwt_expires_in, 24);
        assert_eq!(config.bcrypt_cost, bcrypt::DEFAULT_COST);
        assert_eq!(config.data_dir, PathBuf::from("bulb_data"));
        assert_eq!(config.bind_addr().unwrap().port(), 8080);
        assert!(config.token_config().validate().is_ok());
    }

    #[test]
    fn bcrypt_cost_is_range_checked() {
        let result = ServerConfig::try_parse_from(["bulb_server", "--jwt-secret", "s", "--bcrypt-cost", "3"]);
        assert!(result.is_err());
    }

    #[test]
    fn token_config_rejects_bad_values() {
        let empty = TokenConfig { secret: String::new(), access_ttl_hours: 24 };
        assert!(matches!(empty.validate(), Err(ConfigError::EmptySecret)));

        let zero = TokenConfig { secret: "s".to_string(), access_ttl_hours: 0 };
        assert!(matches!(zero.validate(), Err(ConfigError::AccessTtl(0))));
    }

    #[test]
    fn secret_is_not_printed() {
        let config = TokenConfig { secret: "hunter2".to_string(), access_ttl_hours: 1 };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
