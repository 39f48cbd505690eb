//! Configuration management for the file sharing server

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::pool::PoolConfig;
use crate::transfer::TransferLimits;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("{0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub workers: WorkerConfig,
    pub transfer: TransferConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Grace period for sessions to finish once shutdown starts
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub core_size: usize,
    pub max_size: usize,
    pub queue_capacity: usize,
    /// Idle time after which a worker above the core size retires
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Per-read deadline while waiting for a command line
    pub read_timeout_secs: u64,
    /// Per-read deadline inside a binary frame
    pub transfer_timeout_secs: u64,
    pub buffer_size: usize,
    pub max_file_size: u64,
    /// Capacity of each session's outbound queue
    pub outbound_queue: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: usize,
    pub acquire_timeout_secs: u64,
    pub acquire_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9000,
                shutdown_timeout_secs: 30,
            },
            workers: WorkerConfig {
                core_size: 8,
                max_size: 32,
                queue_capacity: 64,
                keep_alive_secs: 60,
            },
            transfer: TransferConfig {
                read_timeout_secs: 300,
                transfer_timeout_secs: 60,
                buffer_size: 8192,
                max_file_size: 100 * 1024 * 1024,
                outbound_queue: 256,
            },
            database: DatabaseConfig {
                url: "sqlite:./fileshare.db".to_string(),
                pool_size: 10,
                acquire_timeout_secs: 5,
                acquire_attempts: 3,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: var_or("SERVER_PORT", defaults.server.port)?,
                shutdown_timeout_secs: var_or("SHUTDOWN_TIMEOUT_SECS", defaults.server.shutdown_timeout_secs)?,
            },
            workers: WorkerConfig {
                core_size: var_or("WORKER_CORE_SIZE", defaults.workers.core_size)?,
                max_size: var_or("WORKER_MAX_SIZE", defaults.workers.max_size)?,
                queue_capacity: var_or("WORKER_QUEUE_CAPACITY", defaults.workers.queue_capacity)?,
                keep_alive_secs: var_or("WORKER_KEEP_ALIVE_SECS", defaults.workers.keep_alive_secs)?,
            },
            transfer: TransferConfig {
                read_timeout_secs: var_or("READ_TIMEOUT_SECS", defaults.transfer.read_timeout_secs)?,
                transfer_timeout_secs: var_or("TRANSFER_TIMEOUT_SECS", defaults.transfer.transfer_timeout_secs)?,
                buffer_size: var_or("BUFFER_SIZE", defaults.transfer.buffer_size)?,
                max_file_size: var_or("MAX_FILE_SIZE", defaults.transfer.max_file_size)?,
                outbound_queue: var_or("OUTBOUND_QUEUE", defaults.transfer.outbound_queue)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                pool_size: var_or("DB_POOL_SIZE", defaults.database.pool_size)?,
                acquire_timeout_secs: var_or("DB_ACQUIRE_TIMEOUT_SECS", defaults.database.acquire_timeout_secs)?,
                acquire_attempts: var_or("DB_ACQUIRE_ATTEMPTS", defaults.database.acquire_attempts)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("WORKER_CORE_SIZE", self.workers.core_size),
            ("WORKER_QUEUE_CAPACITY", self.workers.queue_capacity),
            ("BUFFER_SIZE", self.transfer.buffer_size),
            ("OUTBOUND_QUEUE", self.transfer.outbound_queue),
            ("DB_POOL_SIZE", self.database.pool_size),
        ];
        for (var, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    var,
                    value: value.to_string(),
                });
            }
        }

        if self.workers.max_size < self.workers.core_size {
            return Err(ConfigError::Inconsistent(format!(
                "WORKER_MAX_SIZE ({}) is below WORKER_CORE_SIZE ({})",
                self.workers.max_size, self.workers.core_size
            )));
        }
        if self.database.acquire_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "DB_ACQUIRE_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.read_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.workers.keep_alive_secs)
    }

    pub fn transfer_limits(&self) -> TransferLimits {
        TransferLimits {
            max_file_size: self.transfer.max_file_size,
            buffer_size: self.transfer.buffer_size,
            io_timeout: Duration::from_secs(self.transfer.transfer_timeout_secs),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.database.pool_size,
            acquire_timeout: Duration::from_secs(self.database.acquire_timeout_secs),
            acquire_attempts: self.database.acquire_attempts,
            ..PoolConfig::default()
        }
    }
}

/// Parse `var` if set, otherwise use `default`
fn var_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => parse_value(var, &value),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        assert_eq!(config.transfer_limits().max_file_size, 100 * 1024 * 1024);
        assert_eq!(config.pool_config().max_connections, 10);
    }

    #[test]
    fn test_parse_value_names_variable() {
        let err = parse_value::<u16>("SERVER_PORT", "ninety").unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for SERVER_PORT: \"ninety\"");
        assert_eq!(parse_value::<u16>("SERVER_PORT", " 9100 ").unwrap(), 9100);
    }

    #[test]
    fn test_inconsistent_worker_sizes() {
        let mut config = Config::default();
        config.workers.max_size = 2;
        config.workers.core_size = 4;
        assert!(matches!(config.validate(), Err(ConfigError::Inconsistent(_))));

        let mut config = Config::default();
        config.database.pool_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { var: "DB_POOL_SIZE", .. })
        ));
    }
}
