// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::log_source::{SourceSettings, DEFAULT_PBS_CONF};
use crate::orchestrator::DateSpec;
use crate::retry::{RetryStrategy, DEFAULT_CONNECTION_RETRIES, DEFAULT_RETRY_BACKOFF_MS};
use crate::store::{is_identifier, TableNames};

const ENV_ACCOUNTING_DIR: &str = "GESTOR_ACCOUNTING_DIR";
const ENV_PBS_CONF: &str = "PBS_CONF_FILE";
const ENV_DATABASE: &str = "GESTOR_DATABASE";
const ENV_FROM_DATE: &str = "GESTOR_FROM_DATE";
const ENV_TILL_DATE: &str = "GESTOR_TILL_DATE";
const ENV_LOG_LEVEL: &str = "GESTOR_LOG_LEVEL";
const ENV_CONNECTION_RETRIES: &str = "GESTOR_CONNECTION_RETRIES";
const ENV_RETRY_BACKOFF_MS: &str = "GESTOR_RETRY_BACKOFF_MS";
const ENV_POLL_INTERVAL_MS: &str = "GESTOR_POLL_INTERVAL_MS";
const ENV_OPEN_RETRY_SECS: &str = "GESTOR_OPEN_RETRY_SECS";
const ENV_JOB_TABLE: &str = "GESTOR_JOB_TABLE";
const ENV_RESOURCE_TABLE: &str = "GESTOR_RESOURCE_TABLE";
const ENV_LOG_TABLE: &str = "GESTOR_LOG_TABLE";

const DEFAULT_DATABASE: &str = "pbs_gestor.db";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_OPEN_RETRY_SECS: u64 = 60;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Runtime configuration of the gestor daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GestorConfig {
    /// Accounting log directory; when unset it is derived from the PBS configuration file
    pub accounting_dir: Option<PathBuf>,
    /// PBS configuration file holding `PBS_HOME`
    pub pbs_conf_file: PathBuf,
    /// Reporting database file
    pub database: PathBuf,
    pub from_date: DateSpec,
    pub till_date: DateSpec,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    pub connection_retries: u32,
    /// Delay between reconnection attempts, 0 retries immediately
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub open_retry_secs: u64,
    pub tables: TableNames,
}

impl Default for GestorConfig {
    fn default() -> Self {
        Self {
            accounting_dir: None,
            pbs_conf_file: PathBuf::from(DEFAULT_PBS_CONF),
            database: PathBuf::from(DEFAULT_DATABASE),
            from_date: DateSpec::Today,
            till_date: DateSpec::Today,
            log_level: "info".to_string(),
            connection_retries: DEFAULT_CONNECTION_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            open_retry_secs: DEFAULT_OPEN_RETRY_SECS,
            tables: TableNames::default(),
        }
    }
}

impl GestorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_iter(env::vars())
    }

    /// Create configuration from key/value pairs, unset keys take their default.
    pub fn from_env_iter<I, K, V>(iter: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let get = |name: &str| map.get(name).map(|v| v.trim());
        let defaults = Self::default();

        let accounting_dir = get(ENV_ACCOUNTING_DIR).map(PathBuf::from);
        let pbs_conf_file = get(ENV_PBS_CONF).map_or(defaults.pbs_conf_file, PathBuf::from);
        let database = get(ENV_DATABASE).map_or(defaults.database, PathBuf::from);
        let from_date = get(ENV_FROM_DATE)
            .map(DateSpec::from_str)
            .transpose()?
            .unwrap_or(defaults.from_date);
        let till_date = get(ENV_TILL_DATE)
            .map(DateSpec::from_str)
            .transpose()?
            .unwrap_or(defaults.till_date);
        let log_level = get(ENV_LOG_LEVEL).map_or(defaults.log_level, str::to_lowercase);
        let connection_retries =
            number(ENV_CONNECTION_RETRIES, get(ENV_CONNECTION_RETRIES))?
                .unwrap_or(defaults.connection_retries);
        let retry_backoff_ms = number(ENV_RETRY_BACKOFF_MS, get(ENV_RETRY_BACKOFF_MS))?
            .unwrap_or(defaults.retry_backoff_ms);
        let poll_interval_ms = number(ENV_POLL_INTERVAL_MS, get(ENV_POLL_INTERVAL_MS))?
            .unwrap_or(defaults.poll_interval_ms);
        let open_retry_secs = number(ENV_OPEN_RETRY_SECS, get(ENV_OPEN_RETRY_SECS))?
            .unwrap_or(defaults.open_retry_secs);
        let tables = TableNames {
            job: get(ENV_JOB_TABLE).map_or(defaults.tables.job, str::to_string),
            resource: get(ENV_RESOURCE_TABLE).map_or(defaults.tables.resource, str::to_string),
            log: get(ENV_LOG_TABLE).map_or(defaults.tables.log, str::to_string),
        };

        let config = Self {
            accounting_dir,
            pbs_conf_file,
            database,
            from_date,
            till_date,
            log_level,
            connection_retries,
            retry_backoff_ms,
            poll_interval_ms,
            open_retry_secs,
            tables,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(invalid(
                ENV_LOG_LEVEL,
                &self.log_level,
                "must be one of: trace, debug, info, warn, error",
            ));
        }

        if self.connection_retries == 0 {
            return Err(invalid(
                ENV_CONNECTION_RETRIES,
                "0",
                "at least one connection attempt is needed",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(invalid(ENV_POLL_INTERVAL_MS, "0", "must be greater than 0"));
        }

        for (name, table) in [
            (ENV_JOB_TABLE, &self.tables.job),
            (ENV_RESOURCE_TABLE, &self.tables.resource),
            (ENV_LOG_TABLE, &self.tables.log),
        ] {
            if !is_identifier(table) {
                return Err(invalid(
                    name,
                    table,
                    "table names may only contain letters, digits and '_'",
                ));
            }
        }

        let mut names = [&self.tables.job, &self.tables.resource, &self.tables.log];
        names.sort();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(invalid(
                ENV_JOB_TABLE,
                &self.tables.job,
                "job, resource and log tables must have different names",
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::from_settings(self.connection_retries, self.retry_backoff_ms)
    }

    #[must_use]
    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            open_retry_interval: Duration::from_secs(self.open_retry_secs),
        }
    }
}

fn number<T: FromStr>(name: &'static str, value: Option<&str>) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| invalid(name, v, "not a non-negative integer"))
        })
        .transpose()
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = GestorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_strategy(), RetryStrategy::LinearBackoff(2, 1000));
        assert_eq!(config.source_settings(), SourceSettings::default());
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = GestorConfig::from_env_iter(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config, GestorConfig::default());
    }

    #[test]
    fn test_from_env_iter() {
        let config = GestorConfig::from_env_iter([
            ("GESTOR_ACCOUNTING_DIR", "/var/spool/pbs/server_priv/accounting"),
            ("GESTOR_DATABASE", "/tmp/gestor.db"),
            ("GESTOR_FROM_DATE", "20181112"),
            ("GESTOR_TILL_DATE", "lastscan"),
            ("GESTOR_LOG_LEVEL", "DEBUG"),
            ("GESTOR_CONNECTION_RETRIES", "5"),
            ("GESTOR_RETRY_BACKOFF_MS", "0"),
            ("GESTOR_JOB_TABLE", "jobs"),
            ("GESTOR_POLL_INTERVAL_MS", " "),
        ])
        .unwrap();
        assert_eq!(
            config.accounting_dir,
            Some(PathBuf::from("/var/spool/pbs/server_priv/accounting"))
        );
        assert_eq!(
            config.from_date,
            DateSpec::Day(NaiveDate::from_ymd_opt(2018, 11, 12).unwrap())
        );
        assert_eq!(config.till_date, DateSpec::LastScan);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.retry_strategy(), RetryStrategy::Immediate(5));
        assert_eq!(config.tables.job, "jobs");
        assert_eq!(config.tables.log, "pbslog");
        // blank values fall back to the default
        assert_eq!(config.poll_interval_ms, 100);
    }

    #[test]
    fn test_invalid_values() {
        let err = GestorConfig::from_env_iter([("GESTOR_CONNECTION_RETRIES", "two")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { name: "GESTOR_CONNECTION_RETRIES", .. }
        ));

        let err = GestorConfig::from_env_iter([("GESTOR_FROM_DATE", "yesterday")]).unwrap_err();
        assert_eq!(err, ConfigError::InvalidDate("yesterday".to_string()));

        let err = GestorConfig::from_env_iter([("GESTOR_LOG_LEVEL", "verbose")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "GESTOR_LOG_LEVEL", .. }));

        let err = GestorConfig::from_env_iter([("GESTOR_LOG_TABLE", "pbs-log")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "GESTOR_LOG_TABLE", .. }));
    }

    #[test]
    fn test_validate_rejects_shared_table_names() {
        let config = GestorConfig {
            tables: TableNames {
                job: "pbs".to_string(),
                resource: "pbs".to_string(),
                log: "pbslog".to_string(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_retries() {
        let config = GestorConfig {
            connection_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        env::set_var("GESTOR_FROM_DATE", "firstlog");
        env::set_var("GESTOR_OPEN_RETRY_SECS", "5");
        env::set_var("PBS_CONF_FILE", "/opt/pbs/pbs.conf");
        let config = GestorConfig::from_env();
        env::remove_var("GESTOR_FROM_DATE");
        env::remove_var("GESTOR_OPEN_RETRY_SECS");
        env::remove_var("PBS_CONF_FILE");

        let config = config.unwrap();
        assert_eq!(config.from_date, DateSpec::FirstLog);
        assert_eq!(config.source_settings().open_retry_interval, Duration::from_secs(5));
        assert_eq!(config.pbs_conf_file, PathBuf::from("/opt/pbs/pbs.conf"));
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_date() {
        env::set_var("GESTOR_TILL_DATE", "2018-11-12");
        let result = GestorConfig::from_env();
        env::remove_var("GESTOR_TILL_DATE");
        assert!(matches!(result, Err(ConfigError::InvalidDate(_))));
    }
}
