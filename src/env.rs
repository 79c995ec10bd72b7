//! Environment variable names used by this crate for convenient
//! configuration of uploads from services.
//!
//! These are purely helpers; the core types remain decoupled from
//! environment access.

use crate::config::UploadConfig;
use std::time::Duration;

/// Endpoint finalized log files are posted to.
pub const LOG_UPLOAD_URL_ENV: &str = "LOG_UPLOAD_URL";

/// Root directory of the staging areas.
pub const LOG_UPLOAD_HOME_ENV: &str = "LOG_UPLOAD_HOME";

/// `true`/`false`: keep successfully uploaded files.
pub const LOG_UPLOAD_STORE_SUCCESSFUL_ENV: &str = "LOG_UPLOAD_STORE_SUCCESSFUL";

/// `true`/`false`: keep failed uploads for later retries.
pub const LOG_UPLOAD_STORE_FAILED_ENV: &str = "LOG_UPLOAD_STORE_FAILED";

/// `true`/`false`: retry failed uploads after the next success.
pub const LOG_UPLOAD_AUTO_RETRY_ENV: &str = "LOG_UPLOAD_AUTO_RETRY";

/// Request timeout in whole seconds.
pub const LOG_UPLOAD_TIMEOUT_SECS_ENV: &str = "LOG_UPLOAD_TIMEOUT_SECS";

/// Error returned when the environment does not describe a usable upload.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EnvConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has invalid value `{value}`")]
    Invalid { name: &'static str, value: String },
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, EnvConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EnvConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

/// Build an [`UploadConfig`] from `lookup`, typically `std::env::var`.
pub fn upload_config_from<F>(lookup: F) -> Result<UploadConfig, EnvConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let url = lookup(LOG_UPLOAD_URL_ENV).ok_or(EnvConfigError::Missing(LOG_UPLOAD_URL_ENV))?;
    let home = lookup(LOG_UPLOAD_HOME_ENV).ok_or(EnvConfigError::Missing(LOG_UPLOAD_HOME_ENV))?;
    let mut config = UploadConfig::new(url, home);

    if let Some(value) = lookup(LOG_UPLOAD_STORE_SUCCESSFUL_ENV) {
        config.store_successful_uploads = parse_flag(LOG_UPLOAD_STORE_SUCCESSFUL_ENV, &value)?;
    }
    if let Some(value) = lookup(LOG_UPLOAD_STORE_FAILED_ENV) {
        config.store_failed_uploads = parse_flag(LOG_UPLOAD_STORE_FAILED_ENV, &value)?;
    }
    if let Some(value) = lookup(LOG_UPLOAD_AUTO_RETRY_ENV) {
        config.auto_retry_failed_uploads = parse_flag(LOG_UPLOAD_AUTO_RETRY_ENV, &value)?;
    }
    if let Some(value) = lookup(LOG_UPLOAD_TIMEOUT_SECS_ENV) {
        let secs: u64 = value.trim().parse().map_err(|_| EnvConfigError::Invalid {
            name: LOG_UPLOAD_TIMEOUT_SECS_ENV,
            value: value.clone(),
        })?;
        config.request_timeout = Duration::from_secs(secs);
    }

    Ok(config)
}

/// Build an [`UploadConfig`] from the process environment.
pub fn upload_config_from_env() -> Result<UploadConfig, EnvConfigError> {
    upload_config_from(|key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_all_settings() {
        let config = upload_config_from(lookup(&[
            (LOG_UPLOAD_URL_ENV, "https://logs.example.com/upload"),
            (LOG_UPLOAD_HOME_ENV, "/var/lib/app/uploads"),
            (LOG_UPLOAD_STORE_SUCCESSFUL_ENV, "yes"),
            (LOG_UPLOAD_AUTO_RETRY_ENV, "0"),
            (LOG_UPLOAD_TIMEOUT_SECS_ENV, "5"),
        ]))
        .unwrap();

        assert_eq!(config.target_url, "https://logs.example.com/upload");
        assert_eq!(config.uploader_home, std::path::PathBuf::from("/var/lib/app/uploads"));
        assert!(config.store_successful_uploads);
        assert!(config.store_failed_uploads);
        assert!(!config.auto_retry_failed_uploads);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn url_is_required() {
        let err = upload_config_from(lookup(&[(LOG_UPLOAD_HOME_ENV, "/tmp")])).unwrap_err();
        assert_eq!(err, EnvConfigError::Missing(LOG_UPLOAD_URL_ENV));
    }

    #[test]
    fn bad_flag_is_rejected() {
        let err = upload_config_from(lookup(&[
            (LOG_UPLOAD_URL_ENV, "http://localhost/"),
            (LOG_UPLOAD_HOME_ENV, "/tmp"),
            (LOG_UPLOAD_STORE_FAILED_ENV, "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, EnvConfigError::Invalid { name, .. } if name == LOG_UPLOAD_STORE_FAILED_ENV));
    }
}
