//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::ConfigError;

/// Default base URL of the vault service.
pub const DEFAULT_SERVICE_URL: &str = "http://127.0.0.1:5050";

/// Monthly income assumed when the extraction did not produce one.
pub const DEFAULT_MONTHLY_INCOME: Decimal = dec!(25000);

/// Annual rent assumed when no override is given.
pub const DEFAULT_ANNUAL_RENT: Decimal = dec!(140000);

/// Default upload limit in MiB.
pub const DEFAULT_MAX_UPLOAD_MB: usize = 10;

/// Funnel-level policy for filling in analysis inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisPolicy {
    pub default_monthly_income: Decimal,
    pub default_annual_rent: Decimal,
}

impl Default for AnalysisPolicy {
    fn default() -> Self {
        Self {
            default_monthly_income: DEFAULT_MONTHLY_INCOME,
            default_annual_rent: DEFAULT_ANNUAL_RENT,
        }
    }
}

/// Vault client configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Base URL of the remote service.
    pub service_url: String,
    /// Defaults merged into analysis requests.
    pub policy: AnalysisPolicy,
    /// Largest document accepted for upload, in MiB.
    pub max_upload_mb: usize,
    /// Optional per-request timeout. `None` leaves it to the transport.
    pub request_timeout: Option<Duration>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            policy: AnalysisPolicy::default(),
            max_upload_mb: DEFAULT_MAX_UPLOAD_MB,
            request_timeout: None,
        }
    }
}

impl VaultConfig {
    /// Load configuration from `VAULT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let service_url = std::env::var("VAULT_SERVICE_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.service_url);

        let default_monthly_income = env_parsed("VAULT_DEFAULT_MONTHLY_INCOME")?
            .unwrap_or(defaults.policy.default_monthly_income);
        let default_annual_rent = env_parsed("VAULT_DEFAULT_ANNUAL_RENT")?
            .unwrap_or(defaults.policy.default_annual_rent);

        let max_upload_mb = env_parsed("VAULT_MAX_UPLOAD_MB")?.unwrap_or(defaults.max_upload_mb);

        let request_timeout =
            env_parsed::<u64>("VAULT_REQUEST_TIMEOUT_SECS")?.map(Duration::from_secs);

        Ok(Self {
            service_url,
            policy: AnalysisPolicy {
                default_monthly_income,
                default_annual_rent,
            },
            max_upload_mb,
            request_timeout,
        })
    }

    /// Upload limit in bytes.
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}

fn env_parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        _ => Ok(None),
    }
}
