//! Rate limit settings.
//!
//! Settings are read once at startup into an immutable [`RateLimitSettings`]
//! and validated into a [`PolicyCatalog`]; request handling never consults the
//! environment. Every field is optional and falls back to the defaults below.
//!
//! | Variable | Default |
//! |---|---|
//! | `RATE_LIMIT_DEFAULT_LIMIT` / `RATE_LIMIT_DEFAULT_WINDOW_SECS` | 100 / 60 |
//! | `RATE_LIMIT_ORIGIN_LIMIT` / `RATE_LIMIT_ORIGIN_WINDOW_SECS` | 1000 / 3600 |
//! | `RATE_LIMIT_IDENTITY_LIMIT` / `RATE_LIMIT_IDENTITY_WINDOW_SECS` | 5000 / 3600 |
//! | `RATE_LIMIT_LOGIN_LIMIT` / `RATE_LIMIT_LOGIN_WINDOW_SECS` | 5 / 900 |
//! | `RATE_LIMIT_PASSWORD_RESET_LIMIT` / `RATE_LIMIT_PASSWORD_RESET_WINDOW_SECS` | 3 / 3600 |
//! | `RATE_LIMIT_REGISTRATION_LIMIT` / `RATE_LIMIT_REGISTRATION_WINDOW_SECS` | 3 / 86400 |
//! | `RATE_LIMIT_LOGIN_PATH` | `/auth/login` |
//! | `RATE_LIMIT_PASSWORD_RESET_PATH` | `/auth/password-reset` |
//! | `RATE_LIMIT_REGISTRATION_PATH` | `/auth/register` |

use crate::error::{ConfigError, PolicyError};
use crate::policy::{EndpointPolicyTable, RatePolicy};
use serde::Deserialize;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RATE_LIMIT";

/// Raw, unvalidated settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub default_limit: u32,
    pub default_window_secs: u64,
    pub origin_limit: u32,
    pub origin_window_secs: u64,
    pub identity_limit: u32,
    pub identity_window_secs: u64,
    pub login_limit: u32,
    pub login_window_secs: u64,
    pub login_path: String,
    pub password_reset_limit: u32,
    pub password_reset_window_secs: u64,
    pub password_reset_path: String,
    pub registration_limit: u32,
    pub registration_window_secs: u64,
    pub registration_path: String,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_limit: 100,
            default_window_secs: 60,
            origin_limit: 1000,
            origin_window_secs: 3600,
            identity_limit: 5000,
            identity_window_secs: 3600,
            login_limit: 5,
            login_window_secs: 15 * 60,
            login_path: "/auth/login".to_string(),
            password_reset_limit: 3,
            password_reset_window_secs: 3600,
            password_reset_path: "/auth/password-reset".to_string(),
            registration_limit: 3,
            registration_window_secs: 24 * 3600,
            registration_path: "/auth/register".to_string(),
        }
    }
}

impl RateLimitSettings {
    /// Load settings from `RATE_LIMIT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
    }

    /// Load settings from an arbitrary `config` source.
    pub fn from_source<T>(source: T) -> Result<Self, ConfigError>
    where
        T: config::Source + Send + Sync + 'static,
    {
        let settings = config::Config::builder().add_source(source).build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Validate every policy. A malformed pair is fatal here, never at request time.
    pub fn policies(&self) -> Result<PolicyCatalog, ConfigError> {
        let default = policy("default", self.default_limit, self.default_window_secs)?;
        let origin = policy("origin", self.origin_limit, self.origin_window_secs)?;
        let identity = policy("identity", self.identity_limit, self.identity_window_secs)?;
        let login = policy("login", self.login_limit, self.login_window_secs)?;
        let password_reset = policy(
            "password_reset",
            self.password_reset_limit,
            self.password_reset_window_secs,
        )?;
        let registration =
            policy("registration", self.registration_limit, self.registration_window_secs)?;

        let table = EndpointPolicyTable::new(default)
            .with_origin_tier(origin)
            .with_identity_tier(identity)
            .with_exact(self.login_path.clone(), login)
            .map_err(|source| ConfigError::Policy { setting: "login_path", source })?
            .with_exact(self.password_reset_path.clone(), password_reset)
            .map_err(|source| ConfigError::Policy { setting: "password_reset_path", source })?
            .with_exact(self.registration_path.clone(), registration)
            .map_err(|source| ConfigError::Policy { setting: "registration_path", source })?;

        tracing::info!(
            target: "ratewarden::config",
            default_limit = default.limit(),
            default_window_secs = self.default_window_secs,
            login_path = %self.login_path,
            "rate limit policies loaded"
        );

        Ok(PolicyCatalog { default, origin, identity, login, password_reset, registration, table })
    }
}

fn policy(setting: &'static str, limit: u32, window_secs: u64) -> Result<RatePolicy, ConfigError> {
    RatePolicy::new(limit, Duration::from_secs(window_secs))
        .map_err(|source: PolicyError| ConfigError::Policy { setting, source })
}

/// Validated policies, ready to hand to the limiter and middleware.
#[derive(Debug, Clone)]
pub struct PolicyCatalog {
    pub default: RatePolicy,
    pub origin: RatePolicy,
    pub identity: RatePolicy,
    pub login: RatePolicy,
    pub password_reset: RatePolicy,
    pub registration: RatePolicy,
    table: EndpointPolicyTable,
}

impl PolicyCatalog {
    /// Endpoint table: named endpoints exact-matched, subject tiers, then default.
    pub fn table(&self) -> EndpointPolicyTable {
        self.table.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Subject;
    use crate::policy::PolicyLookup;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        config::Environment::with_prefix(ENV_PREFIX).try_parsing(true).source(Some(map))
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = RateLimitSettings::from_source(env(&[])).unwrap();
        assert_eq!(settings, RateLimitSettings::default());

        let catalog = settings.policies().unwrap();
        assert_eq!(catalog.default, RatePolicy::new(100, Duration::from_secs(60)).unwrap());
        assert_eq!(catalog.login, RatePolicy::new(5, Duration::from_secs(900)).unwrap());
        assert_eq!(
            catalog.registration,
            RatePolicy::new(3, Duration::from_secs(86_400)).unwrap()
        );
    }

    #[test]
    fn environment_overrides_defaults() {
        let settings = RateLimitSettings::from_source(env(&[
            ("RATE_LIMIT_DEFAULT_LIMIT", "250"),
            ("RATE_LIMIT_LOGIN_WINDOW_SECS", "60"),
            ("RATE_LIMIT_LOGIN_PATH", "/v2/session"),
        ]))
        .unwrap();
        assert_eq!(settings.default_limit, 250);
        assert_eq!(settings.login_window_secs, 60);
        assert_eq!(settings.login_path, "/v2/session");
        assert_eq!(settings.origin_limit, 1000);
    }

    #[test]
    fn malformed_policy_is_fatal_at_load() {
        let settings = RateLimitSettings { login_limit: 0, ..RateLimitSettings::default() };
        match settings.policies() {
            Err(ConfigError::Policy { setting, source: PolicyError::MalformedPolicy { .. } }) => {
                assert_eq!(setting, "login")
            }
            other => panic!("expected malformed login policy, got {other:?}"),
        }

        let zero_window =
            RateLimitSettings { default_window_secs: 0, ..RateLimitSettings::default() };
        assert!(zero_window.policies().is_err());
    }

    #[test]
    fn relative_endpoint_path_is_rejected() {
        let settings =
            RateLimitSettings { registration_path: "signup".into(), ..RateLimitSettings::default() };
        assert!(matches!(
            settings.policies(),
            Err(ConfigError::Policy { setting: "registration_path", .. })
        ));
    }

    #[test]
    fn catalog_table_routes_named_endpoints() {
        let catalog = RateLimitSettings::default().policies().unwrap();
        let table = catalog.table();
        assert_eq!(table.resolve("/auth/login", Subject::Origin), catalog.login);
        assert_eq!(table.resolve("/auth/password-reset", Subject::Identity), catalog.password_reset);
        assert_eq!(table.resolve("/auth/register", Subject::Origin), catalog.registration);
        assert_eq!(table.resolve("/backups", Subject::Origin), catalog.origin);
        assert_eq!(table.resolve("/backups", Subject::Identity), catalog.identity);
        assert_eq!(table.resolve("/backups", Subject::Custom), catalog.default);
    }
}
