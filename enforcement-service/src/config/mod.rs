use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct EnforcementConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Run against the in-process store with no database and log-only
    /// notifications.
    pub dry_run: bool,
    pub database: DatabaseConfig,
    pub policy: PolicyConfig,
    pub coa: CoaConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    /// RADIUS accounting/NAS database; the main database when unset.
    pub radius_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Enforcement policy knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub quota_warning_threshold: f64,
    /// Days before the due date on which reminders go out.
    pub reminder_days: Vec<i64>,
    pub overdue_grace_days: i64,
    pub invoice_prefix: String,
    pub payment_prefix: String,
    pub invoice_due_days: i64,
    pub default_currency: String,
    /// Attempts per subscriber unit of work on transient store errors.
    pub max_attempts: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            quota_warning_threshold: 0.8,
            reminder_days: vec![3, 7, 14],
            overdue_grace_days: 7,
            invoice_prefix: "INV".to_string(),
            payment_prefix: "PAY".to_string(),
            invoice_due_days: 30,
            default_currency: "USD".to_string(),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoaConfig {
    pub port: u16,
    pub timeout: Duration,
    pub workers: usize,
    pub queue_size: usize,
    /// Used for devices missing from the NAS registry.
    pub default_secret: Option<String>,
}

impl Default for CoaConfig {
    fn default() -> Self {
        Self {
            port: 3799,
            timeout: Duration::from_millis(3000),
            workers: 16,
            queue_size: 1024,
            default_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub aggregate_interval: Duration,
    pub quota_interval: Duration,
    pub billing_interval: Duration,
    pub reminder_interval: Duration,
    pub overdue_interval: Duration,
    pub reset_check_interval: Duration,
    pub lease_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            aggregate_interval: Duration::from_secs(900),
            quota_interval: Duration::from_secs(1800),
            billing_interval: Duration::from_secs(86_400),
            reminder_interval: Duration::from_secs(86_400),
            overdue_interval: Duration::from_secs(86_400),
            reset_check_interval: Duration::from_secs(3600),
            lease_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Notification service base URL; log-only delivery when unset.
    pub service_url: Option<String>,
    pub templates_path: Option<String>,
    pub company_name: String,
    pub company_email: String,
    pub company_phone: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            service_url: None,
            templates_path: None,
            company_name: "Example ISP".to_string(),
            company_email: "billing@example.com".to_string(),
            company_phone: "+1-555-0100".to_string(),
        }
    }
}

impl EnforcementConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let dry_run = parse_env("DRY_RUN", false)?;
        let database_url = if dry_run {
            env::var("DATABASE_URL").unwrap_or_default()
        } else {
            get_env("DATABASE_URL", None, is_prod)?
        };
        let radius_url = env::var("RADIUS_DATABASE_URL").unwrap_or_else(|_| database_url.clone());

        let policy_defaults = PolicyConfig::default();
        let coa_defaults = CoaConfig::default();
        let scheduler_defaults = SchedulerConfig::default();
        let notification_defaults = NotificationConfig::default();

        let quota_warning_threshold =
            parse_env("QUOTA_WARNING_THRESHOLD", policy_defaults.quota_warning_threshold)?;
        if !(0.0..1.0).contains(&quota_warning_threshold) || quota_warning_threshold == 0.0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "QUOTA_WARNING_THRESHOLD must be between 0 and 1, got {}",
                quota_warning_threshold
            )));
        }

        let reminder_days = match env::var("PAYMENT_REMINDER_DAYS") {
            Ok(raw) => parse_day_list(&raw)?,
            Err(_) => policy_defaults.reminder_days.clone(),
        };

        Ok(EnforcementConfig {
            common: common_config,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "enforcement-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            dry_run,
            database: DatabaseConfig {
                url: database_url,
                radius_url,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            policy: PolicyConfig {
                quota_warning_threshold,
                reminder_days,
                overdue_grace_days: parse_env(
                    "OVERDUE_GRACE_DAYS",
                    policy_defaults.overdue_grace_days,
                )?,
                invoice_prefix: env::var("INVOICE_PREFIX")
                    .unwrap_or(policy_defaults.invoice_prefix),
                payment_prefix: env::var("PAYMENT_PREFIX")
                    .unwrap_or(policy_defaults.payment_prefix),
                invoice_due_days: parse_env("INVOICE_DUE_DAYS", policy_defaults.invoice_due_days)?,
                default_currency: get_env(
                    "DEFAULT_CURRENCY",
                    Some(&policy_defaults.default_currency),
                    is_prod,
                )?,
                max_attempts: parse_env("ENGINE_MAX_ATTEMPTS", policy_defaults.max_attempts)?
                    .max(1),
            },
            coa: CoaConfig {
                port: parse_env("COA_PORT", coa_defaults.port)?,
                timeout: Duration::from_millis(parse_env("COA_TIMEOUT_MS", 3000)?),
                workers: parse_env("COA_WORKERS", coa_defaults.workers)?.max(1),
                queue_size: parse_env("COA_QUEUE_SIZE", coa_defaults.queue_size)?.max(1),
                default_secret: env::var("COA_DEFAULT_SECRET").ok().filter(|v| !v.is_empty()),
            },
            scheduler: SchedulerConfig {
                enabled: parse_env("SCHEDULER_ENABLED", scheduler_defaults.enabled)?,
                aggregate_interval: secs_env("AGGREGATE_INTERVAL_SECS", 900)?,
                quota_interval: secs_env("QUOTA_INTERVAL_SECS", 1800)?,
                billing_interval: secs_env("BILLING_INTERVAL_SECS", 86_400)?,
                reminder_interval: secs_env("REMINDER_INTERVAL_SECS", 86_400)?,
                overdue_interval: secs_env("OVERDUE_INTERVAL_SECS", 86_400)?,
                reset_check_interval: secs_env("QUOTA_RESET_CHECK_SECS", 3600)?,
                lease_ttl: secs_env("JOB_LEASE_SECS", 3600)?,
            },
            notifications: NotificationConfig {
                service_url: env::var("NOTIFICATION_SERVICE_URL")
                    .ok()
                    .filter(|v| !v.is_empty()),
                templates_path: env::var("NOTIFICATION_TEMPLATES_PATH")
                    .ok()
                    .filter(|v| !v.is_empty()),
                company_name: env::var("COMPANY_NAME")
                    .unwrap_or(notification_defaults.company_name),
                company_email: env::var("COMPANY_EMAIL")
                    .unwrap_or(notification_defaults.company_email),
                company_phone: env::var("COMPANY_PHONE")
                    .unwrap_or(notification_defaults.company_phone),
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} has invalid value {:?}: {}", key, raw, e))
        }),
        Err(_) => Ok(default),
    }
}

fn secs_env(key: &str, default: u64) -> Result<Duration, AppError> {
    let secs: u64 = parse_env(key, default)?;
    if secs == 0 {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "{} must be greater than zero",
            key
        )));
    }
    Ok(Duration::from_secs(secs))
}

/// Parse a comma separated list of day offsets such as `3,7,14`.
fn parse_day_list(raw: &str) -> Result<Vec<i64>, AppError> {
    let mut days = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let day: i64 = part.parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "PAYMENT_REMINDER_DAYS has invalid entry {:?}: {}",
                part,
                e
            ))
        })?;
        if day < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PAYMENT_REMINDER_DAYS entries must not be negative"
            )));
        }
        days.push(day);
    }
    days.sort_unstable();
    days.dedup();
    Ok(days)
}
