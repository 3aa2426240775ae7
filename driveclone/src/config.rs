use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use drive_core::AuthContext;

use crate::replicate::ledger::default_db_path;
use crate::replicate::retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_BASE, DEFAULT_TIMEOUT_MAX};
use crate::replicate::scheduler::DEFAULT_PARALLEL_LIMIT;
use crate::replicate::walker::DEFAULT_PAGE_SIZE;
use crate::replicate::{DEFAULT_PROGRESS_INTERVAL, EngineOptions, NotFoundPolicy, RetryPolicy};

#[derive(Clone, Debug)]
pub struct CloneConfig {
    pub auth: Option<AuthContext>,
    pub api_base: Option<String>,
    pub db_path: PathBuf,
    pub default_target: Option<String>,
    pub parallel_limit: usize,
    pub retry_limit: u32,
    pub timeout_base: Duration,
    pub timeout_max: Duration,
    pub page_size: u32,
    pub not_found: NotFoundPolicy,
    pub progress_interval: Duration,
}

impl CloneConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars<F>(vars: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = match non_empty(&vars, "DRIVECLONE_DB_PATH") {
            Some(value) => match dirs::home_dir() {
                Some(home) => expand_with_home(&value, &home),
                None => PathBuf::from(value),
            },
            None => default_db_path().context("cannot pick a ledger location, set DRIVECLONE_DB_PATH")?,
        };
        let not_found = match non_empty(&vars, "DRIVECLONE_NOT_FOUND") {
            Some(value) => value
                .parse::<NotFoundPolicy>()
                .map_err(anyhow::Error::msg)
                .context("invalid DRIVECLONE_NOT_FOUND")?,
            None => NotFoundPolicy::default(),
        };
        let timeout_base = Duration::from_millis(read_u64_env(
            &vars,
            "DRIVECLONE_TIMEOUT_BASE_MS",
            DEFAULT_TIMEOUT_BASE.as_millis() as u64,
        ));
        let timeout_max = Duration::from_millis(read_u64_env(
            &vars,
            "DRIVECLONE_TIMEOUT_MAX_MS",
            DEFAULT_TIMEOUT_MAX.as_millis() as u64,
        ))
        .max(timeout_base);

        Ok(Self {
            auth: non_empty(&vars, "DRIVECLONE_TOKEN").map(AuthContext::bearer),
            api_base: non_empty(&vars, "DRIVECLONE_API_BASE"),
            db_path,
            default_target: non_empty(&vars, "DRIVECLONE_DEFAULT_TARGET"),
            parallel_limit: read_u64_env(
                &vars,
                "DRIVECLONE_PARALLEL_LIMIT",
                DEFAULT_PARALLEL_LIMIT as u64,
            ) as usize,
            retry_limit: read_u64_env(&vars, "DRIVECLONE_RETRY_LIMIT", u64::from(DEFAULT_MAX_ATTEMPTS))
                .min(u64::from(u32::MAX)) as u32,
            timeout_base,
            timeout_max,
            page_size: read_u64_env(&vars, "DRIVECLONE_PAGE_SIZE", u64::from(DEFAULT_PAGE_SIZE))
                .clamp(1, 1000) as u32,
            not_found,
            progress_interval: Duration::from_millis(read_u64_env(
                &vars,
                "DRIVECLONE_PROGRESS_MS",
                DEFAULT_PROGRESS_INTERVAL.as_millis() as u64,
            )),
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            parallel_limit: self.parallel_limit,
            page_size: self.page_size,
            retry: RetryPolicy::new(self.timeout_base, self.timeout_max, self.retry_limit),
            not_found: self.not_found,
            progress_interval: self.progress_interval,
        }
    }

    pub fn require_auth(&self) -> anyhow::Result<AuthContext> {
        self.auth
            .clone()
            .context("DRIVECLONE_TOKEN is not set")
    }
}

fn non_empty<F>(vars: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    vars(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env<F>(vars: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    vars(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}
