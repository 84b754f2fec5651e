use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serializer_adapters::{adapter_for_source, AdapterError, AdapterKind, SourceAdapter};
use serializer_core::SOURCE_HACKERNEWS;
use serializer_storage::HttpFetcher;
use thiserror::Error;

use crate::stale::StalenessWindow;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration for {key}: {value:?} ({reason})")]
    InvalidDuration {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} is mandatory but was not set")]
    Missing(&'static str),
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Registry {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("source {name}: {source}")]
    Adapter {
        name: String,
        #[source]
        source: AdapterError,
    },
    #[error("duplicate source name {0}")]
    DuplicateSource(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    /// Zero disables the timer-driven scrape.
    pub scrape_interval: Duration,
    /// Zero leaves runs unbounded.
    pub scrape_timeout: Duration,
    pub staleness: StalenessWindow,
    pub sources_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            scrape_interval: Duration::from_secs(60),
            scrape_timeout: Duration::from_secs(60),
            staleness: StalenessWindow::default(),
            sources_file: None,
            user_agent: "serializer-bot/0.1".to_string(),
            http_timeout_secs: 5,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let duration = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(key) {
                Some(value) => parse_duration(&value).map_err(|reason| {
                    ConfigError::InvalidDuration { key, value, reason }
                }),
                None => Ok(default),
            }
        };

        let http_timeout_secs = match lookup("SERIALIZER_HTTP_TIMEOUT_SECS") {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "SERIALIZER_HTTP_TIMEOUT_SECS",
                value,
            })?,
            None => defaults.http_timeout_secs,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            scrape_interval: duration("SCRAPE_INTERVAL", defaults.scrape_interval)?,
            scrape_timeout: duration("SCRAPE_TIMEOUT", defaults.scrape_timeout)?,
            staleness: StalenessWindow {
                refresh_after: duration("STALE_REFRESH_AFTER", defaults.staleness.refresh_after)?,
                lookback: duration("STALE_LOOKBACK", defaults.staleness.lookback)?,
            },
            sources_file: lookup("SOURCES_FILE").map(PathBuf::from),
            user_agent: lookup("SERIALIZER_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

/// Parses Go-style durations: `0`, `90s`, `1m30s`, `1.5h`, `250ms`.
///
/// A leading `-` is accepted and yields zero, which callers treat as "off".
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_nanos = 0u128;
    let mut chars = rest.chars().peekable();
    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit() || *c == '.') {
            number.push(c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| !c.is_ascii_digit() && *c != '.') {
            unit.push(c);
            chars.next();
        }
        let nanos_per_unit: u128 = match unit.as_str() {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err("missing unit".to_string()),
            other => return Err(format!("unknown unit {other:?}")),
        };
        let nanos = if number.contains('.') {
            let value: f64 = number
                .parse()
                .map_err(|_| format!("bad number {number:?}"))?;
            (value * nanos_per_unit as f64).round() as u128
        } else {
            let value: u128 = number
                .parse()
                .map_err(|_| format!("missing number before {unit:?}"))?;
            value.saturating_mul(nanos_per_unit)
        };
        total_nanos = total_nanos.saturating_add(nanos);
    }

    if negative {
        return Ok(Duration::ZERO);
    }
    let secs = u64::try_from(total_nanos / 1_000_000_000).map_err(|_| "duration overflow".to_string())?;
    Ok(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: AdapterKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self {
            sources: vec![SourceConfig {
                name: SOURCE_HACKERNEWS.to_string(),
                kind: AdapterKind::Hackernews,
                enabled: true,
                path: None,
            }],
        }
    }
}

impl SourceRegistry {
    /// Reads a registry file; relative fixture paths resolve against its directory.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut registry: SourceRegistry =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Registry {
                path: path.to_path_buf(),
                source,
            })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for source in &mut registry.sources {
            if let Some(p) = source.path.as_mut() {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            }
        }
        Ok(registry)
    }

    /// Enabled adapters in registration (file) order.
    pub fn build_adapters(
        &self,
        http: Arc<HttpFetcher>,
    ) -> Result<Vec<Arc<dyn SourceAdapter>>, ConfigError> {
        let mut seen = Vec::new();
        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        for source in self.sources.iter().filter(|s| s.enabled) {
            if seen.contains(&source.name) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
            seen.push(source.name.clone());
            let adapter =
                adapter_for_source(&source.name, source.kind, source.path.as_deref(), http.clone())
                    .map_err(|err| ConfigError::Adapter {
                        name: source.name.clone(),
                        source: err,
                    })?;
            adapters.push(Arc::from(adapter));
        }
        Ok(adapters)
    }
}
