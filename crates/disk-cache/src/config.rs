use crate::error::CacheError;
use std::path::PathBuf;

/// Environment variable overriding the cache root directory.
pub const CACHE_DIR_ENV: &str = "DISK_CACHE_DIR";
/// Environment variable setting the size budget (bytes, or with a `K`/`M`/`G` suffix).
pub const MAX_SIZE_ENV: &str = "DISK_CACHE_MAX_SIZE";

/// Configuration for opening a [`DiskCache`](crate::DiskCache).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// Override the default cache root directory.
    pub cache_root_override: Option<PathBuf>,
    /// Maximum total size in bytes; values below 1 disable eviction.
    pub max_size: i64,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let max_size = match std::env::var(MAX_SIZE_ENV) {
            Ok(raw) => parse_size(&raw).unwrap_or_else(|| {
                tracing::debug!(
                    target = "disk_cache",
                    value = %raw,
                    "ignoring unparseable DISK_CACHE_MAX_SIZE; cache size is unbounded"
                );
                0
            }),
            Err(_) => 0,
        };

        Self {
            cache_root_override: std::env::var_os(CACHE_DIR_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            max_size,
        }
    }

    /// The directory the cache lives in: the override if set, otherwise
    /// `$XDG_CACHE_HOME/disk-cache` or `~/.cache/disk-cache`.
    pub fn cache_root(&self) -> Result<PathBuf, CacheError> {
        match &self.cache_root_override {
            Some(root) => Ok(root.clone()),
            None => default_cache_root(),
        }
    }
}

pub(crate) fn default_cache_root() -> Result<PathBuf, CacheError> {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME").filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(xdg).join("disk-cache"));
    }

    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".cache").join("disk-cache"))
}

/// Parse `1234`, `64K`, `512M` or `2G` (binary multiples, case-insensitive,
/// optional trailing `B`).
pub(crate) fn parse_size(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    let upper = trimmed.to_ascii_uppercase();
    let without_b = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, multiplier) = match without_b.chars().last()? {
        'K' => (&without_b[..without_b.len() - 1], 1i64 << 10),
        'M' => (&without_b[..without_b.len() - 1], 1i64 << 20),
        'G' => (&without_b[..without_b.len() - 1], 1i64 << 30),
        _ => (without_b, 1),
    };
    digits.trim().parse::<i64>().ok()?.checked_mul(multiplier)
}
