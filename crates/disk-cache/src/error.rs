use serde_json::error::Category;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the disk cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("invalid cache key {key:?}")]
    InvalidKey { key: String },

    #[error("invalid item name {name:?}")]
    InvalidItemName { name: String },
}

impl CacheError {
    /// Returns `true` if this is an I/O error of kind `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // serde quotes offending values and `PathMap` holds user paths, so only
        // the category and position survive.
        let what = match err.classify() {
            Category::Io => "io failure",
            Category::Syntax => "invalid syntax",
            Category::Data => "invalid data",
            Category::Eof => "unexpected end of input",
        };
        let message = if err.line() == 0 {
            what.to_string()
        } else {
            format!("{what} at line {} column {}", err.line(), err.column())
        };
        Self::Json { message }
    }
}
