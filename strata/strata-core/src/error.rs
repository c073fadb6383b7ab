//! Error types shared by the Strata crates.

/// Result type alias for Strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for configuration, IO and infrastructure failures.
///
/// Failures of a project reload are reported separately (see
/// `strata_reload::ReloadError`); this type covers everything around it.
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse errors
    #[error("Failed to parse configuration: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("Failed to serialize configuration: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// File watcher errors
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StrataError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new watcher error
    pub fn watcher(msg: impl Into<String>) -> Self {
        Self::Watcher(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::TomlParse(_) | Self::TomlSerialize(_))
    }

    /// Check if this is a watcher error
    pub fn is_watcher(&self) -> bool {
        matches!(self, Self::Watcher(_))
    }
}
