use thiserror::Error;

#[derive(Debug, Error)]
pub enum GutPunchError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GutPunchError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            GutPunchError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, GutPunchError>;
