use thiserror::Error;

/// Error taxonomy for awaited generation calls.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Preset not found: {0}")]
    PresetNotFound(String),
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),
    #[error("Main narrative profile not configured. Please set up an API profile in Settings.")]
    MainProfileMissing,
    #[error("{0}")]
    MissingCredential(String),
    #[error("settings unavailable: {0:#}")]
    Settings(anyhow::Error),
    #[error("structured output rejected: {0}")]
    Validation(String),
    #[error("generation cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Validation,
    Transport,
    Cancelled,
}

impl GenerationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PresetNotFound(_)
            | Self::ProfileNotFound(_)
            | Self::MainProfileMissing
            | Self::MissingCredential(_)
            | Self::Settings(_) => ErrorClass::Configuration,
            Self::Validation(_) => ErrorClass::Validation,
            Self::Transport(_) => ErrorClass::Transport,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.class() == ErrorClass::Configuration
    }

    /// Nothing in this crate retries; callers decide.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

pub type GenerationResult<T> = std::result::Result<T, GenerationError>;
