use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    #[error("invalid entity name: {0}")]
    InvalidName(String),

    #[error("unknown deployment strategy: {0}")]
    UnknownStrategy(String),

    #[error("unknown timing profile: {0}")]
    UnknownTimingProfile(String),
}

pub type Result<T> = std::result::Result<T, InputError>;
