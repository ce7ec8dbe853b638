use thiserror::Error;

/// Main error type for EN 50221 stack operations
#[derive(Error, Debug)]
pub enum En50221Error {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Bad session number {0}")]
    BadSessionNumber(u16),

    #[error("Iovec count {0} exceeds the session layer limit")]
    IovLimit(usize),

    #[error("Malformed SPDU: {0}")]
    MalformedSpdu(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for EN 50221 stack operations
pub type En50221Result<T> = Result<T, En50221Error>;
