use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("negotiation rejected: {0}")]
    ConfigRejected(String),

    #[error("media port is already closed")]
    AlreadyClosed,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn configuration<E: std::fmt::Display>(err: E) -> Self {
        Self::Configuration(err.to_string())
    }

    pub fn rejected<E: std::fmt::Display>(err: E) -> Self {
        Self::ConfigRejected(err.to_string())
    }

    pub fn decode<E: std::fmt::Display>(err: E) -> Self {
        Self::Decode(err.to_string())
    }
}
