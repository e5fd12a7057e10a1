use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    /// The config file or a `CADENCE_*` variable could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CadenceError>;
