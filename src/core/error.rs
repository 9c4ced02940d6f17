//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("datastore error: {0}")]
    Datastore(String),

    #[error("assembly error: {0}")]
    Assembly(String),

    #[error("listener error: {0}")]
    Listener(String),

    #[error("overlay error: {0}")]
    Overlay(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
