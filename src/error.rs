//! Registry-level errors

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::namespace::NamespaceError;
use crate::node::{PermissionType, PermissionValue};

/// Errors surfaced by the permission registry
#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("invalid namespace: {0}")]
    InvalidNamespace(#[from] NamespaceError),

    #[error("value '{value}' cannot be used as {expected}")]
    InvalidValue {
        value: PermissionValue,
        expected: PermissionType,
    },

    #[error("unknown permission backend '{0}'")]
    UnknownBackend(String),

    #[error("no permission backend is loaded")]
    NotLoaded,

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, PermissionError>;
