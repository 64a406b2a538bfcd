//! Error types for the MQTT operation layer.

use std::time::Duration;

use thiserror::Error;

use crate::acl::Permission;

/// Error type for MQTT operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid topic rules or settings; every problem is listed.
    #[error("mqtt: invalid configuration: {}", .0.join("; "))]
    Configuration(Vec<String>),

    /// Configuration file could not be parsed.
    #[error("mqtt: config parse error: {0}")]
    ConfigParse(String),

    /// No matching rule grants the required permission.
    #[error("mqtt: no {permission} permission for topic '{topic}'")]
    PermissionDenied { topic: String, permission: Permission },

    /// The broker session is down.
    #[error("mqtt: broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Publish request could not be handed to the client.
    #[error("mqtt: publish error: {0}")]
    Publish(String),

    /// Subscribe or unsubscribe request could not be handed to the client.
    #[error("mqtt: subscribe error: {0}")]
    Subscribe(String),

    /// Deadline elapsed with no qualifying message.
    #[error("mqtt: timeout after {timeout:?} waiting for message on '{filter}'")]
    Timeout { filter: String, timeout: Duration },

    /// The caller cancelled the operation.
    #[error("mqtt: operation cancelled")]
    Cancelled,

    /// Malformed operation parameters.
    #[error("mqtt: invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable snake_case tag for structured error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) | Error::ConfigParse(_) => "configuration_error",
            Error::PermissionDenied { .. } => "permission_denied",
            Error::BrokerUnavailable(_) => "broker_unavailable",
            Error::Publish(_) => "publish_error",
            Error::Subscribe(_) => "subscribe_error",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled => "cancelled",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Io(_) => "io_error",
            Error::Json(_) => "invalid_json",
        }
    }
}

/// Result type for MQTT operations.
pub type Result<T> = std::result::Result<T, Error>;
