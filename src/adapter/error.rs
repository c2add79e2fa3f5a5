//! Adapter error types

use std::fmt;

use crate::config::ConfigError;

/// Error type for adapter operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Broker URL could not be used
    InvalidUrl(String),
    /// Initial connection failed or was refused
    Connect(String),
    /// Connection timed out before CONNACK
    Timeout,
    /// Subscribe request could not be issued or was not acknowledged
    Subscribe(String),
    /// Broker refused the operation
    Rejected(String),
    /// Connection dropped while the operation was outstanding
    ConnectionLost(String),
    /// Operation issued while the session is not connected
    NotConnected,
    /// Client request queue is full
    QueueFull,
    /// Reconnect attempts exhausted
    ReconnectExhausted(u32),
    /// Session has been closed
    Closed,
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::InvalidUrl(msg) => write!(f, "Invalid broker URL: {}", msg),
            AdapterError::Connect(msg) => write!(f, "Connect failed: {}", msg),
            AdapterError::Timeout => write!(f, "Connect timed out"),
            AdapterError::Subscribe(msg) => write!(f, "Subscribe failed: {}", msg),
            AdapterError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            AdapterError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            AdapterError::NotConnected => write!(f, "Not connected"),
            AdapterError::QueueFull => write!(f, "Request queue full"),
            AdapterError::ReconnectExhausted(attempts) => {
                write!(f, "Gave up after {} reconnect attempts", attempts)
            }
            AdapterError::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<ConfigError> for AdapterError {
    fn from(e: ConfigError) -> Self {
        AdapterError::InvalidUrl(e.to_string())
    }
}

impl From<rumqttc::ClientError> for AdapterError {
    fn from(e: rumqttc::ClientError) -> Self {
        match e {
            rumqttc::ClientError::TryRequest(_) => AdapterError::QueueFull,
            _ => AdapterError::Closed,
        }
    }
}
