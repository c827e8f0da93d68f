use crate::types::MessagePriority;
use std::time::Duration;
use thiserror::Error;

/// 消息校验错误（结构或时间戳不合法）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("message_type is empty")]
    EmptyMessageType,

    #[error("vehicle_id is empty")]
    EmptyVehicleId,

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(f64),

    #[error("timestamp {ahead_secs:.3}s ahead of now exceeds tolerance {tolerance_secs:.3}s")]
    TimestampInFuture { ahead_secs: f64, tolerance_secs: f64 },

    #[error("payload has {entries} entries, limit is {limit}")]
    PayloadTooLarge { entries: usize, limit: usize },

    #[error("payload nesting depth {depth} exceeds limit {limit}")]
    PayloadTooDeep { depth: usize, limit: usize },

    #[error("raw message is {size} bytes, limit is {limit}")]
    RawMessageTooLarge { size: usize, limit: usize },

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// 规范化序列化错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SerializationError {
    #[error("non-finite number at {path}")]
    NonFiniteNumber { path: String },

    #[error("encoding failed: {0}")]
    Encode(String),
}

/// 传输层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("send refused: {0}")]
    Refused(String),
}

/// 车辆消息处理相关错误类型
#[derive(Error, Debug)]
pub enum VehicleError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Message queue full for {0} priority")]
    QueueFull(MessagePriority),

    #[error("Processing service stopped")]
    ServiceStopped,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, VehicleError>;

impl VehicleError {
    /// 检查是否为可恢复的错误
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VehicleError::QueueFull(_)
                | VehicleError::Transport(TransportError::Timeout(_))
                | VehicleError::Transport(TransportError::Refused(_))
        )
    }
}

impl TransportError {
    /// 简短的错误类别名，用于日志和统计
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::NotConnected => "not_connected",
            TransportError::Timeout(_) => "timeout",
            TransportError::Refused(_) => "refused",
        }
    }
}
