//! Error types for the commissioning engine

use thiserror::Error;

/// Result type for external-stack operations
pub type StackResult<T> = Result<T, StackError>;

/// Result type for engine operations
pub type CommissioningResult<T> = Result<T, CommissioningError>;

/// Result type for configuration validation
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Immediate rejections returned by the external Zigbee stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error("scan already in progress")]
    ScanInProgress,

    #[error("network busy")]
    NetworkBusy,

    #[error("invalid call: {0}")]
    InvalidCall(String),

    #[error("security subsystem rejected the request: {0}")]
    Security(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Errors reported by the commissioning engine
#[derive(Error, Debug)]
pub enum CommissioningError {
    #[error("scan queue full")]
    QueueFull,

    #[error("operation already in progress")]
    OperationInProgress,

    #[error("unknown network index {0}")]
    UnknownNetworkIndex(u8),

    #[error("network index {0} already registered")]
    DuplicateNetworkIndex(u8),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("stack error: {0}")]
    Stack(#[from] StackError),
}

/// Synchronous rejection of invalid configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid channel {0}, expected 11..=26")]
    InvalidChannel(u8),

    #[error("channel mask {0:#010x} has bits outside the 2.4 GHz channel range")]
    InvalidMask(u32),

    #[error("channel mask is empty")]
    EmptyMask,

    #[error("scan duration exponent {0} exceeds 14")]
    InvalidScanDuration(u8),

    #[error("channels-to-consider budget must be at least 1")]
    ZeroChannelBudget,

    #[error("scan queue capacity must be at least 1")]
    ZeroQueueCapacity,
}
