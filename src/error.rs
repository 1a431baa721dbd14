//! Crate-level error returned by every controller operation.

use crate::analysis::AnalysisError;
use crate::analyzer::SettingsError;
use crate::automation_service::ServiceError;
use crate::protocol::RemoteCode;
use crate::registry::ConfigError;
use crate::session::InvalidTransition;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Broad failure class, stable enough for callers to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad names, parameters or call order; nothing was sent to the service.
    Configuration,
    /// The service is unreachable or the socket closed.
    Connection,
    Timeout,
    /// The service answered with a failure.
    Remote,
    Analysis,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Remote => "remote",
            Self::Analysis => "analysis",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogicError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Channel {channel} is not enabled in device configuration '{config}'")]
    InvalidChannel { channel: u32, config: String },

    #[error(transparent)]
    Session(#[from] InvalidTransition),

    #[error("No connected device{}", .device_type.as_ref().map(|t| format!(" of type {t}")).unwrap_or_default())]
    NoDevice { device_type: Option<String> },

    #[error("An analyzer labelled '{label}' is already attached to this capture")]
    DuplicateLabel { label: String },

    #[error("Decoder type '{decoder}' is not known to the automation service")]
    UnknownDecoderType { decoder: String },

    #[error("Invalid analyzer settings: {0}")]
    InvalidSettings(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Capture did not complete within {after:?}")]
    CaptureTimeout { after: Duration },

    #[error("Trigger condition was not observed within {after:?}")]
    TriggerTimeout { after: Duration },

    #[error("Export did not finish within {after:?}")]
    ExportTimeout { after: Duration },

    #[error("{operation} got no reply within {after:?}")]
    RequestTimeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Automation service refused the connection at {addr}; is it running?")]
    ConnectionRefused { addr: String },

    #[error("Connection to automation service lost")]
    ConnectionLost,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Automation service reported {code}: {message}")]
    Remote { code: RemoteCode, message: String },

    #[error("Unexpected reply from automation service: {0}")]
    Protocol(String),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// Which step a service call belonged to; decides how timeouts and remote
/// failures are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Request,
    Capture,
    Trigger,
    Export,
    Analyzer,
}

impl LogicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_)
            | Self::InvalidChannel { .. }
            | Self::Session(_)
            | Self::NoDevice { .. }
            | Self::DuplicateLabel { .. }
            | Self::InvalidSettings(_)
            | Self::Analysis(AnalysisError::InvalidWindow(_)) => ErrorKind::Configuration,
            Self::CaptureTimeout { .. }
            | Self::TriggerTimeout { .. }
            | Self::ExportTimeout { .. }
            | Self::RequestTimeout { .. } => ErrorKind::Timeout,
            Self::ConnectionRefused { .. } | Self::ConnectionLost => ErrorKind::Connection,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::UnknownDecoderType { .. } | Self::Export(_) | Self::Remote { .. } | Self::Protocol(_) => {
                ErrorKind::Remote
            }
            Self::Analysis(_) => ErrorKind::Analysis,
        }
    }

    /// Whether the failure happened before anything reached the service.
    pub fn is_local(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    pub(crate) fn from_service(error: ServiceError, stage: Stage) -> Self {
        match (error, stage) {
            (ServiceError::Timeout { after, .. }, Stage::Capture) => Self::CaptureTimeout { after },
            (ServiceError::Timeout { after, .. }, Stage::Trigger) => Self::TriggerTimeout { after },
            (ServiceError::Timeout { after, .. }, Stage::Export) => Self::ExportTimeout { after },
            (ServiceError::Timeout { operation, after }, _) => Self::RequestTimeout { operation, after },
            (ServiceError::Remote { code, message }, Stage::Export) => Self::Export(format!("{code}: {message}")),
            (
                ServiceError::Remote {
                    code: RemoteCode::UnknownAnalyzer,
                    message,
                },
                Stage::Analyzer,
            ) => Self::UnknownDecoderType { decoder: message },
            (
                ServiceError::Remote {
                    code: RemoteCode::InvalidSettings,
                    message,
                },
                Stage::Analyzer,
            ) => Self::InvalidSettings(message),
            (ServiceError::Remote { code, message }, _) => Self::Remote { code, message },
            (ServiceError::ConnectionRefused { addr }, _) => Self::ConnectionRefused { addr },
            (ServiceError::ConnectionLost, _) => Self::ConnectionLost,
            (ServiceError::Cancelled { .. }, _) => Self::Cancelled,
            (ServiceError::Protocol(message), _) => Self::Protocol(message),
            (ServiceError::InvalidRequest(message), _) => {
                Self::Config(ConfigError::InvalidParameter(message))
            }
        }
    }
}

impl From<SettingsError> for LogicError {
    fn from(e: SettingsError) -> Self {
        Self::InvalidSettings(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LogicError>;
