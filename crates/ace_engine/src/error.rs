//! src/error.rs
//!
//! Error taxonomy for the execution core.
//!
//! Every fault the core can raise is an `AceError`. Each variant carries a
//! human readable detail string and the source location that raised it, so
//! the process entry point can print a structured diagnostic
//! (title, detail, originating location) before exiting.
//!
//! User supplied code (analytics, kernels, committers) reports failures with
//! `anyhow::Result`; the core wraps those into `AceError::EngineFailure`
//! with the full context chain folded into the detail.
//!
//! # Fatality
//! - `ProtocolViolation`, `EngineFailure`, `InvalidState`, `Communication`
//!   and `Exhausted` abort the run.
//! - `ResourceUnavailable` is fatal only when no execution resource is left
//!   at all; a single device that cannot be opened is logged and skipped.
//! - `ConfigurationError` is raised before any run starts.

use std::fmt;
use std::panic::Location;
use thiserror::Error;

pub type AceResult<T> = std::result::Result<T, AceError>;

#[derive(Debug, Error)]
pub enum AceError {
    /// Duplicate result index, second start message, result from an idle or
    /// unknown worker, undecodable frame.
    #[error("protocol violation: {detail}")]
    ProtocolViolation {
        detail: String,
        location: &'static Location<'static>,
    },

    /// Execution of a unit failed (serial, piston thread or remote worker).
    #[error("engine failure: {detail}")]
    EngineFailure {
        detail: String,
        location: &'static Location<'static>,
    },

    /// Invalid analytic selection or run configuration.
    #[error("configuration error: {detail}")]
    ConfigurationError {
        detail: String,
        location: &'static Location<'static>,
    },

    /// No accelerator could be enumerated or a device context failed to open.
    #[error("resource unavailable: {detail}")]
    ResourceUnavailable {
        detail: String,
        location: &'static Location<'static>,
    },

    /// `next()` was called on a work source that has produced every unit.
    #[error("work source exhausted after {size} units")]
    Exhausted {
        size: usize,
        location: &'static Location<'static>,
    },

    /// A component was driven in a state that does not allow the call.
    #[error("invalid state: {detail}")]
    InvalidState {
        detail: String,
        location: &'static Location<'static>,
    },

    /// A channel to a peer thread or process closed underneath us.
    #[error("communication failure: {detail}")]
    Communication {
        detail: String,
        location: &'static Location<'static>,
    },
}

impl AceError {
    #[track_caller]
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            detail: detail.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn engine(detail: impl Into<String>) -> Self {
        Self::EngineFailure {
            detail: detail.into(),
            location: Location::caller(),
        }
    }

    /// Wraps an error raised by user code, keeping its whole context chain.
    #[track_caller]
    pub fn engine_from(context: impl fmt::Display, err: anyhow::Error) -> Self {
        Self::EngineFailure {
            detail: format!("{}: {:#}", context, err),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn config(detail: impl Into<String>) -> Self {
        Self::ConfigurationError {
            detail: detail.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn resource(detail: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            detail: detail.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn exhausted(size: usize) -> Self {
        Self::Exhausted {
            size,
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::InvalidState {
            detail: detail.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn communication(detail: impl Into<String>) -> Self {
        Self::Communication {
            detail: detail.into(),
            location: Location::caller(),
        }
    }

    /// Short title printed as the first line of a fatal diagnostic.
    pub fn title(&self) -> &'static str {
        match self {
            Self::ProtocolViolation { .. } => "Protocol Violation",
            Self::EngineFailure { .. } => "Engine Failure",
            Self::ConfigurationError { .. } => "Configuration Error",
            Self::ResourceUnavailable { .. } => "Resource Unavailable",
            Self::Exhausted { .. } | Self::InvalidState { .. } => "Logic Error",
            Self::Communication { .. } => "Communication Error",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Self::ProtocolViolation { detail, .. }
            | Self::EngineFailure { detail, .. }
            | Self::ConfigurationError { detail, .. }
            | Self::ResourceUnavailable { detail, .. }
            | Self::InvalidState { detail, .. }
            | Self::Communication { detail, .. } => detail.clone(),
            Self::Exhausted { size, .. } => {
                format!("Requested a work unit past the last index ({} units).", size)
            }
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self {
            Self::ProtocolViolation { location, .. }
            | Self::EngineFailure { location, .. }
            | Self::ConfigurationError { location, .. }
            | Self::ResourceUnavailable { location, .. }
            | Self::Exhausted { location, .. }
            | Self::InvalidState { location, .. }
            | Self::Communication { location, .. } => location,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigurationError { .. })
    }

    /// Structured, printable form of this error.
    pub fn diagnostic(&self) -> Diagnostic<'_> {
        Diagnostic { error: self }
    }
}

/// Three line fatal report: title, detail, `(file:line)`.
pub struct Diagnostic<'a> {
    error: &'a AceError,
}

impl fmt::Display for Diagnostic<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = self.error.location();
        writeln!(f, "{}", self.error.title())?;
        writeln!(f, "{}", self.error.detail())?;
        write!(f, "({}:{})", location.file(), location.line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_location_points_at_caller() {
        let err = AceError::protocol("duplicate index 3");
        assert!(err.location().file().ends_with("error.rs"));
        assert_eq!(err.title(), "Protocol Violation");
    }

    #[test]
    fn test_engine_from_keeps_context_chain() {
        let inner = anyhow!("device lost").context("kernel launch failed");
        let err = AceError::engine_from("unit 7", inner);
        let detail = err.detail();
        assert!(detail.contains("unit 7"));
        assert!(detail.contains("kernel launch failed"));
        assert!(detail.contains("device lost"));
    }

    #[test]
    fn test_diagnostic_has_three_lines() {
        let err = AceError::config("unknown analytic 'foo'");
        let text = err.diagnostic().to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Configuration Error");
        assert_eq!(lines[1], "unknown analytic 'foo'");
        assert!(lines[2].starts_with('(') && lines[2].ends_with(')'));
        assert!(err.is_configuration());
    }
}
