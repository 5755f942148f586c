//! # Error types used by the fitvisor runtime.
//!
//! Three error enums cover the pre-dispatch and runtime failure domains:
//!
//! - [`ConfigError`]: configuration parsing and resolution failures (fatal,
//!   reported with the offending rule name and field).
//! - [`SetupError`]: logging destination/facility setup failures (fatal).
//! - [`TickerError`]: misuse of a [`DelayedTicker`](crate::ticker::DelayedTicker);
//!   surfaces to the driver, which logs and disables the rule when there is
//!   no recovery path.
//!
//! Rule-scoped subprocess failures stay inside the driver as
//! [`std::io::Error`] values in the per-run record; they never propagate.

use std::io;

use thiserror::Error;

/// Errors produced while parsing and resolving the configuration.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("could not read configuration: {0}")]
    Io(#[from] io::Error),

    /// The configuration text is not well formed.
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// A group or rule node has an empty key.
    #[error("rule is missing a name")]
    MissingName,

    /// A rule or group name was used more than once.
    #[error("{name}: name has been used already")]
    DuplicateName { name: String },

    /// A field held a value of the wrong type.
    #[error("{name}: '{field}' must be {expected}")]
    WrongType {
        name: String,
        field: String,
        expected: &'static str,
    },

    /// A field held a value outside its permitted range.
    #[error("{name}: '{field}' must be in {range}")]
    OutOfRange {
        name: String,
        field: String,
        range: &'static str,
    },

    /// A field held a value that does not parse to anything meaningful.
    #[error("{name}: '{field}' does not contain a valid value: {message}")]
    BadValue {
        name: String,
        field: String,
        message: String,
    },

    /// An unrecognized property appeared on a node.
    #[error("{name}: '{field}' unrecognized property")]
    UnknownField { name: String, field: String },

    /// A node at rule depth has no `test` command.
    #[error("{name}: a 'test' value must exist for rules")]
    MissingTest { name: String },

    /// A rule node contained a child object.
    #[error("{name}: '{field}' rules cannot contain child rules")]
    NestedRule { name: String, field: String },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Io(_) => "config_io",
            ConfigError::Syntax { .. } => "config_syntax",
            ConfigError::MissingName => "config_missing_name",
            ConfigError::DuplicateName { .. } => "config_duplicate_name",
            ConfigError::WrongType { .. } => "config_wrong_type",
            ConfigError::OutOfRange { .. } => "config_out_of_range",
            ConfigError::BadValue { .. } => "config_bad_value",
            ConfigError::UnknownField { .. } => "config_unknown_field",
            ConfigError::MissingTest { .. } => "config_missing_test",
            ConfigError::NestedRule { .. } => "config_nested_rule",
        }
    }
}

/// Errors produced while setting up the log sink from CLI flags.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SetupError {
    /// The log destination is not one of `stderr` / `syslog`.
    #[error("invalid log location '{target}', must be one of {{stderr, syslog}}")]
    UnknownLogTarget { target: String },

    /// The syslog facility name is not in the standard set.
    #[error("invalid syslog facility '{name}'")]
    UnknownFacility { name: String },

    /// The syslog socket could not be opened.
    #[error("could not connect to syslog: {source}")]
    Syslog {
        #[source]
        source: io::Error,
    },
}

/// Misuse of a [`DelayedTicker`](crate::ticker::DelayedTicker).
///
/// These are programming errors on the consumer side; the ticker refuses
/// the operation instead of entering an inconsistent state.
#[non_exhaustive]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TickerError {
    /// `start` was called while the ticker was already emitting.
    #[error("ticker already running")]
    AlreadyRunning,

    /// `start` was called on a ticker that was previously stopped.
    #[error("cannot start a stopped ticker")]
    Stopped,

    /// `stop` or `change_interval` was called while not running.
    #[error("ticker not running")]
    NotRunning,
}
