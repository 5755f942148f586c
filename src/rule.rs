//! # Rule model.
//!
//! A [`Rule`] is a single monitored probe: a test command plus its
//! scheduling, timeout, and state-change configuration. Rules are built by
//! the configuration resolver ([`Config`](crate::config::Config)) and are
//! immutable afterward; each [`RuleDriver`](crate::driver::RuleDriver)
//! receives a private copy.

use std::fmt;
use std::time::Duration;

/// Last classified outcome of a rule's probe.
///
/// `Unknown` is the initial sentinel: the first classified observation
/// always fires the corresponding change handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RuleState {
    #[default]
    Unknown,
    Success,
    Fail,
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleState::Unknown => "unknown",
            RuleState::Success => "success",
            RuleState::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// Administrative status of a rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RuleStatus {
    /// Not assigned during parsing; resolution turns this into `Enabled`.
    #[default]
    Unset,
    Enabled,
    /// A disabled rule leaves the run-time configuration.
    Disabled,
    /// Every run classifies as `Fail`, regardless of the probe outcome.
    AlwaysFail,
    /// Every run classifies as `Success`, regardless of the probe outcome.
    AlwaysSuccess,
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleStatus::Unset => "unset",
            RuleStatus::Enabled => "enabled",
            RuleStatus::Disabled => "disabled",
            RuleStatus::AlwaysFail => "always-fail",
            RuleStatus::AlwaysSuccess => "always-success",
        };
        f.write_str(s)
    }
}

/// A fully resolved monitoring rule.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rule {
    /// Name of the grouping the rule belongs to ("default" at top level).
    pub group_name: String,

    /// Fully qualified name, e.g. `group/rule`. Unique across the config.
    pub name: String,

    pub status: RuleStatus,

    /// Period between scheduled runs.
    pub interval: Duration,

    /// Period between scheduled runs while the rule is in the `Fail` state.
    pub interval_fail: Duration,

    /// Delay from dispatch until the first run.
    pub start_delay: Duration,

    /// How long a probe may run before it is interrupted / killed.
    /// Zero disables the respective stage.
    pub timeout_int: Duration,
    pub timeout_kill: Duration,

    /// Total number of runs, 0 for unbounded. `runs = 1` plus `always-fail`
    /// is useful for administratively failing over a host.
    pub runs: u16,

    /// Probe command and its arguments.
    pub test: String,
    pub test_arguments: Vec<String>,

    /// Command to run when the state changes to `Fail`.
    pub change_fail: String,
    pub change_fail_arguments: Vec<String>,
    pub change_fail_debounce: u16,

    /// Command to run when the state changes to `Success`.
    pub change_success: String,
    pub change_success_arguments: Vec<String>,
    pub change_success_debounce: u16,
}

impl Rule {
    pub(crate) fn new(name: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_name: group_name.into(),
            ..Self::default()
        }
    }
}
