//! # fitvisor
//!
//! **fitvisor** is a host/service fitness monitor: it periodically executes
//! user-defined test commands, classifies each run as success or failure,
//! and triggers user-defined side-effect commands when a rule's state
//! transitions between those classes.
//!
//! ## Features
//!
//! | Area            | Description                                                        | Key types / traits            |
//! |-----------------|--------------------------------------------------------------------|-------------------------------|
//! | **Rules**       | Immutable probe definitions with defaulting and inheritance.       | [`Rule`], [`Config`]          |
//! | **Scheduling**  | Delayed-start, variable-interval tickers, one per rule.            | [`DelayedTicker`]             |
//! | **Supervision** | Per-rule drivers with two-stage timeout escalation and debouncing. | [`RuleDriver`], [`Completion`]|
//! | **Dispatch**    | Start-delay buckets released in ascending order, completion join.  | [`Dispatcher`]                |
//! | **Logging**     | Structured sink handed to each driver (stderr or syslog).          | [`LogSink`], [`Log`]          |
//! | **Errors**      | Typed errors for configuration, setup, and ticker misuse.          | [`ConfigError`], [`SetupError`], [`TickerError`] |
//!
//! ```no_run
//! use std::sync::Arc;
//! use fitvisor::{Config, Dispatcher, Log, StderrSink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config: Config = r#"
//!         interval = 30s
//!         web { test = "curl"; test_arguments = [ "-sf", "http://localhost/" ] }
//!     "#.parse()?;
//!
//!     let log = Log::new(Arc::new(StderrSink));
//!     Dispatcher::new(log).run(&config).await;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod config;
mod dispatcher;
mod driver;
mod error;
mod rule;
mod sink;
mod syslog;
mod ticker;

// ---- Public re-exports ----

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use driver::{Completion, RuleDriver, RunRecord};
pub use error::{ConfigError, SetupError, TickerError};
pub use rule::{Rule, RuleState, RuleStatus};
pub use sink::{Log, LogSink, Severity, StderrSink};
pub use syslog::Facility;

#[cfg(unix)]
pub use syslog::SyslogSink;
