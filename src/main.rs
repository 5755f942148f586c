use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use fitvisor::{Config, Dispatcher, Facility, Log, LogSink, SetupError, StderrSink};

/// Install-time default configuration path.
const DEFAULT_CONFIG: &str = "/usr/local/etc/fitvisor.conf";

#[derive(Parser)]
#[command(name = "fitvisor", version, about = "Host/service fitness monitor")]
struct Opts {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Where to log {stderr, syslog}
    #[arg(long, default_value = "stderr")]
    log: String,

    /// Log facility (when --log is syslog) {local0-7, user, daemon, ...}
    #[arg(long, default_value = "local0")]
    facility: String,
}

fn build_sink(target: &str, facility: &str) -> Result<Arc<dyn LogSink>, SetupError> {
    match target.to_ascii_lowercase().as_str() {
        "stderr" => Ok(Arc::new(StderrSink)),
        #[cfg(unix)]
        "syslog" => {
            let facility: Facility = facility.parse()?;
            Ok(Arc::new(fitvisor::SyslogSink::new(facility)?))
        }
        _ => Err(SetupError::UnknownLogTarget {
            target: target.to_string(),
        }),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();

    let sink = match build_sink(&opts.log, &opts.facility) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("Could not configure logging: {e}");
            return ExitCode::FAILURE;
        }
    };
    let log = Log::new(sink);

    let config = match Config::load(&opts.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Could not load configuration file {}: {e}", opts.config);
            return ExitCode::FAILURE;
        }
    };

    log.info(format!("Loaded {} rules.", config.rules.len()))
        .await;

    Dispatcher::new(log).run(&config).await;
    ExitCode::SUCCESS
}
