//! # System log sink.
//!
//! [`SyslogSink`] speaks the BSD syslog datagram protocol (RFC 3164) over
//! the local log socket. Each message is one datagram, so concurrent
//! writers cannot interleave. The facility is chosen at startup from the
//! CLI; unknown facility names are a [`SetupError`] before dispatch.

use std::fmt;
use std::str::FromStr;

use crate::error::SetupError;
use crate::sink::Severity;

/// Standard syslog facilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Facility {
    Kern,
    User,
    Mail,
    Daemon,
    Auth,
    Syslog,
    Lpr,
    News,
    Uucp,
    Cron,
    Authpriv,
    Ftp,
    Local0,
    Local1,
    Local2,
    Local3,
    Local4,
    Local5,
    Local6,
    Local7,
}

impl Facility {
    /// Numeric facility code as defined by RFC 3164.
    pub fn code(&self) -> u8 {
        match self {
            Facility::Kern => 0,
            Facility::User => 1,
            Facility::Mail => 2,
            Facility::Daemon => 3,
            Facility::Auth => 4,
            Facility::Syslog => 5,
            Facility::Lpr => 6,
            Facility::News => 7,
            Facility::Uucp => 8,
            Facility::Cron => 9,
            Facility::Authpriv => 10,
            Facility::Ftp => 11,
            Facility::Local0 => 16,
            Facility::Local1 => 17,
            Facility::Local2 => 18,
            Facility::Local3 => 19,
            Facility::Local4 => 20,
            Facility::Local5 => 21,
            Facility::Local6 => 22,
            Facility::Local7 => 23,
        }
    }
}

impl FromStr for Facility {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let f = match s.to_ascii_lowercase().as_str() {
            "kern" => Facility::Kern,
            "user" => Facility::User,
            "mail" => Facility::Mail,
            "daemon" => Facility::Daemon,
            "auth" => Facility::Auth,
            "syslog" => Facility::Syslog,
            "lpr" => Facility::Lpr,
            "news" => Facility::News,
            "uucp" => Facility::Uucp,
            "cron" => Facility::Cron,
            "authpriv" => Facility::Authpriv,
            "ftp" => Facility::Ftp,
            "local0" => Facility::Local0,
            "local1" => Facility::Local1,
            "local2" => Facility::Local2,
            "local3" => Facility::Local3,
            "local4" => Facility::Local4,
            "local5" => Facility::Local5,
            "local6" => Facility::Local6,
            "local7" => Facility::Local7,
            _ => {
                return Err(SetupError::UnknownFacility {
                    name: s.to_string(),
                })
            }
        };
        Ok(f)
    }
}

impl fmt::Display for Facility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Facility::Kern => "kern",
            Facility::User => "user",
            Facility::Mail => "mail",
            Facility::Daemon => "daemon",
            Facility::Auth => "auth",
            Facility::Syslog => "syslog",
            Facility::Lpr => "lpr",
            Facility::News => "news",
            Facility::Uucp => "uucp",
            Facility::Cron => "cron",
            Facility::Authpriv => "authpriv",
            Facility::Ftp => "ftp",
            Facility::Local0 => "local0",
            Facility::Local1 => "local1",
            Facility::Local2 => "local2",
            Facility::Local3 => "local3",
            Facility::Local4 => "local4",
            Facility::Local5 => "local5",
            Facility::Local6 => "local6",
            Facility::Local7 => "local7",
        };
        f.write_str(s)
    }
}

/// Maps a [`Severity`] to the RFC 3164 severity code.
fn severity_code(severity: Severity) -> u8 {
    match severity {
        Severity::Error => 3,
        Severity::Warning => 4,
        Severity::Info => 6,
        Severity::Debug => 7,
    }
}

#[cfg(unix)]
pub use unix::SyslogSink;

#[cfg(unix)]
mod unix {
    use std::os::unix::net::UnixDatagram;
    use std::path::Path;

    use async_trait::async_trait;

    use super::{severity_code, Facility};
    use crate::error::SetupError;
    use crate::sink::{LogSink, Severity};

    /// Local syslog socket paths, tried in order.
    const LOG_SOCKETS: &[&str] = &["/dev/log", "/var/run/syslog", "/var/run/log"];

    /// Sink delivering RFC 3164 datagrams to the local syslog daemon.
    pub struct SyslogSink {
        socket: UnixDatagram,
        facility: Facility,
        tag: String,
    }

    impl SyslogSink {
        /// Connects to the local log socket.
        ///
        /// The tag is the process name; together with the pid it lets the
        /// daemon attribute messages.
        pub fn new(facility: Facility) -> Result<Self, SetupError> {
            let socket = Self::connect().map_err(|source| SetupError::Syslog { source })?;
            let tag = std::env::args()
                .next()
                .as_deref()
                .map(Path::new)
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "fitvisor".to_string());

            Ok(Self {
                socket,
                facility,
                tag,
            })
        }

        fn connect() -> std::io::Result<UnixDatagram> {
            let socket = UnixDatagram::unbound()?;
            let mut last = None;
            for path in LOG_SOCKETS {
                match socket.connect(path) {
                    Ok(()) => return Ok(socket),
                    Err(e) => last = Some(e),
                }
            }
            Err(last.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound)))
        }
    }

    #[async_trait]
    impl LogSink for SyslogSink {
        async fn log(&self, severity: Severity, message: &str) {
            let pri = (self.facility.code() << 3) | severity_code(severity);
            let frame = format!(
                "<{}>{}[{}]: {}",
                pri,
                self.tag,
                std::process::id(),
                message
            );
            // a failed send is not recoverable here, drop the message
            let _ = self.socket.send(frame.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facility_parses_standard_names() {
        for (name, code) in [
            ("kern", 0),
            ("user", 1),
            ("mail", 2),
            ("daemon", 3),
            ("auth", 4),
            ("syslog", 5),
            ("lpr", 6),
            ("news", 7),
            ("uucp", 8),
            ("cron", 9),
            ("authpriv", 10),
            ("ftp", 11),
            ("local0", 16),
            ("local7", 23),
        ] {
            let f: Facility = name.parse().unwrap();
            assert_eq!(f.code(), code, "{name}");
            assert_eq!(f.to_string(), name);
        }
    }

    #[test]
    fn facility_parse_is_case_insensitive() {
        let f: Facility = "LOCAL3".parse().unwrap();
        assert_eq!(f, Facility::Local3);
    }

    #[test]
    fn unknown_facility_is_rejected() {
        assert!("local8".parse::<Facility>().is_err());
        assert!("".parse::<Facility>().is_err());
    }

    #[test]
    fn priority_encoding_matches_rfc3164() {
        // local0.info == 16 * 8 + 6
        let pri = (Facility::Local0.code() << 3) | severity_code(Severity::Info);
        assert_eq!(pri, 134);

        let pri = (Facility::Daemon.code() << 3) | severity_code(Severity::Error);
        assert_eq!(pri, 27);
    }
}
