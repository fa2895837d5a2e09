//! Wire format of the collector's status protocol.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone};

use crate::escalation::Severity;

const MIN_LIFETIME_MINUTES: u64 = 30;

/// Dots in host names become commas in `host.column`.
pub fn commafy(host: &str) -> String {
    host.replace('.', ",")
}

/// Minutes a status stays valid: twice the test interval, at least 30.
pub fn lifetime_minutes(interval: Duration) -> u64 {
    let minutes = interval.as_secs().div_ceil(60);
    (2 * minutes).max(MIN_LIFETIME_MINUTES)
}

pub fn timestamp<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    time.format("%a %b %e %H:%M:%S %Y").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Status { host: String, column: String, severity: Severity, lifetime: u64, stamp: String, text: String },
    Data { host: String, column: String, text: String },
}

impl Message {
    pub fn host(&self) -> &str {
        match self {
            Message::Status { host, .. } | Message::Data { host, .. } => host,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Message::Status { column, .. } | Message::Data { column, .. } => column,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Status { host, column, severity, lifetime, stamp, text } => {
                write!(f, "status+{lifetime} {}.{column} {} {stamp} {text}", commafy(host), severity.color())
            }
            Message::Data { host, column, text } => write!(f, "data {}.{column}\n{text}", commafy(host)),
        }
    }
}

/// Pack messages into `combo` envelopes of at most `batch_size` each.
pub fn envelopes(messages: &[Message], batch_size: usize) -> Vec<String> {
    messages
        .chunks(batch_size.max(1))
        .map(|chunk| match chunk {
            [single] => single.to_string(),
            many => {
                let mut payload = String::from("combo\n");
                payload.push_str(&many.iter().map(Message::to_string).collect::<Vec<_>>().join("\n\n"));
                payload
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn status(host: &str, severity: Severity) -> Message {
        Message::Status {
            host: host.into(),
            column: "ssh".into(),
            severity,
            lifetime: 30,
            stamp: "Mon Oct 19 12:00:00 2026".into(),
            text: "ssh OK".into(),
        }
    }

    #[test]
    fn status_line() {
        assert_eq!(
            status("www.example.net", Severity::Critical).to_string(),
            "status+30 www,example,net.ssh red Mon Oct 19 12:00:00 2026 ssh OK"
        );
        let data = Message::Data { host: "a.b".into(), column: "apache".into(), text: "Total Accesses: 1".into() };
        assert_eq!(data.to_string(), "data a,b.apache\nTotal Accesses: 1");
    }

    #[test]
    fn lifetime_is_twice_the_interval() {
        assert_eq!(lifetime_minutes(Duration::from_secs(300)), 30);
        assert_eq!(lifetime_minutes(Duration::from_secs(1800)), 60);
        assert_eq!(lifetime_minutes(Duration::from_secs(90)), 30);
        assert_eq!(lifetime_minutes(Duration::from_secs(1830)), 62);
    }

    #[test]
    fn timestamps_are_padded() {
        let time = Utc.with_ymd_and_hms(2026, 10, 5, 7, 8, 9).unwrap();
        assert_eq!(timestamp(&time), "Mon Oct  5 07:08:09 2026");
    }

    #[test]
    fn combo_batches() {
        let messages: Vec<Message> = (0..5).map(|_| status("h", Severity::Ok)).collect();
        let payloads = envelopes(&messages, 2);
        assert_eq!(payloads.len(), 3);
        assert!(payloads[0].starts_with("combo\nstatus+30 h.ssh green"));
        assert_eq!(payloads[0].matches("status+").count(), 2);
        assert!(payloads[2].starts_with("status+30"));
    }
}
