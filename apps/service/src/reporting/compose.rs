//! From finished probes to per-column results and status text.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use netdialog::Outcome;

use crate::catalogue::{TestKind, TestSpec};
use crate::escalation::{EscalationSpec, Severity, Verdict};
use crate::probe::{ProbeState, ProtocolState};

const MAX_DETAIL: usize = 4096;
const SECONDS_PER_DAY: i64 = 86_400;

/// Days of certificate validity below which the TLS column degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateExpiry {
    pub warn_days: u32,
    pub alarm_days: u32,
}

impl Default for CertificateExpiry {
    fn default() -> Self {
        Self { warn_days: 30, alarm_days: 10 }
    }
}

impl CertificateExpiry {
    /// Grade a certificate ending at `not_after`, seen at `now`.
    pub fn grade(&self, not_after: i64, now: i64) -> (Severity, String) {
        let left = not_after - now;
        let expiry = chrono::DateTime::from_timestamp(not_after, 0)
            .map_or_else(|| not_after.to_string(), |at| at.format("%Y-%m-%d %H:%M UTC").to_string());
        let days = left.div_euclid(SECONDS_PER_DAY);
        let severity = if days < i64::from(self.alarm_days) {
            Severity::Critical
        } else if days < i64::from(self.warn_days) {
            Severity::Degraded
        } else {
            Severity::Ok
        };
        let text = if left < 0 {
            format!("certificate expired {} day(s) ago ({expiry})", (-left) / SECONDS_PER_DAY)
        } else {
            format!("certificate expires in {days} day(s) ({expiry})")
        };
        (severity, text)
    }
}

/// One probe's raw judgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub severity: Severity,
    pub summary: String,
    pub details: String,
    /// Payload for data-only tests.
    pub data: Option<String>,
}

/// Everything reported under one `host.column`.
#[derive(Debug, Clone)]
pub struct ColumnResult {
    pub host: String,
    pub column: String,
    pub base: Severity,
    pub lines: Vec<String>,
    pub details: Vec<String>,
    pub data: Vec<String>,
    pub interval: Duration,
    pub dialup: bool,
    pub reverse: bool,
    pub always_report: bool,
    pub send_as_data: bool,
    pub escalation: EscalationSpec,
}

impl ColumnResult {
    fn new(spec: &TestSpec, column: &str) -> Self {
        Self {
            host: spec.host().to_string(),
            column: column.to_string(),
            base: Severity::Ok,
            lines: Vec::new(),
            details: Vec::new(),
            data: Vec::new(),
            interval: spec.interval,
            dialup: spec.flags.dialup,
            reverse: spec.flags.reverse,
            always_report: spec.flags.always_report,
            send_as_data: spec.flags.send_as_data,
            escalation: spec.escalation.clone(),
        }
    }

    /// Fold in another probe of the same column; severity only rises.
    fn absorb(&mut self, spec: &TestSpec, evaluation: Evaluation) {
        self.base = self.base.max(evaluation.severity);
        self.dialup &= spec.flags.dialup;
        self.reverse &= spec.flags.reverse;
        self.always_report |= spec.flags.always_report;
        self.send_as_data &= spec.flags.send_as_data;
        self.interval = self.interval.min(spec.interval);
        self.lines.push(format!("&{} {}", evaluation.severity.color(), evaluation.summary));
        if !evaluation.details.trim().is_empty() {
            self.details.push(evaluation.details);
        }
        self.data.extend(evaluation.data);
    }
}

fn clip(text: &str) -> String {
    if text.len() <= MAX_DETAIL {
        return text.to_string();
    }
    let mut end = MAX_DETAIL;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated]", &text[..end])
}

fn failure(state: &ProbeState, label: &str) -> Evaluation {
    let mut summary = format!("{label} - {}", state.outcome());
    if let Some(detail) = &state.detail {
        let _ = write!(summary, ": {detail}");
    }
    Evaluation { severity: Severity::Critical, summary, details: transcript(state), data: None }
}

fn transcript(state: &ProbeState) -> String {
    match &state.protocol {
        ProtocolState::Dialog(dialog) if dialog.http().is_none() => clip(&dialog.transcript().text()),
        ProtocolState::Dns(report) => report.summary(),
        ProtocolState::Helper { output } => clip(output),
        _ => String::new(),
    }
}

/// Judge one finished probe.
pub fn evaluate(state: &ProbeState) -> Evaluation {
    let spec = &state.spec;
    let label = spec.id.testspec.as_str();
    let outcome = state.outcome();
    let took = state.timing.elapsed().map(|took| format!(" ({:.3} s)", took.as_secs_f64())).unwrap_or_default();

    if spec.flags.reverse {
        let (severity, summary) = if outcome.is_unreachable() {
            (Severity::Ok, format!("{label} - not reachable, as expected"))
        } else {
            (Severity::Critical, format!("{label} - service is reachable but should not be{took}"))
        };
        return Evaluation { severity, summary, details: String::new(), data: None };
    }

    if outcome != Outcome::Ok {
        return failure(state, label);
    }

    match (&state.protocol, &spec.kind) {
        (ProtocolState::Dialog(dialog), TestKind::Http { content, .. }) => {
            let Some(http) = dialog.http() else {
                return failure(state, label);
            };
            let Some(status) = http.status() else {
                return Evaluation {
                    severity: Severity::Critical,
                    summary: format!("{label} - no HTTP response"),
                    details: String::new(),
                    data: None,
                };
            };
            let headers = String::from_utf8_lossy(http.headers()).into_owned();
            let data = spec.flags.send_as_data.then(|| String::from_utf8_lossy(http.body()).into_owned());
            let (severity, summary) = if status >= 400 {
                (Severity::Critical, format!("{label} - HTTP status {status}{took}"))
            } else if content.as_ref().is_some_and(|content| !content.accepts(http.body())) {
                (Severity::Critical, format!("{label} - content check failed (HTTP status {status})"))
            } else {
                (Severity::Ok, format!("{label} - HTTP status {status}{took}"))
            };
            Evaluation { severity, summary, details: clip(&headers), data }
        }
        (ProtocolState::Ntp(exchange), _) => {
            let report = exchange.report();
            let stratum = report.stratum.map_or_else(|| "?".to_string(), |stratum| stratum.to_string());
            if !report.is_synchronised() {
                return Evaluation {
                    severity: Severity::Critical,
                    summary: format!("{label} - server is not synchronised (stratum {stratum})"),
                    details: String::new(),
                    data: None,
                };
            }
            let offset = report.offset.unwrap_or_default();
            Evaluation {
                severity: Severity::Ok,
                summary: format!("{label} - offset {offset:.6} s, stratum {stratum}, {} replies", report.answered),
                details: String::new(),
                data: None,
            }
        }
        _ => Evaluation {
            severity: Severity::Ok,
            summary: format!("{label} - OK{took}"),
            details: transcript(state),
            data: None,
        },
    }
}

/// Group evaluated probes by `(host, column)`, in column order.
pub fn fold(states: &[ProbeState]) -> Vec<ColumnResult> {
    let mut columns: BTreeMap<(String, String), ColumnResult> = BTreeMap::new();
    for state in states {
        let spec = &state.spec;
        columns
            .entry((spec.host().to_string(), spec.column.clone()))
            .or_insert_with(|| ColumnResult::new(spec, &spec.column))
            .absorb(spec, evaluate(state));
    }
    columns.into_values().collect()
}

/// TLS session details of secure probes, one column per host, graded by
/// the time left on each leaf certificate.
pub fn tls_columns(states: &[ProbeState], column: &str, expiry: CertificateExpiry, now: i64) -> Vec<ColumnResult> {
    let mut columns: BTreeMap<String, ColumnResult> = BTreeMap::new();
    for state in states.iter().filter(|state| state.spec.tls) {
        let spec = &state.spec;
        let label = spec.id.testspec.as_str();
        let evaluation = match (&state.tls, state.outcome()) {
            (Some(tls), _) => {
                let (severity, validity) = match tls.not_after {
                    Some(not_after) => expiry.grade(not_after, now),
                    None => (Severity::Ok, "certificate validity unknown".to_string()),
                };
                Evaluation {
                    severity,
                    summary: format!(
                        "{label} - {} {}, {} certificate(s) presented, {validity}",
                        tls.protocol, tls.cipher, tls.peer_certificates
                    ),
                    details: String::new(),
                    data: None,
                }
            }
            (None, Outcome::BadSslHandshake) => Evaluation {
                severity: Severity::Critical,
                summary: format!("{label} - {}", Outcome::BadSslHandshake),
                details: String::new(),
                data: None,
            },
            (None, _) => continue,
        };

        columns
            .entry(spec.host().to_string())
            .or_insert_with(|| {
                let mut result = ColumnResult::new(spec, column);
                result.escalation = EscalationSpec::default();
                result.reverse = false;
                result.send_as_data = false;
                result
            })
            .absorb(spec, evaluation);
    }
    columns.into_values().collect()
}

fn headline(severity: Severity) -> &'static str {
    match severity {
        Severity::Ok => "OK",
        Severity::Suppressed => "failure not reported",
        Severity::Degraded => "degraded",
        Severity::Critical => "NOT ok",
    }
}

/// Status text: headline, escalation notes, one line per probe, then the
/// collected details.
pub fn status_text(result: &ColumnResult, verdict: &Verdict, down_for: Option<i64>) -> String {
    let mut text = format!("{} {}\n", result.column, headline(verdict.severity));
    for note in &verdict.notes {
        let _ = writeln!(text, "{note}");
    }
    if let Some(seconds) = down_for.filter(|_| verdict.severity.is_failing() || result.base.is_failing()) {
        let _ = writeln!(text, "Down for {} minute(s)", seconds / 60);
    }
    text.push('\n');
    for line in &result.lines {
        let _ = writeln!(text, "{line}");
    }
    for details in &result.details {
        text.push('\n');
        text.push_str(details.trim_end());
        text.push('\n');
    }
    text
}

/// Figures for the engine's own status column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub tests: usize,
    pub failures: usize,
    pub helpers: usize,
    pub elapsed: Duration,
    pub location: Option<String>,
}

pub fn self_report_text(stats: &SweepStats) -> String {
    let mut text = String::from("netprobe OK\n\n");
    let _ = writeln!(text, "Tests run: {}", stats.tests);
    let _ = writeln!(text, "Failures: {}", stats.failures);
    let _ = writeln!(text, "Helper processes: {}", stats.helpers);
    let _ = writeln!(text, "Sweep time: {:.2} s", stats.elapsed.as_secs_f64());
    if let Some(location) = &stats.location {
        let _ = writeln!(text, "Location: {location}");
    }
    let _ = writeln!(text, "Version: netprobe {}", netdialog::AGENT_VERSION);
    text
}
