use std::collections::HashSet;

use tracing::debug;

use super::{FailureCounter, Severity, StatusBoard, Thresholds, Upstream};

/// Per-test escalation inputs fixed at catalogue build time.
#[derive(Debug, Clone, Default)]
pub struct EscalationSpec {
    pub thresholds: Option<Thresholds>,
    pub upstream: Vec<Upstream>,
    /// The host's own ping column, when its failure should clear this one.
    pub host_ping: Option<String>,
}

/// One column's raw result, ready for a decision.
#[derive(Debug, Clone, Copy)]
pub struct Assessment<'a> {
    pub host: &'a str,
    pub column: &'a str,
    pub base: Severity,
    pub dialup: bool,
    /// Reverse tests fail when the service answers; dialup never hides that.
    pub reverse: bool,
    pub always_report: bool,
    pub escalation: &'a EscalationSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub severity: Severity,
    pub notes: Vec<String>,
    /// Counter state to persist for the next sweep.
    pub counter: FailureCounter,
}

#[derive(Debug, Default)]
pub struct EscalationPolicy {
    nopage: HashSet<String>,
}

impl EscalationPolicy {
    pub fn new(nopage: &[String]) -> Self {
        Self { nopage: nopage.iter().cloned().collect() }
    }

    /// Overlays run in order: dialup, dependencies, failure thresholds,
    /// no-page. Counters follow the raw result, except that a failure
    /// hidden by the dialup flag does not count as down.
    pub fn decide(&self, input: &Assessment<'_>, mut counter: FailureCounter, board: &StatusBoard, now: i64) -> Verdict {
        let dialup = input.dialup && !input.reverse;
        counter.record(input.base.is_failing() && !dialup, now);
        let mut severity = input.base;
        let mut notes = Vec::new();

        if severity.is_failing() && dialup {
            severity = Severity::Suppressed;
            notes.push("Dialup host or service, failure not reported".to_string());
        }

        if severity.is_failing() && !input.always_report {
            if let Some(note) = dependency_note(input, board) {
                severity = Severity::Suppressed;
                notes.push(note);
            }
        }

        if severity.is_failing() {
            if let Some(thresholds) = input.escalation.thresholds {
                let softened = severity.min(thresholds.soften(counter.consecutive));
                if softened < severity {
                    notes.push(format!(
                        "Failure {} of {} before alerting",
                        counter.consecutive, thresholds.alarm
                    ));
                }
                severity = softened;
            }
        }

        if severity == Severity::Critical && self.nopage.contains(input.column) {
            severity = Severity::Degraded;
            notes.push("Service is on the no-page list".to_string());
        }

        if severity != input.base {
            debug!(host = input.host, column = input.column, base = %input.base, reported = %severity, "escalation overlay applied");
        }

        Verdict { severity, notes, counter }
    }
}

fn dependency_note(input: &Assessment<'_>, board: &StatusBoard) -> Option<String> {
    if let Some(ping) = input.escalation.host_ping.as_deref() {
        if ping != input.column && board.lookup(input.host, ping) == Some(Severity::Critical) {
            return Some("Host appears to be down".to_string());
        }
    }

    let failed: Vec<String> = input
        .escalation
        .upstream
        .iter()
        .filter(|upstream| board.lookup(&upstream.host, &upstream.column) == Some(Severity::Critical))
        .map(|upstream| format!("{}/{}", upstream.host, upstream.column))
        .collect();

    (!failed.is_empty()).then(|| format!("Depends on failed test(s): {}", failed.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment<'a>(base: Severity, escalation: &'a EscalationSpec) -> Assessment<'a> {
        Assessment { host: "web", column: "http", base, dialup: false, reverse: false, always_report: false, escalation }
    }

    #[test]
    fn thresholds_walk_through_bands() {
        let escalation = EscalationSpec { thresholds: Some("2:4:6".parse().unwrap()), ..Default::default() };
        let policy = EscalationPolicy::default();
        let board = StatusBoard::new();
        let mut counter = FailureCounter::default();
        let mut reported = Vec::new();

        for sweep in 0..7 {
            let verdict = policy.decide(&assessment(Severity::Critical, &escalation), counter, &board, sweep * 60);
            counter = verdict.counter;
            reported.push(verdict.severity);
        }

        use Severity::*;
        assert_eq!(reported, vec![Suppressed, Suppressed, Degraded, Degraded, Degraded, Critical, Critical]);

        let recovered = policy.decide(&assessment(Ok, &escalation), counter, &board, 600);
        assert_eq!(recovered.severity, Ok);
        assert_eq!(recovered.counter.consecutive, 0);
    }

    #[test]
    fn failed_upstream_suppresses_and_is_named() {
        let escalation = EscalationSpec { upstream: vec![Upstream::new("db", "mysql")], ..Default::default() };
        let mut board = StatusBoard::new();
        board.report("db", "mysql", Severity::Critical);

        let verdict = EscalationPolicy::default().decide(
            &assessment(Severity::Critical, &escalation),
            FailureCounter::default(),
            &board,
            0,
        );
        assert_eq!(verdict.severity, Severity::Suppressed);
        assert!(verdict.notes.iter().any(|note| note.contains("db/mysql")));
        assert_eq!(verdict.counter.consecutive, 1);
    }

    #[test]
    fn host_down_clears_unless_always_report() {
        let escalation = EscalationSpec { host_ping: Some("conn".into()), ..Default::default() };
        let mut board = StatusBoard::new();
        board.observe("web", "conn", Severity::Critical);
        let policy = EscalationPolicy::default();

        let cleared = policy.decide(&assessment(Severity::Critical, &escalation), FailureCounter::default(), &board, 0);
        assert_eq!(cleared.severity, Severity::Suppressed);
        assert_eq!(cleared.notes, vec!["Host appears to be down".to_string()]);

        let mut always = assessment(Severity::Critical, &escalation);
        always.always_report = true;
        let reported = policy.decide(&always, FailureCounter::default(), &board, 0);
        assert_eq!(reported.severity, Severity::Critical);
    }

    #[test]
    fn dialup_and_nopage() {
        let escalation = EscalationSpec::default();
        let policy = EscalationPolicy::new(&["http".to_string()]);
        let board = StatusBoard::new();

        let mut dialup = assessment(Severity::Critical, &escalation);
        dialup.dialup = true;
        assert_eq!(policy.decide(&dialup, FailureCounter::default(), &board, 0).severity, Severity::Suppressed);

        let nopage = policy.decide(&assessment(Severity::Critical, &escalation), FailureCounter::default(), &board, 0);
        assert_eq!(nopage.severity, Severity::Degraded);
        assert_eq!(
            policy.decide(&assessment(Severity::Degraded, &escalation), FailureCounter::default(), &board, 0).severity,
            Severity::Degraded
        );
    }

    #[test]
    fn dialup_failures_are_not_counted() {
        let escalation = EscalationSpec { thresholds: Some("1:2:3".parse().unwrap()), ..Default::default() };
        let policy = EscalationPolicy::default();
        let board = StatusBoard::new();
        let streak = FailureCounter { consecutive: 4, since: Some(0) };

        let mut dialup = assessment(Severity::Critical, &escalation);
        dialup.dialup = true;
        let verdict = policy.decide(&dialup, streak, &board, 60);
        assert_eq!(verdict.severity, Severity::Suppressed);
        assert_eq!(verdict.counter, FailureCounter::default());
    }

    #[test]
    fn reverse_tests_ignore_dialup() {
        let escalation = EscalationSpec::default();
        let policy = EscalationPolicy::default();
        let board = StatusBoard::new();

        let mut reverse = assessment(Severity::Critical, &escalation);
        reverse.dialup = true;
        reverse.reverse = true;
        let verdict = policy.decide(&reverse, FailureCounter::default(), &board, 0);
        assert_eq!(verdict.severity, Severity::Critical);
        assert!(verdict.notes.is_empty());
        assert_eq!(verdict.counter.consecutive, 1);
    }
}
