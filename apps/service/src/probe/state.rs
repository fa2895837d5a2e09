use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netdialog::{Dialog, Outcome, dns::DnsReport, ntp::NtpExchange};

use super::ProbeId;
use crate::catalogue::{TestKind, TestSpec};

/// Protocol progress of one probe.
#[derive(Debug)]
pub enum ProtocolState {
    Dialog(Dialog),
    Ntp(NtpExchange),
    Dns(DnsReport),
    /// Helper-backed tests; filled in when the helper is reaped.
    Helper { output: String },
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub queued: Instant,
    pub started: Option<Instant>,
    pub connected: Option<Instant>,
    pub finished: Option<Instant>,
}

impl Timing {
    /// Start to finish; `None` until both are known.
    pub fn elapsed(&self) -> Option<Duration> {
        Some(self.finished?.saturating_duration_since(self.started?))
    }

    pub fn connect_time(&self) -> Option<Duration> {
        Some(self.connected?.saturating_duration_since(self.started?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSummary {
    pub protocol: String,
    pub cipher: String,
    pub peer_certificates: usize,
    /// Unix time the leaf certificate stops being valid.
    pub not_after: Option<i64>,
}

#[derive(Debug)]
pub struct ProbeState {
    pub id: ProbeId,
    pub spec: Arc<TestSpec>,
    pub address: Option<IpAddr>,
    pub protocol: ProtocolState,
    pub timing: Timing,
    pub deadline: Option<Instant>,
    pub tls: Option<TlsSummary>,
    /// Extra cause text, e.g. a helper's exit status.
    pub detail: Option<String>,
    outcome: Option<Outcome>,
}

impl ProbeState {
    pub fn new(id: ProbeId, spec: Arc<TestSpec>) -> Self {
        let protocol = match (spec.dialog(), &spec.kind) {
            (Some(dialog), _) => ProtocolState::Dialog(dialog),
            (None, TestKind::Ntp) => ProtocolState::Ntp(NtpExchange::new()),
            (None, TestKind::Dns { .. }) => ProtocolState::Dns(DnsReport::default()),
            (None, _) => ProtocolState::Helper { output: String::new() },
        };
        Self {
            id,
            spec,
            address: None,
            protocol,
            timing: Timing { queued: Instant::now(), started: None, connected: None, finished: None },
            deadline: None,
            tls: None,
            detail: None,
            outcome: None,
        }
    }

    pub fn start(&mut self, now: Instant, timeout: Duration) {
        self.timing.started = Some(now);
        self.deadline = Some(now + timeout);
    }

    /// Record the terminal outcome. Only the first call counts.
    pub fn finish(&mut self, outcome: Outcome, now: Instant) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        self.timing.finished = Some(now);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome.unwrap_or_default()
    }

    pub fn dialog(&self) -> Option<&Dialog> {
        match &self.protocol {
            ProtocolState::Dialog(dialog) => Some(dialog),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spec;

    #[test]
    fn first_outcome_wins() {
        let mut state = ProbeState::new(ProbeId::for_tests(1), spec("ssh"));
        let now = Instant::now();
        state.start(now, Duration::from_secs(5));

        assert!(state.finish(Outcome::ConnTimeout, now + Duration::from_secs(5)));
        assert!(!state.finish(Outcome::Ok, now + Duration::from_secs(6)));
        assert_eq!(state.outcome(), Outcome::ConnTimeout);
        assert_eq!(state.timing.elapsed(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn protocol_follows_test_kind() {
        let id = ProbeId::for_tests(0);
        assert!(matches!(ProbeState::new(id, spec("ntp")).protocol, ProtocolState::Ntp(_)));
        assert!(matches!(ProbeState::new(id, spec("dns")).protocol, ProtocolState::Dns(_)));
        assert!(matches!(ProbeState::new(id, spec("http://probe.example.net/")).protocol, ProtocolState::Dialog(_)));
        assert!(matches!(ProbeState::new(id, spec("rpc")).protocol, ProtocolState::Helper { .. }));
    }
}
