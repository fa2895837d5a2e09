use std::collections::HashMap;

use super::Severity;

/// Last reported severity per `(host, column)`, consulted by dependency
/// checks. A sweep may overlay this sweep's raw results on top.
#[derive(Debug, Default)]
pub struct StatusBoard {
    reported: HashMap<(String, String), Severity>,
    current: HashMap<(String, String), Severity>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw result from the sweep in progress.
    pub fn observe(&mut self, host: &str, column: &str, severity: Severity) {
        self.current.insert((host.to_string(), column.to_string()), severity);
    }

    pub fn report(&mut self, host: &str, column: &str, severity: Severity) {
        self.reported.insert((host.to_string(), column.to_string()), severity);
    }

    /// This sweep's raw result if the column ran, otherwise the last report.
    pub fn lookup(&self, host: &str, column: &str) -> Option<Severity> {
        let key = (host.to_string(), column.to_string());
        self.current.get(&key).or_else(|| self.reported.get(&key)).copied()
    }

    pub fn end_sweep(&mut self) {
        self.current.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_sweep_shadows_history() {
        let mut board = StatusBoard::new();
        board.report("gw", "conn", Severity::Ok);
        board.observe("gw", "conn", Severity::Critical);
        assert_eq!(board.lookup("gw", "conn"), Some(Severity::Critical));
        board.end_sweep();
        assert_eq!(board.lookup("gw", "conn"), Some(Severity::Ok));
        assert_eq!(board.lookup("gw", "http"), None);
    }
}
