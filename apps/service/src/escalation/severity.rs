use std::fmt;

/// Reported severity, ordered so that folding with `max` keeps the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    #[default]
    Ok,
    Suppressed,
    Degraded,
    Critical,
}

impl Severity {
    pub fn color(self) -> &'static str {
        match self {
            Severity::Ok => "green",
            Severity::Suppressed => "clear",
            Severity::Degraded => "yellow",
            Severity::Critical => "red",
        }
    }

    pub fn from_color(color: &str) -> Option<Self> {
        match color {
            "green" => Some(Severity::Ok),
            "clear" => Some(Severity::Suppressed),
            "yellow" => Some(Severity::Degraded),
            "red" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Degraded or critical.
    pub fn is_failing(self) -> bool {
        self >= Severity::Degraded
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.color())
    }
}
