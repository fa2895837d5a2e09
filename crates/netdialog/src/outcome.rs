use std::fmt;

/// Terminal classification of a single probe.
///
/// Failures here are ordinary values: one probe going wrong never aborts
/// the batch it runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Outcome {
    #[default]
    Ok,
    ConnFailed,
    ConnTimeout,
    BadSslHandshake,
    BadData,
    Interrupted,
    CannotResolve,
    HelperExecFailed,
    HelperTimedOut,
}

impl Outcome {
    pub fn is_ok(self) -> bool {
        matches!(self, Outcome::Ok)
    }

    /// True when the peer could not be reached at all, as opposed to
    /// answering with something unexpected.
    pub fn is_unreachable(self) -> bool {
        matches!(
            self,
            Outcome::ConnFailed | Outcome::ConnTimeout | Outcome::CannotResolve
        )
    }

    pub fn describe(self) -> &'static str {
        match self {
            Outcome::Ok => "OK",
            Outcome::ConnFailed => "Connection failed",
            Outcome::ConnTimeout => "Connection timeout",
            Outcome::BadSslHandshake => "SSL handshake failed",
            Outcome::BadData => "Unexpected service response",
            Outcome::Interrupted => "Connection closed unexpectedly",
            Outcome::CannotResolve => "Cannot resolve hostname",
            Outcome::HelperExecFailed => "Test helper failed",
            Outcome::HelperTimedOut => "Test helper timed out",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}
