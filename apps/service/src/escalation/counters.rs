//! Consecutive-failure counting and the thresholds that soften early
//! failures.

use std::str::FromStr;

use super::Severity;

/// `c:y:r` from a `badTEST` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub clear: u32,
    pub warn: u32,
    pub alarm: u32,
}

impl FromStr for Thresholds {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let numbers = text
            .split(':')
            .map(|part| part.trim().parse::<u32>().map_err(|_| format!("bad threshold '{part}' in '{text}'")))
            .collect::<Result<Vec<_>, _>>()?;
        let [clear, warn, alarm] = numbers[..] else {
            return Err(format!("expected c:y:r, got '{text}'"));
        };
        if !(clear < warn && warn < alarm) {
            return Err(format!("thresholds must increase, got '{text}'"));
        }
        Ok(Self { clear, warn, alarm })
    }
}

impl Thresholds {
    /// Severity of a critical result after `consecutive` failures in a
    /// row, the current one included.
    ///
    /// Up to `clear` failures are hidden, the ones after that are yellow
    /// and `alarm` or more are red. The yellow band therefore starts right
    /// after `clear`; `warn` only has to lie strictly between the two and
    /// does not move either edge.
    pub fn soften(&self, consecutive: u32) -> Severity {
        if consecutive >= self.alarm {
            Severity::Critical
        } else if consecutive > self.clear {
            Severity::Degraded
        } else {
            Severity::Suppressed
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounter {
    pub consecutive: u32,
    /// Unix time of the first failure in the current streak.
    pub since: Option<i64>,
}

impl FailureCounter {
    pub fn record(&mut self, failed: bool, now: i64) {
        if failed {
            if self.consecutive == 0 {
                self.since = Some(now);
            }
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            *self = Self::default();
        }
    }

    pub fn down_for(&self, now: i64) -> Option<i64> {
        self.since.map(|since| (now - since).max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_increasing_triples() {
        let thresholds: Thresholds = "2:4:6".parse().unwrap();
        assert_eq!(thresholds, Thresholds { clear: 2, warn: 4, alarm: 6 });
        assert!("4:4:6".parse::<Thresholds>().is_err());
        assert!("1:2".parse::<Thresholds>().is_err());
        assert!("a:2:3".parse::<Thresholds>().is_err());
    }

    #[test]
    fn softening_is_monotonic() {
        let thresholds: Thresholds = "2:4:6".parse().unwrap();
        let levels: Vec<Severity> = (1..=8).map(|count| thresholds.soften(count)).collect();
        assert!(levels.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(levels[0], Severity::Suppressed);
        assert_eq!(levels[1], Severity::Suppressed);
        assert_eq!(levels[2], Severity::Degraded);
        assert_eq!(levels[4], Severity::Degraded);
        assert!(levels[5..].iter().all(|level| *level == Severity::Critical));
    }

    #[test]
    fn warn_does_not_move_the_bands() {
        let narrow: Thresholds = "2:3:6".parse().unwrap();
        let wide: Thresholds = "2:5:6".parse().unwrap();
        for count in 1..=8 {
            assert_eq!(narrow.soften(count), wide.soften(count), "after {count} failures");
        }
        assert_eq!(narrow.soften(3), Severity::Degraded);
    }

    #[test]
    fn counter_tracks_streak() {
        let mut counter = FailureCounter::default();
        counter.record(true, 100);
        counter.record(true, 160);
        assert_eq!(counter.consecutive, 2);
        assert_eq!(counter.down_for(220), Some(120));
        counter.record(false, 280);
        assert_eq!(counter, FailureCounter::default());
    }
}
