//! NTP client exchange.
//!
//! Four request/reply rounds over one connected UDP socket. Each round
//! yields a clock-offset sample; the reported offset is the average of the
//! samples after the worst one (farthest from the median) is discarded.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PACKET_LEN: usize = 48;
pub const ATTEMPTS: usize = 4;

/// Seconds between the NTP epoch (1900) and the Unix epoch.
pub const EPOCH_OFFSET: u64 = 2_208_988_800;

const LI_VN_MODE: u8 = (3 << 3) | 3;
const POLL: u8 = 8;
const TWO_POW_32: f64 = 4_294_967_296.0;

/// 32.32 fixed-point NTP timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let seconds = (since_unix.as_secs() + EPOCH_OFFSET) as u32;
        let fraction = ((u64::from(since_unix.subsec_micros()) << 32) / 1_000_000) as u32;
        Self { seconds, fraction }
    }

    fn read(bytes: &[u8]) -> Self {
        Self {
            seconds: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            fraction: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    fn write(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.seconds.to_be_bytes());
        out[4..8].copy_from_slice(&self.fraction.to_be_bytes());
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.seconds) + f64::from(self.fraction) / TWO_POW_32
    }
}

/// Build a client request stamped with `sent` as transmit time.
pub fn client_packet(sent: SystemTime) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = LI_VN_MODE;
    packet[2] = POLL;
    NtpTimestamp::from_system_time(sent).write(&mut packet[40..48]);
    packet
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerReply {
    pub stratum: u8,
    pub receive: NtpTimestamp,
    pub transmit: NtpTimestamp,
}

pub fn parse_reply(packet: &[u8]) -> Option<ServerReply> {
    if packet.len() != PACKET_LEN {
        return None;
    }
    Some(ServerReply {
        stratum: packet[1],
        receive: NtpTimestamp::read(&packet[32..40]),
        transmit: NtpTimestamp::read(&packet[40..48]),
    })
}

/// Fold a difference of two 32-bit-second timestamps back into +/- 2^31.
fn wrap(difference: f64) -> f64 {
    if difference >= TWO_POW_32 / 2.0 {
        difference - TWO_POW_32
    } else if difference <= -TWO_POW_32 / 2.0 {
        difference + TWO_POW_32
    } else {
        difference
    }
}

/// Clock offset in seconds for one round.
pub fn sample_offset(sent: NtpTimestamp, reply: &ServerReply, received: NtpTimestamp) -> f64 {
    (wrap(reply.receive.as_f64() - sent.as_f64()) + wrap(reply.transmit.as_f64() - received.as_f64())) / 2.0
}

/// Average of the answered samples with the worst outlier removed.
///
/// With fewer than three answers nothing is trimmed.
pub fn trimmed_offset(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    if samples.len() < 3 {
        return Some(samples.iter().sum::<f64>() / samples.len() as f64);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let middle = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 { (sorted[middle - 1] + sorted[middle]) / 2.0 } else { sorted[middle] };

    let worst = samples
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| (*a - median).abs().total_cmp(&(*b - median).abs()))
        .map(|(index, _)| index)?;

    let kept: Vec<f64> = samples.iter().enumerate().filter(|(index, _)| *index != worst).map(|(_, sample)| *sample).collect();
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// What the exchange wants from the socket next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NtpIntent {
    Send([u8; PACKET_LEN]),
    Receive,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NtpReport {
    pub offset: Option<f64>,
    pub stratum: Option<u8>,
    pub answered: usize,
    /// Datagrams received, parseable or not.
    pub received: usize,
}

impl NtpReport {
    /// Stratum 0 ("kiss") and 16 mean the server is not synchronised.
    pub fn is_synchronised(&self) -> bool {
        matches!(self.stratum, Some(stratum) if (1..16).contains(&stratum))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NtpExchange {
    attempt: usize,
    sent: Option<NtpTimestamp>,
    samples: Vec<Option<f64>>,
    stratum: Option<u8>,
    received: usize,
}

impl NtpExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intent(&mut self, now: SystemTime) -> NtpIntent {
        if self.attempt >= ATTEMPTS {
            return NtpIntent::Done;
        }
        if self.sent.is_some() {
            return NtpIntent::Receive;
        }
        let packet = client_packet(now);
        self.sent = Some(NtpTimestamp::from_system_time(now));
        NtpIntent::Send(packet)
    }

    /// Give up on the current round without a sample, after a short write
    /// or when no reply arrived in time.
    pub fn abandon_round(&mut self) {
        self.sent = None;
        self.samples.push(None);
        self.attempt += 1;
    }

    pub fn on_reply(&mut self, packet: &[u8], now: SystemTime) {
        let Some(sent) = self.sent.take() else {
            return;
        };
        self.received += 1;
        let sample = parse_reply(packet).map(|reply| {
            self.stratum = Some(reply.stratum);
            sample_offset(sent, &reply, NtpTimestamp::from_system_time(now))
        });
        self.samples.push(sample);
        self.attempt += 1;
    }

    pub fn report(&self) -> NtpReport {
        let answered: Vec<f64> = self.samples.iter().flatten().copied().collect();
        NtpReport {
            offset: trimmed_offset(&answered),
            stratum: self.stratum,
            answered: answered.len(),
            received: self.received,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trimmed_average_drops_outlier() {
        let offset = trimmed_offset(&[0.010, 0.012, 0.011, 1.000]).unwrap();
        assert!((offset - 0.011).abs() < 1e-12, "offset was {offset}");
    }

    #[test]
    fn few_samples_are_not_trimmed() {
        assert_eq!(trimmed_offset(&[]), None);
        assert_eq!(trimmed_offset(&[0.5]), Some(0.5));
        assert_eq!(trimmed_offset(&[0.25, 0.75]), Some(0.5));
    }

    #[test]
    fn timestamp_uses_ntp_epoch() {
        let time = UNIX_EPOCH + Duration::new(1, 500_000_000);
        let stamp = NtpTimestamp::from_system_time(time);
        assert_eq!(u64::from(stamp.seconds), EPOCH_OFFSET + 1);
        assert_eq!(stamp.fraction, 1 << 31);
    }

    #[test]
    fn packet_layout() {
        let packet = client_packet(UNIX_EPOCH + Duration::from_secs(10));
        assert_eq!(packet[0], 0x1b);
        assert_eq!(packet[2], 8);
        assert_eq!(&packet[40..44], &((EPOCH_OFFSET + 10) as u32).to_be_bytes());
    }

    fn reply_with_offset(sent: SystemTime, offset: Duration, stratum: u8) -> [u8; PACKET_LEN] {
        let mut packet = [0u8; PACKET_LEN];
        packet[1] = stratum;
        NtpTimestamp::from_system_time(sent + offset).write(&mut packet[32..40]);
        NtpTimestamp::from_system_time(sent + offset).write(&mut packet[40..48]);
        packet
    }

    #[test]
    fn exchange_runs_four_rounds() {
        let mut exchange = NtpExchange::new();
        let base = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        for round in 0..ATTEMPTS {
            let now = base + Duration::from_secs(round as u64);
            assert!(matches!(exchange.intent(now), NtpIntent::Send(_)));
            assert_eq!(exchange.intent(now), NtpIntent::Receive);
            exchange.on_reply(&reply_with_offset(now, Duration::from_millis(20), 2), now);
        }
        assert_eq!(exchange.intent(base), NtpIntent::Done);

        let report = exchange.report();
        assert_eq!(report.answered, 4);
        assert_eq!(report.stratum, Some(2));
        assert!(report.is_synchronised());
        let offset = report.offset.unwrap();
        assert!((offset - 0.020).abs() < 1e-5, "offset was {offset}");
    }

    #[test]
    fn short_reply_yields_no_sample() {
        let mut exchange = NtpExchange::new();
        let now = SystemTime::now();
        exchange.intent(now);
        exchange.on_reply(&[0u8; 12], now);
        exchange.intent(now);
        exchange.abandon_round();
        let report = exchange.report();
        assert_eq!(report.answered, 0);
        assert_eq!(report.received, 1);
        assert_eq!(report.offset, None);
        assert!(!report.is_synchronised());
    }
}
