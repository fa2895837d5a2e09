//! Telnet option refusal.
//!
//! A telnet server usually opens with a burst of `IAC DO/WILL <option>`
//! triples. We refuse every one of them and, as soon as something other
//! than an option shows up, treat the rest of the stream as the banner.

use std::borrow::Cow;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;

#[derive(Debug, Clone)]
pub struct TelnetRefuser {
    negotiating: bool,
    /// An incomplete command cut off at the end of the previous read.
    partial: Vec<u8>,
}

impl Default for TelnetRefuser {
    fn default() -> Self {
        Self { negotiating: true, partial: Vec::new() }
    }
}

fn tail(buffer: Cow<'_, [u8]>, from: usize) -> Cow<'_, [u8]> {
    match buffer {
        Cow::Borrowed(bytes) => Cow::Borrowed(&bytes[from..]),
        Cow::Owned(bytes) => Cow::Owned(bytes[from..].to_vec()),
    }
}

impl TelnetRefuser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_negotiating(&self) -> bool {
        self.negotiating
    }

    /// Consume commands from the front of `data`, appending a refusal for
    /// each option request to `replies`. Returns the banner bytes left
    /// over, which is empty while the server is still negotiating.
    ///
    /// `WILL`/`WONT`/`DO`/`DONT` take three bytes, every other command two.
    /// A command split across reads is held back until the rest arrives.
    pub fn feed<'a>(&mut self, data: &'a [u8], replies: &mut Vec<u8>) -> Cow<'a, [u8]> {
        if !self.negotiating {
            return Cow::Borrowed(data);
        }

        let buffer: Cow<'a, [u8]> = if self.partial.is_empty() {
            Cow::Borrowed(data)
        } else {
            let mut joined = std::mem::take(&mut self.partial);
            joined.extend_from_slice(data);
            Cow::Owned(joined)
        };

        let mut pos = 0;
        loop {
            let Some(&first) = buffer.get(pos) else {
                return Cow::Borrowed(&[]);
            };
            if first != IAC {
                self.negotiating = false;
                return tail(buffer, pos);
            }

            let size = match buffer.get(pos + 1) {
                Some(&(WILL | WONT | DO | DONT)) => 3,
                // An escaped 0xff is data.
                Some(&IAC) => {
                    self.negotiating = false;
                    return tail(buffer, pos);
                }
                _ => 2,
            };
            if buffer.len() < pos + size {
                self.partial = buffer[pos..].to_vec();
                return Cow::Borrowed(&[]);
            }

            let response = match buffer[pos + 1] {
                WILL | WONT => Some(DONT),
                DO | DONT => Some(WONT),
                _ => None,
            };
            if let Some(response) = response {
                replies.extend_from_slice(&[IAC, response, buffer[pos + 2]]);
            }
            pos += size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_every_option() {
        let mut refuser = TelnetRefuser::new();
        let mut replies = Vec::new();
        let banner = refuser.feed(&[IAC, DO, 24, IAC, WILL, 1, IAC, DONT, 3], &mut replies);

        assert!(banner.is_empty());
        assert!(refuser.is_negotiating());
        assert_eq!(replies, vec![IAC, WONT, 24, IAC, DONT, 1, IAC, WONT, 3]);
    }

    #[test]
    fn banner_ends_negotiation() {
        let mut refuser = TelnetRefuser::new();
        let mut replies = Vec::new();
        let mut data = vec![IAC, WILL, 3];
        data.extend_from_slice(b"login: ");

        let banner = refuser.feed(&data, &mut replies);
        assert_eq!(&banner[..], b"login: ");
        assert!(!refuser.is_negotiating());

        replies.clear();
        assert_eq!(&refuser.feed(&[IAC, DO, 1], &mut replies)[..], &[IAC, DO, 1]);
        assert!(replies.is_empty());
    }

    #[test]
    fn unknown_commands_are_skipped_silently() {
        let mut refuser = TelnetRefuser::new();
        let mut replies = Vec::new();
        let banner = refuser.feed(&[IAC, 241, IAC, 249], &mut replies);
        assert!(banner.is_empty());
        assert!(replies.is_empty());
        assert!(refuser.is_negotiating());
    }

    #[test]
    fn two_byte_commands_leave_the_banner_intact() {
        let mut refuser = TelnetRefuser::new();
        let mut replies = Vec::new();
        let banner = refuser.feed(&[IAC, 249, b'l', b'o', b'g'], &mut replies);
        assert_eq!(&banner[..], b"log");
        assert!(replies.is_empty());
    }

    #[test]
    fn option_split_across_reads_is_still_refused() {
        let mut refuser = TelnetRefuser::new();
        let mut replies = Vec::new();

        assert!(refuser.feed(&[IAC, DO], &mut replies).is_empty());
        assert!(refuser.is_negotiating());
        assert!(replies.is_empty());

        let banner = refuser.feed(&[1, b'l', b'o', b'g'], &mut replies);
        assert_eq!(&banner[..], b"log");
        assert_eq!(replies, vec![IAC, WONT, 1]);
        assert!(!refuser.is_negotiating());
    }

    #[test]
    fn lone_iac_waits_for_its_command() {
        let mut refuser = TelnetRefuser::new();
        let mut replies = Vec::new();
        assert!(refuser.feed(&[IAC, WILL, 3, IAC], &mut replies).is_empty());
        assert!(refuser.feed(&[WILL], &mut replies).is_empty());
        let banner = refuser.feed(&[5, b'>'], &mut replies);
        assert_eq!(&banner[..], b">");
        assert_eq!(replies, vec![IAC, DONT, 3, IAC, DONT, 5]);
    }
}
