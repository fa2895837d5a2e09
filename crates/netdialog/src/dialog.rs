//! The scripted conversation engine.
//!
//! A [`Dialog`] walks a [`Script`] one instruction at a time. The caller
//! asks [`Dialog::intent`] what to do, performs that I/O, and reports back
//! through `on_written`, `on_data`, `on_peer_closed` and friends. Telnet
//! and HTTP sessions get their decoders layered over the generic steps.

use std::borrow::Cow;

use crate::http::HttpDecoder;
use crate::script::{Instruction, Script};
use crate::telnet::TelnetRefuser;
use crate::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Plain,
    Telnet,
    Http,
}

/// Next I/O the conversation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Write(Vec<u8>),
    Read,
    StartTls,
    /// Shut down our write side; nothing more will be sent.
    HalfClose,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HalfClose {
    NotYet,
    Pending,
    Done,
}

/// What was exchanged, for the status message.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub log: Vec<u8>,
    pub bytes_read: usize,
    pub bytes_written: usize,
}

impl Transcript {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.log).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct Dialog {
    script: Script,
    step: usize,
    protocol: Protocol,
    telnet: Option<TelnetRefuser>,
    http: Option<HttpDecoder>,
    written: usize,
    pending_reply: Vec<u8>,
    expect_buffer: Vec<u8>,
    half_close: HalfClose,
    transcript: Transcript,
    outcome: Option<Outcome>,
    finished: bool,
}

impl Dialog {
    pub fn new(script: Script, protocol: Protocol) -> Self {
        Self {
            script,
            step: 0,
            protocol,
            telnet: (protocol == Protocol::Telnet).then(TelnetRefuser::new),
            http: (protocol == Protocol::Http).then(HttpDecoder::new),
            written: 0,
            pending_reply: Vec::new(),
            expect_buffer: Vec::new(),
            half_close: HalfClose::NotYet,
            transcript: Transcript::default(),
            outcome: None,
            finished: false,
        }
        .settled()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome.unwrap_or_default()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn http(&self) -> Option<&HttpDecoder> {
        self.http.as_ref()
    }

    fn current(&self) -> Option<&Instruction> {
        self.script.get(self.step)
    }

    fn negotiating(&self) -> bool {
        self.telnet.as_ref().is_some_and(TelnetRefuser::is_negotiating)
    }

    pub fn intent(&self) -> Intent {
        if self.finished {
            return Intent::Close;
        }
        if !self.pending_reply.is_empty() {
            return Intent::Write(self.pending_reply.clone());
        }
        if self.negotiating() {
            return Intent::Read;
        }
        if self.half_close == HalfClose::Pending {
            return Intent::HalfClose;
        }

        match self.current() {
            Some(Instruction::Send(literal)) => Intent::Write(literal[self.written..].to_vec()),
            Some(instruction) if instruction.wants_read() => Intent::Read,
            Some(Instruction::StartTls) => Intent::StartTls,
            _ => Intent::Close,
        }
    }

    pub fn on_written(&mut self, count: usize) {
        if !self.pending_reply.is_empty() {
            let count = count.min(self.pending_reply.len());
            self.pending_reply.drain(..count);
            self.settle();
            return;
        }

        let Some(Instruction::Send(literal)) = self.script.get(self.step) else {
            return;
        };
        let end = (self.written + count).min(literal.len());
        self.transcript.log.extend_from_slice(&literal[self.written..end]);
        self.transcript.bytes_written += end - self.written;
        self.written = end;

        if self.written == literal.len() {
            self.step += 1;
            self.written = 0;
            if self.script.no_sends_from(self.step) {
                self.half_close = HalfClose::Pending;
            }
            self.settle();
        }
    }

    pub fn on_half_closed(&mut self) {
        self.half_close = HalfClose::Done;
    }

    pub fn on_tls_established(&mut self) {
        if matches!(self.current(), Some(Instruction::StartTls)) {
            self.step += 1;
            self.expect_buffer.clear();
            self.settle();
        }
    }

    pub fn on_data(&mut self, data: &[u8]) {
        if self.finished {
            return;
        }
        self.transcript.bytes_read += data.len();

        let data = match self.telnet.as_mut() {
            Some(telnet) => telnet.feed(data, &mut self.pending_reply),
            None => Cow::Borrowed(data),
        };
        let data = &data[..];
        if data.is_empty() && self.protocol != Protocol::Http {
            return;
        }

        let mut http_complete = false;
        match self.http.as_mut() {
            Some(http) => http_complete = http.feed(data),
            None => self.transcript.log.extend_from_slice(data),
        }

        let advance = match self.script.get(self.step) {
            Some(Instruction::Expect(prefix)) => {
                self.expect_buffer.extend_from_slice(data);
                expect_progress(prefix, &self.expect_buffer)
            }
            Some(Instruction::ReadAll) => Some(http_complete),
            Some(Instruction::Read) => Some(true),
            _ => Some(false),
        };

        match advance {
            None => {
                self.fail(Outcome::BadData);
                return;
            }
            Some(true) => {
                self.step += 1;
                self.expect_buffer.clear();
            }
            Some(false) => {}
        }

        self.settle();
    }

    /// The peer closed its side (a zero-length read).
    pub fn on_peer_closed(&mut self) {
        if self.finished {
            return;
        }
        if let Some(http) = self.http.as_mut() {
            http.feed(&[]);
        }
        match self.current() {
            None | Some(Instruction::Close) | Some(Instruction::ReadAll) => {}
            Some(_) => self.outcome = Some(Outcome::Interrupted),
        }
        self.finished = true;
    }

    pub fn on_timeout(&mut self) {
        self.fail(Outcome::ConnTimeout);
    }

    /// End the conversation with a failure, unless it already has one.
    pub fn fail(&mut self, outcome: Outcome) {
        self.outcome.get_or_insert(outcome);
        self.finished = true;
    }

    fn settled(mut self) -> Self {
        self.settle();
        self
    }

    /// Mark the dialog finished once it reaches `CLOSE` or runs off the end.
    fn settle(&mut self) {
        if self.half_close == HalfClose::Pending || !self.pending_reply.is_empty() {
            return;
        }
        if matches!(self.current(), None | Some(Instruction::Close)) {
            self.finished = true;
        }
    }
}

/// `Some(true)` once `have` starts with `prefix`, `Some(false)` while it is
/// still a matching fragment, `None` on mismatch. Case-insensitive.
fn expect_progress(prefix: &[u8], have: &[u8]) -> Option<bool> {
    if have.len() < prefix.len() {
        prefix[..have.len()].eq_ignore_ascii_case(have).then_some(false)
    } else {
        have[..prefix.len()].eq_ignore_ascii_case(prefix).then_some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telnet::{DO, IAC, WONT};

    fn plain(lines: &[&str]) -> Dialog {
        Dialog::new(Script::parse(lines).unwrap(), Protocol::Plain)
    }

    #[test]
    fn smtp_style_exchange() {
        let mut dialog = plain(&["EXPECT:220", "SEND:QUIT\r\n", "READ", "CLOSE"]);
        assert_eq!(dialog.intent(), Intent::Read);

        dialog.on_data(b"220 mail.example.com ESMTP\r\n");
        assert_eq!(dialog.intent(), Intent::Write(b"QUIT\r\n".to_vec()));

        dialog.on_written(2);
        assert_eq!(dialog.intent(), Intent::Write(b"IT\r\n".to_vec()));
        dialog.on_written(4);
        assert_eq!(dialog.intent(), Intent::HalfClose);
        dialog.on_half_closed();
        assert_eq!(dialog.intent(), Intent::Read);

        dialog.on_data(b"221 bye\r\n");
        assert!(dialog.is_finished());
        assert_eq!(dialog.outcome(), Outcome::Ok);
        assert_eq!(dialog.transcript().bytes_written, 6);
        assert!(dialog.transcript().text().contains("QUIT"));
    }

    #[test]
    fn partial_expect_keeps_reading() {
        let mut dialog = plain(&["EXPECT:SSH-", "CLOSE"]);
        dialog.on_data(b"ss");
        assert!(!dialog.is_finished());
        dialog.on_data(b"h-2.0-OpenSSH");
        assert!(dialog.is_finished());
        assert_eq!(dialog.outcome(), Outcome::Ok);
    }

    #[test]
    fn mismatch_is_bad_data() {
        let mut dialog = plain(&["EXPECT:220", "CLOSE"]);
        dialog.on_data(b"554 go away\r\n");
        assert!(dialog.is_finished());
        assert_eq!(dialog.outcome(), Outcome::BadData);
        assert_eq!(dialog.intent(), Intent::Close);
    }

    #[test]
    fn close_mid_script_is_interrupted() {
        let mut dialog = plain(&["EXPECT:+OK", "SEND:QUIT\r\n", "CLOSE"]);
        dialog.on_peer_closed();
        assert_eq!(dialog.outcome(), Outcome::Interrupted);
    }

    #[test]
    fn close_during_readall_is_fine() {
        let mut dialog = plain(&["READALL", "CLOSE"]);
        dialog.on_data(b"whatever");
        dialog.on_peer_closed();
        assert_eq!(dialog.outcome(), Outcome::Ok);
        assert_eq!(dialog.transcript().text(), "whatever");
    }

    #[test]
    fn silent_script_finishes_immediately() {
        let dialog = Dialog::new(Script::silent(), Protocol::Plain);
        assert!(dialog.is_finished());
        assert_eq!(dialog.intent(), Intent::Close);
    }

    #[test]
    fn telnet_refusals_go_out_before_banner() {
        let mut dialog = Dialog::new(Script::parse(["READ", "CLOSE"]).unwrap(), Protocol::Telnet);
        dialog.on_data(&[IAC, DO, 1]);
        assert_eq!(dialog.intent(), Intent::Write(vec![IAC, WONT, 1]));
        dialog.on_written(3);
        assert_eq!(dialog.intent(), Intent::Read);

        dialog.on_data(b"Welcome\r\nlogin: ");
        assert!(dialog.is_finished());
        assert_eq!(dialog.transcript().text(), "Welcome\r\nlogin: ");
    }

    #[test]
    fn telnet_option_split_across_reads() {
        let mut dialog = Dialog::new(Script::parse(["EXPECT:login", "CLOSE"]).unwrap(), Protocol::Telnet);
        dialog.on_data(&[IAC, DO]);
        assert_eq!(dialog.intent(), Intent::Read);

        dialog.on_data(&[1, b'l', b'o', b'g', b'i', b'n', b':']);
        assert_eq!(dialog.intent(), Intent::Write(vec![IAC, WONT, 1]));
        dialog.on_written(3);
        assert!(dialog.is_finished());
        assert_eq!(dialog.outcome(), Outcome::Ok);
        assert_eq!(dialog.transcript().text(), "login:");
    }

    #[test]
    fn http_readall_completes_on_content_length() {
        let script = Script::request_response(b"GET / HTTP/1.1\r\n\r\n".to_vec());
        let mut dialog = Dialog::new(script, Protocol::Http);

        dialog.on_written(18);
        assert_eq!(dialog.intent(), Intent::HalfClose);
        dialog.on_half_closed();
        dialog.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n");
        assert!(!dialog.is_finished());
        dialog.on_data(b"ok");
        assert!(dialog.is_finished());
        assert_eq!(dialog.outcome(), Outcome::Ok);
        assert_eq!(dialog.http().and_then(HttpDecoder::status), Some(200));
        assert_eq!(dialog.http().map(HttpDecoder::body), Some(&b"ok"[..]));
    }

    #[test]
    fn starttls_step() {
        let mut dialog = plain(&["EXPECT:220", "STARTTLS", "EXPECT:OK", "CLOSE"]);
        dialog.on_data(b"220 ready");
        assert_eq!(dialog.intent(), Intent::StartTls);
        dialog.on_tls_established();
        assert_eq!(dialog.intent(), Intent::Read);
    }

    #[test]
    fn timeout_wins_only_once() {
        let mut dialog = plain(&["EXPECT:x", "CLOSE"]);
        dialog.on_timeout();
        dialog.fail(Outcome::ConnFailed);
        assert_eq!(dialog.outcome(), Outcome::ConnTimeout);
    }
}
