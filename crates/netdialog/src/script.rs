//! Dialog scripts.
//!
//! A script is the instruction sequence a generic service check walks
//! through. Scripts arrive as text (`"EXPECT:220"`, `"SEND:QUIT\r\n"`) from
//! the services table and are parsed once into [`Instruction`]s so the
//! engine never re-inspects keywords while a connection is live.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("unknown dialog instruction '{0}'")]
    UnknownInstruction(String),
    #[error("bad escape sequence in '{0}'")]
    BadEscape(String),
    #[error("dialog script is empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Write a literal to the peer.
    Send(Vec<u8>),
    /// Case-insensitive prefix match against what the peer sends next.
    Expect(Vec<u8>),
    /// Advance as soon as any data arrives.
    Read,
    /// Keep reading until the protocol decoder reports completion or the
    /// peer closes.
    ReadAll,
    /// Upgrade the connection to TLS before continuing.
    StartTls,
    /// Finish the conversation.
    Close,
}

impl Instruction {
    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let (keyword, argument) = match text.split_once(':') {
            Some((keyword, argument)) => {
                (keyword, Some(argument.trim_start_matches([' ', '\t'])))
            }
            None => (text.trim(), None),
        };

        match (keyword.to_ascii_uppercase().as_str(), argument) {
            ("SEND", Some(literal)) => Ok(Instruction::Send(unescape(literal)?)),
            ("EXPECT", Some(literal)) => Ok(Instruction::Expect(unescape(literal)?)),
            ("READ", None) => Ok(Instruction::Read),
            ("READALL", None) => Ok(Instruction::ReadAll),
            ("STARTTLS", None) => Ok(Instruction::StartTls),
            ("CLOSE", None) => Ok(Instruction::Close),
            _ => Err(ScriptError::UnknownInstruction(text.to_string())),
        }
    }

    pub fn wants_read(&self) -> bool {
        matches!(self, Instruction::Expect(_) | Instruction::Read | Instruction::ReadAll)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Send(literal) => write!(f, "SEND:{}", String::from_utf8_lossy(literal).escape_default()),
            Instruction::Expect(literal) => write!(f, "EXPECT:{}", String::from_utf8_lossy(literal).escape_default()),
            Instruction::Read => f.write_str("READ"),
            Instruction::ReadAll => f.write_str("READALL"),
            Instruction::StartTls => f.write_str("STARTTLS"),
            Instruction::Close => f.write_str("CLOSE"),
        }
    }
}

/// Parsed, immutable dialog script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    steps: Vec<Instruction>,
}

impl Script {
    pub fn parse<I, S>(lines: I) -> Result<Self, ScriptError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let steps = lines
            .into_iter()
            .map(|line| Instruction::parse(line.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if steps.is_empty() {
            return Err(ScriptError::Empty);
        }
        Ok(Self { steps })
    }

    /// Connect, then hang up without exchanging anything.
    pub fn silent() -> Self {
        Self { steps: vec![Instruction::Close] }
    }

    /// Send one request and read the whole response.
    pub fn request_response(request: Vec<u8>) -> Self {
        Self { steps: vec![Instruction::Send(request), Instruction::ReadAll, Instruction::Close] }
    }

    pub fn get(&self, step: usize) -> Option<&Instruction> {
        self.steps.get(step)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Instruction] {
        &self.steps
    }

    /// True when no `SEND` appears at or after `step`.
    pub fn no_sends_from(&self, step: usize) -> bool {
        !self.steps.iter().skip(step).any(|instruction| matches!(instruction, Instruction::Send(_)))
    }
}

/// Expand `\r`, `\n`, `\t`, `\\` and `\xHH` in a script literal.
fn unescape(literal: &str) -> Result<Vec<u8>, ScriptError> {
    let mut out = Vec::with_capacity(literal.len());
    let mut bytes = literal.bytes();

    while let Some(byte) = bytes.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'\\') => out.push(b'\\'),
            Some(b'x') => {
                let hi = bytes.next().and_then(hex_digit);
                let lo = bytes.next().and_then(hex_digit);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                    _ => return Err(ScriptError::BadEscape(literal.to_string())),
                }
            }
            _ => return Err(ScriptError::BadEscape(literal.to_string())),
        }
    }

    Ok(out)
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}
