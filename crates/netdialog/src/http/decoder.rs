use tracing::debug;

/// Chunked transfer-coding states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Collecting hex digits of the next chunk size.
    AwaitLength,
    /// Skipping whitespace/CR up to the LF ending the size line.
    SkipLengthTerminator,
    /// Copying chunk payload into the body.
    CopyChunk,
    /// Skipping the CRLF that follows chunk payload.
    SkipTrailer,
    /// Saw the zero-length chunk. Anything after it (trailers) is ignored.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Chunked { state: ChunkState, left_in_chunk: usize },
    ContentLength { left: usize },
    /// No length information: done after two zero-length body reads.
    UntilClose { last_read: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Headers,
    Body(Framing),
}

/// Incremental HTTP/1.x response decoder.
///
/// Bytes may arrive split at any point; [`HttpDecoder::feed`] can be called
/// with whatever the socket produced, including empty reads.
#[derive(Debug, Clone)]
pub struct HttpDecoder {
    phase: Phase,
    headers: Vec<u8>,
    body: Vec<u8>,
    status: Option<u16>,
    complete: bool,
}

impl Default for HttpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDecoder {
    pub fn new() -> Self {
        Self { phase: Phase::Headers, headers: Vec::new(), body: Vec::new(), status: None, complete: false }
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn headers(&self) -> &[u8] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn framing(&self) -> Option<Framing> {
        match &self.phase {
            Phase::Headers => None,
            Phase::Body(framing) => Some(*framing),
        }
    }

    /// Look up a response header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<String> {
        header_value(&self.headers, name)
    }

    /// Feed the next read. Returns true once the response is complete.
    pub fn feed(&mut self, data: &[u8]) -> bool {
        if self.complete {
            return true;
        }

        match self.phase {
            Phase::Headers => {
                self.headers.extend_from_slice(data);
                if let Some(rest) = self.take_header_block() {
                    self.feed_body(&rest);
                }
            }
            Phase::Body(_) => self.feed_body(data),
        }

        self.complete
    }

    /// Split off a complete header block, skipping interim 100 responses.
    /// Returns the bytes that followed the block.
    fn take_header_block(&mut self) -> Option<Vec<u8>> {
        loop {
            let end = find(&self.headers, b"\r\n\r\n")
                .map(|pos| pos + 4)
                .or_else(|| find(&self.headers, b"\n\n").map(|pos| pos + 2))?;

            let rest = self.headers.split_off(end);
            let status = parse_status(&self.headers);

            if status == Some(100) {
                debug!("Skipping interim 100 Continue response");
                self.headers = rest;
                continue;
            }

            self.status = status;
            self.phase = Phase::Body(self.framing_from_headers());
            return Some(rest);
        }
    }

    fn framing_from_headers(&self) -> Framing {
        let chunked = header_value(&self.headers, "Transfer-Encoding")
            .is_some_and(|value| value.to_ascii_lowercase().starts_with("chunked"));
        if chunked {
            return Framing::Chunked { state: ChunkState::AwaitLength, left_in_chunk: 0 };
        }

        match header_value(&self.headers, "Content-Length").and_then(|value| value.parse::<usize>().ok()) {
            Some(left) => Framing::ContentLength { left },
            None => Framing::UntilClose { last_read: None },
        }
    }

    fn feed_body(&mut self, data: &[u8]) {
        let Phase::Body(framing) = &mut self.phase else {
            return;
        };

        let mut delivered = 0usize;
        match framing {
            Framing::ContentLength { left } => {
                let take = data.len().min(*left);
                self.body.extend_from_slice(&data[..take]);
                *left -= take;
                delivered = take;
                if *left == 0 {
                    self.complete = true;
                }
            }
            Framing::UntilClose { last_read } => {
                self.body.extend_from_slice(data);
                delivered = data.len();
                if *last_read == Some(0) && delivered == 0 {
                    self.complete = true;
                } else {
                    *last_read = Some(delivered);
                }
            }
            Framing::Chunked { state, left_in_chunk } => {
                let mut rest = data;
                while !rest.is_empty() && *state != ChunkState::Done {
                    match *state {
                        ChunkState::AwaitLength => match (rest[0] as char).to_digit(16) {
                            Some(digit) => {
                                *left_in_chunk = left_in_chunk.saturating_mul(16).saturating_add(digit as usize);
                                rest = &rest[1..];
                            }
                            None => *state = ChunkState::SkipLengthTerminator,
                        },
                        ChunkState::SkipLengthTerminator => {
                            if rest[0] == b'\n' {
                                *state = if *left_in_chunk > 0 { ChunkState::CopyChunk } else { ChunkState::Done };
                            } else if rest[0] != b'\r' && rest[0] != b' ' {
                                debug!("Unexpected byte {:#04x} after chunk length", rest[0]);
                            }
                            rest = &rest[1..];
                        }
                        ChunkState::CopyChunk => {
                            let take = rest.len().min(*left_in_chunk);
                            self.body.extend_from_slice(&rest[..take]);
                            delivered += take;
                            *left_in_chunk -= take;
                            rest = &rest[take..];
                            if *left_in_chunk == 0 {
                                *state = ChunkState::SkipTrailer;
                            }
                        }
                        ChunkState::SkipTrailer => {
                            if rest[0] == b'\n' {
                                *state = ChunkState::AwaitLength;
                            } else if rest[0] != b'\r' {
                                debug!("Unexpected byte {:#04x} after chunk data", rest[0]);
                            }
                            rest = &rest[1..];
                        }
                        ChunkState::Done => {}
                    }
                }
                if *state == ChunkState::Done {
                    self.complete = true;
                }
            }
        }

        if delivered > 0 {
            debug!("HTTP body: {delivered} bytes ({} total)", self.body.len());
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn parse_status(headers: &[u8]) -> Option<u16> {
    let line = headers.split(|&byte| byte == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn header_value(headers: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(headers);
    text.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim().to_string())
    })
}
