//! Incremental HTTP header parsing
//!
//! `HeaderParser` consumes a request-line or status-line plus the header
//! block, one buffer at a time, stopping exactly at the blank line. The
//! same parser handles both grammars; `reset(is_reply)` selects which.

use super::{Error, MessageHeader, Method, Request, Reply, Result, Status, Version, MAX_HEADER_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    StartLine,
    HeaderField,
    Done,
    Failed,
}

/// Incremental start-line + header-block parser
#[derive(Debug)]
pub struct HeaderParser {
    is_reply: bool,
    state: ParserState,
    line: Vec<u8>,
    consumed: usize,
    header: MessageHeader,
    // request start line
    method: Option<Method>,
    url: String,
    qparams: String,
    // reply start line
    status: u16,
    reason: String,
    version: Version,
}

impl HeaderParser {
    /// Create a parser; `is_reply` selects status-line vs request-line
    pub fn new(is_reply: bool) -> Self {
        HeaderParser {
            is_reply,
            state: ParserState::StartLine,
            line: Vec::new(),
            consumed: 0,
            header: MessageHeader::new(),
            method: None,
            url: String::new(),
            qparams: String::new(),
            status: 0,
            reason: String::new(),
            version: Version::default(),
        }
    }

    /// Prepare for the next message
    pub fn reset(&mut self, is_reply: bool) {
        self.is_reply = is_reply;
        self.state = ParserState::StartLine;
        self.line.clear();
        self.consumed = 0;
        self.header.clear();
        self.method = None;
        self.url.clear();
        self.qparams.clear();
        self.status = 0;
        self.reason.clear();
        self.version = Version::default();
    }

    /// True while nothing has been consumed since the last reset
    pub fn begin(&self) -> bool {
        self.consumed == 0 && self.state == ParserState::StartLine
    }

    /// True once the blank line terminating the header block was consumed
    pub fn end(&self) -> bool {
        self.state == ParserState::Done
    }

    /// True once malformed input was detected; latched until reset
    pub fn fail(&self) -> bool {
        self.state == ParserState::Failed
    }

    /// Consume bytes from `input`, at most through the blank line.
    ///
    /// Returns the number of bytes consumed; bytes past the header block
    /// are left for the body layer. `end()` may still be false afterwards
    /// when more input is needed.
    pub fn advance(&mut self, input: &[u8]) -> Result<usize> {
        if self.state == ParserState::Failed {
            return Err(Error::InvalidMessage("parser already failed".to_string()));
        }

        let mut pos = 0;
        while pos < input.len() && self.state != ParserState::Done {
            let byte = input[pos];
            pos += 1;
            self.consumed += 1;

            if self.consumed > MAX_HEADER_BYTES {
                self.state = ParserState::Failed;
                return Err(Error::RequestTooLarge);
            }

            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }

            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            let line = std::mem::take(&mut self.line);
            if let Err(e) = self.handle_line(&line) {
                self.state = ParserState::Failed;
                return Err(e);
            }
        }

        Ok(pos)
    }

    fn handle_line(&mut self, line: &[u8]) -> Result<()> {
        match self.state {
            ParserState::StartLine => {
                // Tolerate a stray blank line before the start line.
                if line.is_empty() {
                    return Ok(());
                }
                let text = std::str::from_utf8(line)
                    .map_err(|_| Error::InvalidMessage("non-ascii start line".to_string()))?;
                if self.is_reply {
                    self.parse_status_line(text)?;
                } else {
                    self.parse_request_line(text)?;
                }
                self.state = ParserState::HeaderField;
                Ok(())
            }

            ParserState::HeaderField => {
                if line.is_empty() {
                    self.state = ParserState::Done;
                    return Ok(());
                }
                let text = std::str::from_utf8(line)
                    .map_err(|_| Error::InvalidMessage("non-ascii header".to_string()))?;
                let (name, value) = MessageHeader::parse_field(text)?;
                self.header.add(name, value);
                Ok(())
            }

            ParserState::Done | ParserState::Failed => Ok(()),
        }
    }

    /// `METHOD URL VERSION`
    fn parse_request_line(&mut self, line: &str) -> Result<()> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Error::InvalidMessage(format!(
                "invalid request line: {}",
                line
            )));
        }

        self.method = Some(Method::parse(parts[0])?);
        match parts[1].find('?') {
            Some(pos) => {
                self.url = parts[1][..pos].to_string();
                self.qparams = parts[1][pos + 1..].to_string();
            }
            None => {
                self.url = parts[1].to_string();
                self.qparams.clear();
            }
        }
        self.version = Version::parse(parts[2])?;
        Ok(())
    }

    /// `VERSION STATUS [REASON]`
    fn parse_status_line(&mut self, line: &str) -> Result<()> {
        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        if parts.len() < 2 {
            return Err(Error::InvalidMessage(format!(
                "invalid status line: {}",
                line
            )));
        }

        self.version = Version::parse(parts[0])?;
        let code = parts[1]
            .parse::<u16>()
            .map_err(|_| Error::InvalidMessage(format!("invalid status code: {}", parts[1])))?;
        Status::new(code)?;
        self.status = code;
        self.reason = parts.get(2).map(|r| r.to_string()).unwrap_or_default();
        Ok(())
    }

    /// Move the parsed start line and header block into a request
    pub fn fill_request(&mut self, request: &mut Request) {
        if let Some(method) = self.method {
            request.set_method(method);
        }
        request.set_url(std::mem::take(&mut self.url));
        if !self.qparams.is_empty() {
            request.set_qparams(std::mem::take(&mut self.qparams));
        }
        request.set_version(self.version);
        *request.header_mut() = std::mem::take(&mut self.header);
    }

    /// Move the parsed status line and header block into a reply
    pub fn fill_reply(&mut self, reply: &mut Reply) {
        reply.set_version(self.version);
        if let Ok(status) = Status::new(self.status) {
            reply.set_status(status);
        }
        reply.set_reason(std::mem::take(&mut self.reason));
        *reply.header_mut() = std::mem::take(&mut self.header);
    }
}
