//! Message body framing
//!
//! `HttpBuffer` presents the body of one HTTP message as a bounded byte
//! stream regardless of whether the wire framing is content-length-delimited
//! or chunked. It pulls raw bytes first from the staged lookahead left over
//! by the header parser, then from the raw source, decoding chunk envelopes
//! transparently.

use super::{ChunkParser, Error, MessageHeader, Result, Version, BUFFER_SIZE};

/// A non-blocking byte source feeding the body buffer.
///
/// `Ok(None)` means would-block, `Ok(Some(0))` means EOF.
pub trait RawSource {
    fn read_some(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;
}

/// Body framing adapter for one message
#[derive(Debug, Default)]
pub struct HttpBuffer {
    chunked: bool,
    keep_alive: bool,
    remaining: u64,
    parser: ChunkParser,
    out: Vec<u8>,
}

impl HttpBuffer {
    pub fn new() -> Self {
        HttpBuffer {
            chunked: false,
            keep_alive: true,
            remaining: 0,
            parser: ChunkParser::new(),
            out: Vec::new(),
        }
    }

    /// Capture the framing properties of a freshly parsed header and
    /// prepare for the body.
    pub fn begin_body(&mut self, header: &MessageHeader, version: Version) -> Result<()> {
        self.chunked = header.is_chunked();
        self.keep_alive = header.is_keep_alive(version);
        self.remaining = if self.chunked {
            0
        } else {
            header.content_length()?.unwrap_or(0)
        };
        self.parser.reset();
        self.out.clear();
        Ok(())
    }

    /// True when no more body bytes remain on the wire
    pub fn is_end(&self) -> bool {
        if self.chunked {
            self.parser.end()
        } else {
            self.remaining == 0
        }
    }

    /// Keep-alive captured from the message header
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Decoded body bytes that can be taken without further I/O.
    ///
    /// Deliberately reports 0 for chunked framing: envelope control bytes
    /// are indistinguishable from payload without parsing, so callers must
    /// not rely on lookahead sizing.
    pub fn available(&self) -> usize {
        if self.chunked {
            0
        } else {
            self.out.len()
        }
    }

    /// Pull up to `n` decoded body bytes (`0` = whatever is available)
    /// from the staged lookahead and the raw source.
    ///
    /// Returns the number of body bytes added to the internal buffer.
    /// Never consumes past the declared content length or past `is_end()`.
    /// EOF before the body is complete is a lost connection.
    pub fn import(
        &mut self,
        staged: &mut Vec<u8>,
        source: &mut dyn RawSource,
        n: usize,
    ) -> Result<usize> {
        let limit = if n == 0 { BUFFER_SIZE } else { n.min(BUFFER_SIZE) };
        let mut produced = 0;

        loop {
            if self.is_end() || self.out.len() >= limit {
                break;
            }

            if staged.is_empty() {
                let mut tmp = [0u8; BUFFER_SIZE];
                match source.read_some(&mut tmp)? {
                    None => break,
                    Some(0) => return Err(Error::ConnectionLost),
                    Some(k) => staged.extend_from_slice(&tmp[..k]),
                }
            }

            produced += self.consume(staged, limit)?;
        }

        Ok(produced)
    }

    /// Decode as much of the staged bytes as fits; drains what it consumed
    fn consume(&mut self, staged: &mut Vec<u8>, limit: usize) -> Result<usize> {
        let mut pos = 0;
        let mut produced = 0;

        if self.chunked {
            while pos < staged.len() && !self.parser.end() && self.out.len() < limit {
                if self.parser.has_chunk() {
                    let take = (self.parser.chunk_size() as usize)
                        .min(staged.len() - pos)
                        .min(limit - self.out.len());
                    self.out.extend_from_slice(&staged[pos..pos + take]);
                    self.parser.take(take as u64);
                    pos += take;
                    produced += take;
                } else {
                    self.parser.parse(staged[pos])?;
                    pos += 1;
                }
            }
        } else {
            let take = (self.remaining as usize)
                .min(staged.len())
                .min(limit - self.out.len());
            self.out.extend_from_slice(&staged[..take]);
            self.remaining -= take as u64;
            pos = take;
            produced = take;
        }

        staged.drain(..pos);
        Ok(produced)
    }

    /// Drain the decoded body bytes
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    /// Reset all framing state
    pub fn reset(&mut self) {
        self.chunked = false;
        self.keep_alive = true;
        self.remaining = 0;
        self.parser.reset();
        self.out.clear();
    }
}
