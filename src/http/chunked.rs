//! Chunked transfer encoding
//!
//! `ChunkParser` consumes the chunked envelope one byte at a time:
//! `<hex-size>[;extension]\r\n<data>\r\n` repeated, terminated by a zero
//! chunk and an (ignored) trailer. Payload bytes are not fed through
//! `parse`; while `has_chunk()` is true the caller copies up to
//! `chunk_size()` bytes directly and reports them with `take`.

use super::{Error, Result, MAX_CHUNK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Expecting the first hex digit of a chunk size
    Begin,
    /// Accumulating hex digits of the chunk size
    Size,
    /// CR seen after size or extension, expecting LF
    Endl,
    /// Inside a chunk extension, ignored up to CRLF
    Extension,
    /// Reading `chunk_size` payload bytes
    Data,
    /// Payload consumed, expecting the CRLF that closes the chunk
    DataEnd,
    /// After the zero chunk, expecting trailer lines or the final CRLF
    Trailer,
    /// Inside an ignored trailer field line
    TrailerData,
}

/// Incremental parser for the chunked-encoding envelope
#[derive(Debug)]
pub struct ChunkParser {
    state: ChunkState,
    chunk_size: u64,
    saw_cr: bool,
    done: bool,
}

impl ChunkParser {
    pub fn new() -> Self {
        ChunkParser {
            state: ChunkState::Begin,
            chunk_size: 0,
            saw_cr: false,
            done: false,
        }
    }

    /// Advance the envelope by one byte.
    ///
    /// Must not be called while `has_chunk()` is true; payload bytes bypass
    /// the parser. Any byte invalid in the current state fails the message.
    pub fn parse(&mut self, byte: u8) -> Result<()> {
        match self.state {
            ChunkState::Begin => {
                let digit = hex_value(byte)
                    .ok_or_else(|| invalid(byte, "chunk size"))?;
                self.chunk_size = digit as u64;
                self.state = ChunkState::Size;
                Ok(())
            }

            ChunkState::Size => match byte {
                b';' => {
                    self.state = ChunkState::Extension;
                    Ok(())
                }
                b'\r' => {
                    self.state = ChunkState::Endl;
                    Ok(())
                }
                _ => {
                    let digit = hex_value(byte)
                        .ok_or_else(|| invalid(byte, "chunk size"))?;
                    self.chunk_size = self.chunk_size * 16 + digit as u64;
                    if self.chunk_size > MAX_CHUNK_SIZE {
                        return Err(Error::InvalidMessage(format!(
                            "chunk size exceeds limit: {}",
                            self.chunk_size
                        )));
                    }
                    Ok(())
                }
            },

            ChunkState::Extension => {
                if byte == b'\r' {
                    self.state = ChunkState::Endl;
                }
                Ok(())
            }

            ChunkState::Endl => {
                if byte != b'\n' {
                    return Err(invalid(byte, "chunk header"));
                }
                if self.chunk_size == 0 {
                    self.state = ChunkState::Trailer;
                    self.saw_cr = false;
                } else {
                    self.state = ChunkState::Data;
                }
                Ok(())
            }

            ChunkState::Data => Err(Error::InvalidState(
                "chunk payload must be consumed with take()",
            )),

            ChunkState::DataEnd => {
                if !self.saw_cr {
                    if byte != b'\r' {
                        return Err(invalid(byte, "chunk end"));
                    }
                    self.saw_cr = true;
                } else {
                    if byte != b'\n' {
                        return Err(invalid(byte, "chunk end"));
                    }
                    self.saw_cr = false;
                    self.state = ChunkState::Begin;
                }
                Ok(())
            }

            ChunkState::Trailer => {
                if self.saw_cr {
                    if byte != b'\n' {
                        return Err(invalid(byte, "trailer"));
                    }
                    self.saw_cr = false;
                    self.done = true;
                } else if byte == b'\r' {
                    self.saw_cr = true;
                } else {
                    // A trailer field line; consumed and ignored.
                    self.state = ChunkState::TrailerData;
                }
                Ok(())
            }

            ChunkState::TrailerData => {
                if byte == b'\n' {
                    self.state = ChunkState::Trailer;
                }
                Ok(())
            }
        }
    }

    /// True exactly while chunk payload bytes are pending
    pub fn has_chunk(&self) -> bool {
        self.state == ChunkState::Data
    }

    /// Remaining payload bytes of the current chunk
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Report `n` payload bytes consumed by the caller
    pub fn take(&mut self, n: u64) {
        debug_assert!(self.state == ChunkState::Data && n <= self.chunk_size);
        self.chunk_size = self.chunk_size.saturating_sub(n);
        if self.chunk_size == 0 {
            self.state = ChunkState::DataEnd;
            self.saw_cr = false;
        }
    }

    /// True once the terminating zero chunk and trailer are fully consumed
    pub fn end(&self) -> bool {
        self.done
    }

    /// Return to the initial state with `chunk_size == 0`
    pub fn reset(&mut self) {
        self.state = ChunkState::Begin;
        self.chunk_size = 0;
        self.saw_cr = false;
        self.done = false;
    }
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn invalid(byte: u8, context: &str) -> Error {
    Error::InvalidMessage(format!(
        "unexpected byte 0x{:02x} in {}",
        byte, context
    ))
}

/// Append one chunk to the output buffer.
///
/// Empty input appends nothing: an empty flush is a no-op, not a
/// zero-size chunk (the terminating chunk is written separately).
pub fn write_chunk(out: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Append the terminating zero chunk
pub fn write_last_chunk(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run the parser over a full envelope, collecting payload bytes
    fn decode(input: &[u8]) -> Result<Vec<u8>> {
        let mut parser = ChunkParser::new();
        let mut output = Vec::new();
        let mut pos = 0;

        while pos < input.len() && !parser.end() {
            if parser.has_chunk() {
                let n = (parser.chunk_size() as usize).min(input.len() - pos);
                output.extend_from_slice(&input[pos..pos + n]);
                parser.take(n as u64);
                pos += n;
            } else {
                parser.parse(input[pos])?;
                pos += 1;
            }
        }

        if !parser.end() {
            return Err(Error::InvalidMessage("truncated chunked body".to_string()));
        }
        Ok(output)
    }

    #[test]
    fn test_single_chunk() {
        assert_eq!(decode(b"5\r\nHello\r\n0\r\n\r\n").unwrap(), b"Hello");
    }

    #[test]
    fn test_multiple_chunks() {
        assert_eq!(
            decode(b"5\r\nHello\r\n5\r\nWorld\r\n0\r\n\r\n").unwrap(),
            b"HelloWorld"
        );
    }

    #[test]
    fn test_chunk_extension_ignored() {
        assert_eq!(
            decode(b"5;name=value\r\nHello\r\n0\r\n\r\n").unwrap(),
            b"Hello"
        );
    }

    #[test]
    fn test_trailer_ignored() {
        assert_eq!(
            decode(b"3\r\nfoo\r\n0\r\nX-Trailer: v\r\n\r\n").unwrap(),
            b"foo"
        );
    }

    #[test]
    fn test_end_only_after_zero_chunk() {
        let mut parser = ChunkParser::new();
        for &byte in b"3\r\n" {
            parser.parse(byte).unwrap();
        }
        assert!(parser.has_chunk());
        parser.take(3);
        assert!(!parser.end());
        for &byte in b"\r\n0\r\n" {
            parser.parse(byte).unwrap();
        }
        assert!(!parser.end());
        parser.parse(b'\r').unwrap();
        parser.parse(b'\n').unwrap();
        assert!(parser.end());
    }

    #[test]
    fn test_round_trip_any_split() {
        // Encode under several chunk splits, decode byte by byte.
        let payload = b"The quick brown fox jumps over the lazy dog";
        for split in [1usize, 2, 3, 7, 44] {
            let mut wire = Vec::new();
            for chunk in payload.chunks(split) {
                write_chunk(&mut wire, chunk);
            }
            write_last_chunk(&mut wire);
            assert_eq!(decode(&wire).unwrap(), payload, "split {}", split);
        }
    }

    #[test]
    fn test_invalid_size_byte() {
        let mut parser = ChunkParser::new();
        assert!(parser.parse(b'x').is_err());
    }

    #[test]
    fn test_missing_crlf_after_data() {
        assert!(decode(b"3\r\nfooXX0\r\n\r\n").is_err());
    }

    #[test]
    fn test_chunk_size_bound() {
        let mut parser = ChunkParser::new();
        let mut result = Ok(());
        for &byte in b"fffffffffffffff" {
            result = parser.parse(byte);
            if result.is_err() {
                break;
            }
        }
        assert!(result.is_err());
    }

    #[test]
    fn test_reset() {
        let mut parser = ChunkParser::new();
        for &byte in b"5\r\n" {
            parser.parse(byte).unwrap();
        }
        assert!(parser.has_chunk());
        parser.reset();
        assert!(!parser.has_chunk());
        assert_eq!(parser.chunk_size(), 0);
        assert!(!parser.end());
    }

    #[test]
    fn test_write_chunk_skips_empty() {
        let mut out = Vec::new();
        write_chunk(&mut out, b"");
        write_chunk(&mut out, b"Hello");
        write_chunk(&mut out, b"");
        write_last_chunk(&mut out);
        assert_eq!(out, b"5\r\nHello\r\n0\r\n\r\n");
    }
}
