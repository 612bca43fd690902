//! HTTP message types
//!
//! `Request` and `Reply` are reusable message objects: one of each is bound
//! to a connection (or exchange sequencer) and carried across multiple
//! keep-alive exchanges, `clear()`-ed between them rather than rebuilt. The
//! body field holds only the fragment currently being sent or received, not
//! necessarily the whole message body.

use super::{Error, MessageHeader, Result};
use bytes::BytesMut;
use std::fmt;

/// HTTP request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Parse a method token
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMessage(format!("invalid method: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidMessage(format!("invalid version: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::Http11
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a status from a numeric code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidMessage(format!("invalid status code: {}", code)))
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Canonical reason phrase for the code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }

    pub const OK: Status = Status { code: 200 };
    pub const BAD_REQUEST: Status = Status { code: 400 };
    pub const UNAUTHORIZED: Status = Status { code: 401 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::OK
    }
}

/// Progress of one non-blocking parse or send step.
///
/// The flags are independent; a single step may complete the header, make
/// body bytes available and finish the message all at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageProgress {
    header: bool,
    body: bool,
    finished: bool,
}

impl MessageProgress {
    /// Headers completed during this step
    pub fn header(&self) -> bool {
        self.header
    }

    /// New body bytes became available during this step
    pub fn body(&self) -> bool {
        self.body
    }

    /// The message is fully consumed or sent
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// No flag is set; the step made no observable progress
    pub fn is_empty(&self) -> bool {
        !self.header && !self.body && !self.finished
    }

    pub(crate) fn set_header(&mut self) {
        self.header = true;
    }

    pub(crate) fn set_body(&mut self) {
        self.body = true;
    }

    pub(crate) fn set_finished(&mut self) {
        self.finished = true;
    }
}

/// An HTTP request message, reused across exchanges
#[derive(Debug, Default)]
pub struct Request {
    method: Option<Method>,
    url: String,
    qparams: String,
    version: Version,
    header: MessageHeader,
    body: BytesMut,
    finished: bool,
    sending: bool,
    receiving: bool,
}

impl Request {
    pub fn new() -> Self {
        Request::default()
    }

    pub fn method(&self) -> Method {
        self.method.unwrap_or(Method::Get)
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    pub fn url(&self) -> &str {
        if self.url.is_empty() {
            "/"
        } else {
            &self.url
        }
    }

    /// Set the request target; a `?query` suffix is split off into the
    /// query parameters.
    pub fn set_url(&mut self, url: impl Into<String>) {
        let url = url.into();
        match url.find('?') {
            Some(pos) => {
                self.qparams = url[pos + 1..].to_string();
                self.url = url[..pos].to_string();
            }
            None => {
                self.qparams.clear();
                self.url = url;
            }
        }
    }

    pub fn qparams(&self) -> &str {
        &self.qparams
    }

    pub fn set_qparams(&mut self, qparams: impl Into<String>) {
        self.qparams = qparams.into();
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        &mut self.header
    }

    /// The body fragment currently buffered
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    /// Append bytes to the body fragment
    pub fn write_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Drain the buffered body fragment
    pub fn take_body(&mut self) -> BytesMut {
        self.body.split()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn set_finished(&mut self, finished: bool) {
        self.finished = finished;
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub(crate) fn set_sending(&mut self, sending: bool) {
        self.sending = sending;
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub(crate) fn set_receiving(&mut self, receiving: bool) {
        self.receiving = receiving;
    }

    /// Reset for the next exchange on the same connection
    pub fn clear(&mut self) {
        self.method = None;
        self.url.clear();
        self.qparams.clear();
        self.version = Version::default();
        self.header.clear();
        self.body.clear();
        self.finished = false;
        self.sending = false;
        self.receiving = false;
    }
}

/// An HTTP reply message, reused across exchanges
#[derive(Debug, Default)]
pub struct Reply {
    version: Version,
    status: Status,
    reason: String,
    header: MessageHeader,
    body: BytesMut,
    finished: bool,
    sending: bool,
    receiving: bool,
}

impl Reply {
    pub fn new() -> Self {
        Reply::default()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// The reason phrase; the canonical one when not explicitly set
    pub fn reason(&self) -> &str {
        if self.reason.is_empty() {
            self.status.reason_phrase()
        } else {
            &self.reason
        }
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        &mut self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    pub fn write_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    pub fn take_body(&mut self) -> BytesMut {
        self.body.split()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn set_finished(&mut self, finished: bool) {
        self.finished = finished;
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub(crate) fn set_sending(&mut self, sending: bool) {
        self.sending = sending;
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub(crate) fn set_receiving(&mut self, receiving: bool) {
        self.receiving = receiving;
    }

    /// Reset for the next exchange on the same connection
    pub fn clear(&mut self) {
        self.version = Version::default();
        self.status = Status::OK;
        self.reason.clear();
        self.header.clear();
        self.body.clear();
        self.finished = false;
        self.sending = false;
        self.receiving = false;
    }
}
