//! SIP message types, parsing and serialization
//!
//! Messages arrive whole, one per WebSocket text frame, so the parser never
//! relies on `Content-Length`: the body is everything after the first blank
//! line.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }
}

impl FromStr for SipMethod {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            other => return Err(SipError::ParseError(format!("Unknown method: {}", other))),
        };
        Ok(method)
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Standard reason phrase for the status codes this agent emits or logs
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Unknown",
    }
}

/// Expand RFC 3261 compact header names
fn canonical_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    let full = match lower.as_str() {
        "v" => "via",
        "f" => "from",
        "t" => "to",
        "i" => "call-id",
        "m" => "contact",
        "l" => "content-length",
        "c" => "content-type",
        "k" => "supported",
        "s" => "subject",
        "r" => "refer-to",
        "b" => "referred-by",
        _ => return lower,
    };
    full.to_string()
}

/// Ordered header map keyed by lower-cased name.
///
/// Repeated headers are joined with `", "`, which is the wire-equivalent
/// form for every header this agent copies back (Via in particular).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        let key = canonical_name(name);
        let value = value.trim();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => self.entries.push((key, value.to_string())),
        }
    }

    /// Case-insensitive lookup; compact names resolve to their full form
    pub fn get(&self, name: &str) -> Option<&str> {
        let key = canonical_name(name);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A received SIP request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub start_line: String,
    pub is_response: bool,
    /// Zero for requests
    pub status_code: u16,
    pub reason: String,
    /// Empty for responses
    pub method: String,
    /// Empty for responses
    pub request_uri: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl ParsedMessage {
    pub fn parse(raw: &str) -> Result<Self, SipError> {
        let normalized = raw.replace("\r\n", "\n").replace('\n', "\r\n");
        let normalized = normalized.trim_start_matches("\r\n");

        let (head, body) = match normalized.split_once("\r\n\r\n") {
            Some((head, body)) => (head, body),
            None => (normalized, ""),
        };

        let mut lines = head.split("\r\n");
        let start_line = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| SipError::ParseError("Empty message".to_string()))?
            .to_string();

        let mut headers = HeaderMap::new();
        let mut current: Option<(String, String)> = None;
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the previous header
                if let Some((_, value)) = current.as_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((name, value)) = current.take() {
                headers.insert(&name, &value);
            }
            if let Some((name, value)) = line.split_once(':') {
                if !name.trim().is_empty() {
                    current = Some((name.to_string(), value.trim().to_string()));
                }
            }
        }
        if let Some((name, value)) = current.take() {
            headers.insert(&name, &value);
        }

        let mut message = Self {
            start_line: start_line.clone(),
            is_response: false,
            status_code: 0,
            reason: String::new(),
            method: String::new(),
            request_uri: String::new(),
            headers,
            body: body.to_string(),
        };

        let mut parts = start_line.splitn(3, ' ');
        let first = parts.next().unwrap_or_default();
        if first.to_ascii_uppercase().starts_with("SIP/") {
            message.is_response = true;
            message.status_code = parts
                .next()
                .and_then(|code| code.trim().parse().ok())
                .ok_or_else(|| {
                    SipError::ParseError(format!("Invalid status line: {}", start_line))
                })?;
            message.reason = parts.next().unwrap_or_default().trim().to_string();
        } else {
            let uri = parts.next().unwrap_or_default().trim();
            let version = parts.next().unwrap_or_default().trim();
            if uri.is_empty() || !version.to_ascii_uppercase().starts_with("SIP/") {
                return Err(SipError::ParseError(format!(
                    "Invalid request line: {}",
                    start_line
                )));
            }
            message.method = first.to_ascii_uppercase();
            message.request_uri = uri.to_string();
        }

        Ok(message)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Typed method of a request, `None` for responses and unknown methods
    pub fn sip_method(&self) -> Option<SipMethod> {
        if self.is_response {
            return None;
        }
        self.method.parse().ok()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("call-id")
    }

    /// CSeq number and method name
    pub fn cseq(&self) -> Option<(u32, String)> {
        let value = self.header("cseq")?;
        let mut parts = value.split_whitespace();
        let number = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_ascii_uppercase();
        Some((number, method))
    }

    pub fn cseq_method(&self) -> Option<SipMethod> {
        self.cseq().and_then(|(_, method)| method.parse().ok())
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header("from").and_then(extract_tag)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("to").and_then(extract_tag)
    }

    pub fn has_body(&self) -> bool {
        !self.body.trim().is_empty()
    }
}

/// Value of the `tag` parameter of a From/To header
pub fn extract_tag(header_value: &str) -> Option<String> {
    // Parameters after the closing '>' belong to the header, not the URI
    let params = match header_value.rfind('>') {
        Some(idx) => &header_value[idx + 1..],
        None => header_value,
    };
    params
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("tag"))
        .map(|(_, value)| {
            value
                .trim()
                .trim_end_matches(|c: char| c == ',' || c == '>')
                .to_string()
        })
        .filter(|tag| !tag.is_empty())
}

/// The URI inside `<...>`, or the bare value up to its parameters
pub fn extract_uri(header_value: &str) -> String {
    if let (Some(start), Some(end)) = (header_value.find('<'), header_value.find('>')) {
        if start < end {
            return header_value[start + 1..end].trim().to_string();
        }
    }
    header_value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Display name of a name-addr, without quotes
pub fn extract_display_name(header_value: &str) -> Option<String> {
    let value = header_value.trim();
    let end = value.find('<')?;
    let name = value[..end].trim().trim_matches('"').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// User part of a SIP URI (`sip:1001@host` -> `1001`)
pub fn extract_user(uri: &str) -> String {
    let without_scheme = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .unwrap_or(uri);
    match without_scheme.split_once('@') {
        Some((user, _)) => user.split(';').next().unwrap_or(user).to_string(),
        None => without_scheme.to_string(),
    }
}

/// Header value with any `tag` parameter removed
pub fn strip_tag(header_value: &str) -> String {
    let (addr, params) = match header_value.rfind('>') {
        Some(idx) => header_value.split_at(idx + 1),
        None => match header_value.find(';') {
            Some(idx) => header_value.split_at(idx),
            None => (header_value, ""),
        },
    };
    let mut result = addr.trim().to_string();
    for param in params.split(';').skip(1) {
        let is_tag = param
            .split_once('=')
            .map(|(name, _)| name.trim().eq_ignore_ascii_case("tag"))
            .unwrap_or(false);
        if !is_tag && !param.trim().is_empty() {
            result.push(';');
            result.push_str(param.trim());
        }
    }
    result
}

/// First line of an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: SipMethod, uri: String },
    Response { code: u16, reason: String },
}

/// An outgoing SIP message under construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start: StartLine,
    headers: Vec<(String, String)>,
    body: String,
}

impl SipMessage {
    pub fn request(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request {
                method,
                uri: uri.into(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn response(code: u16) -> Self {
        Self {
            start: StartLine::Response {
                code,
                reason: reason_phrase(code).to_string(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        // Content-Length is always derived from the body
        if !name.eq_ignore_ascii_case("content-length") {
            self.headers.push((name.to_string(), value.into()));
        }
        self
    }

    pub fn header_opt(self, name: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.header(name, value),
            None => self,
        }
    }

    pub fn body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = body.into();
        self
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body_text(&self) -> &str {
        &self.body
    }

    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(512 + self.body.len());
        match &self.start {
            StartLine::Request { method, uri } => {
                out.push_str(&format!("{} {} SIP/2.0\r\n", method, uri));
            }
            StartLine::Response { code, reason } => {
                out.push_str(&format!("SIP/2.0 {} {}\r\n", code, reason));
            }
        }
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
