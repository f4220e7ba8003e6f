//! Raw HTTP responses as handed to check strategies, and their HTTP/1.x wire
//! form used to pass a response to external check programs.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("missing status line")]
    MissingStatusLine,
    #[error("malformed status line: {0:?}")]
    StatusLine(String),
    #[error("malformed header line: {0:?}")]
    Header(String),
    #[error("response head is not terminated by an empty line")]
    Unterminated,
}

/// A captured HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// Protocol version as it appears on the status line, e.g. `HTTP/1.1`
    pub version: String,
    pub status: u16,
    pub reason: String,
    /// Headers in received order. Values are kept as sent, they need not be UTF-8.
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    /// An `HTTP/1.1` response with the canonical reason phrase and no headers.
    pub fn new(status: u16) -> Self {
        let reason = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or_default()
            .to_string();

        Self { version: "HTTP/1.1".to_string(), status, reason, headers: Vec::new(), body: Vec::new() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Capture status line and headers, and the body when `with_body` is set.
    pub async fn capture(
        response: reqwest::Response,
        with_body: bool,
    ) -> Result<Self, reqwest::Error> {
        let version = format!("{:?}", response.version());
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        let body = if with_body { response.bytes().await?.to_vec() } else { Vec::new() };

        Ok(Self {
            version,
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    /// Serialize as an HTTP/1.x message.
    ///
    /// The body has already been de-chunked, so `Transfer-Encoding` is dropped
    /// and `Content-Length` always matches the captured body.
    pub fn to_wire(&self) -> Vec<u8> {
        let status_line = if self.reason.is_empty() {
            format!("{} {}\r\n", self.version, self.status)
        } else {
            format!("{} {} {}\r\n", self.version, self.status, self.reason)
        };
        let mut wire = status_line.into_bytes();

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("transfer-encoding")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            wire.extend_from_slice(name.as_bytes());
            wire.extend_from_slice(b": ");
            wire.extend_from_slice(value);
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(format!("content-length: {}\r\n\r\n", self.body.len()).as_bytes());
        wire.extend_from_slice(&self.body);
        wire
    }

    /// Parse a message produced by [`RawResponse::to_wire`] or any HTTP/1.x
    /// response without chunked encoding.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let (head, body) = split_head(bytes)?;
        let mut lines =
            head.split(|&b| b == b'\n').map(|line| line.strip_suffix(b"\r").unwrap_or(line));

        let status_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .map(String::from_utf8_lossy)
            .ok_or(WireError::MissingStatusLine)?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .filter(|v| v.starts_with("HTTP/"))
            .ok_or_else(|| WireError::StatusLine(status_line.to_string()))?;
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| WireError::StatusLine(status_line.to_string()))?;
        let reason = parts.next().unwrap_or_default().trim();

        let mut headers = Vec::new();
        for line in lines {
            let malformed = || WireError::Header(String::from_utf8_lossy(line).into_owned());
            let colon = line.iter().position(|&b| b == b':').ok_or_else(malformed)?;
            let name = std::str::from_utf8(&line[..colon]).map_err(|_| malformed())?;
            headers.push((name.trim().to_string(), line[colon + 1..].trim_ascii().to_vec()));
        }

        let mut response = Self {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
            headers,
            body: Vec::new(),
        };

        let length = response
            .header("content-length")
            .and_then(|len| std::str::from_utf8(len).ok())
            .and_then(|len| len.parse::<usize>().ok())
            .map_or(body.len(), |len| len.min(body.len()));
        response.body = body[..length].to_vec();

        Ok(response)
    }
}

fn split_head(bytes: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    if let Some(pos) = bytes.windows(4).position(|w| w == b"\r\n\r\n") {
        return Ok((&bytes[..pos], &bytes[pos + 4..]));
    }
    if let Some(pos) = bytes.windows(2).position(|w| w == b"\n\n") {
        return Ok((&bytes[..pos], &bytes[pos + 2..]));
    }
    if bytes.is_empty() { Err(WireError::MissingStatusLine) } else { Err(WireError::Unterminated) }
}
