//! Response metadata as received from the wire.

use http::{HeaderMap, StatusCode, Version};

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn from_parts(parts: &http::response::Parts) -> Self {
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers.clone(),
        }
    }

    /// `Content-Length`, when present and valid.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Status line in trace form, e.g. `HTTP/1.1 200 OK`.
    pub fn status_line(&self) -> String {
        let version = match self.version {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_2 => "HTTP/2",
            Version::HTTP_3 => "HTTP/3",
            _ => "HTTP/1.1",
        };
        match self.status.canonical_reason() {
            Some(reason) => format!("{} {} {}", version, self.status.as_u16(), reason),
            None => format!("{} {}", version, self.status.as_u16()),
        }
    }
}
