// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Socket and stream abstractions shared by the nested transport
//! jobs, the session providers and the tunnel sockets.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Request, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Request priority, lowest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestPriority {
    Throttled,
    Idle,
    Lowest,
    Low,
    Medium,
    Highest,
}

impl RequestPriority {
    pub const DEFAULT: RequestPriority = RequestPriority::Lowest;

    /// QUIC/HTTP2 urgency, 0 being the most urgent.
    pub fn to_quic_priority(self) -> u8 {
        let priority = self.max(RequestPriority::Idle);
        RequestPriority::Highest as u8 - priority as u8
    }
}

impl Default for RequestPriority {
    fn default() -> Self {
        RequestPriority::DEFAULT
    }
}

/// Application protocol negotiated on a transport (ALPN).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NextProto {
    #[default]
    Unknown,
    Http11,
    Http2,
    Quic,
}

/// Coarse progress of a connect attempt, for display purposes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadState {
    #[default]
    Idle,
    ResolvingHost,
    Connecting,
    SslHandshake,
    EstablishingProxyTunnel,
}

/// A connected byte stream produced by a nested transport job.
pub trait StreamSocket: AsyncRead + AsyncWrite + Send + Unpin {
    fn negotiated_protocol(&self) -> NextProto {
        NextProto::Unknown
    }

    fn is_connected(&self) -> bool {
        true
    }
}

impl StreamSocket for TcpStream {}

impl<T: StreamSocket + ?Sized> StreamSocket for Box<T> {
    fn negotiated_protocol(&self) -> NextProto {
        (**self).negotiated_protocol()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// A single bidirectional request stream on a multiplexed HTTP/2 or
/// QUIC session. Carries exactly one request.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn send_request_headers(&mut self, request: Request<()>) -> BoxFuture<'_, Result<()>>;

    fn read_response_headers(&mut self) -> BoxFuture<'_, Result<HttpResponseInfo>>;

    /// Sets the stream urgency, see `RequestPriority::to_quic_priority`.
    fn set_priority(&mut self, priority: u8);

    fn is_open(&self) -> bool {
        true
    }
}

/// Status line and headers of a proxy response.
#[derive(Clone, Debug)]
pub struct HttpResponseInfo {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl HttpResponseInfo {
    pub fn new(status: StatusCode) -> Self {
        HttpResponseInfo { status, version: Version::HTTP_11, headers: HeaderMap::new() }
    }

    /// Converts a completely parsed `httparse` response head.
    pub fn from_parsed(response: &httparse::Response) -> Result<Self> {
        let code = response.code.ok_or(Error::InvalidResponse("missing status".into()))?;
        let status =
            StatusCode::from_u16(code).map_err(|e| Error::InvalidResponse(e.to_string()))?;
        let version = match response.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let mut headers = HeaderMap::new();
        for header in response.headers.iter() {
            let name = http::header::HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| Error::InvalidResponse(e.to_string()))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| Error::InvalidResponse(e.to_string()))?;
            headers.append(name, value);
        }
        Ok(HttpResponseInfo { status, version, headers })
    }

    /// Whether the connection may carry another request after this
    /// response.
    pub fn is_keep_alive(&self) -> bool {
        let has_token = |name: &str, token: &str| {
            self.headers.get_all(name).iter().any(|value| {
                value
                    .to_str()
                    .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                    .unwrap_or(false)
            })
        };
        if has_token("connection", "close") || has_token("proxy-connection", "close") {
            return false;
        }
        if self.version == Version::HTTP_10 {
            return has_token("connection", "keep-alive")
                || has_token("proxy-connection", "keep-alive");
        }
        true
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> HttpResponseInfo {
        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut response = httparse::Response::new(&mut headers);
        assert!(response.parse(raw).unwrap().is_complete());
        HttpResponseInfo::from_parsed(&response).unwrap()
    }

    #[test]
    fn quic_priority_mapping() {
        assert_eq!(RequestPriority::Highest.to_quic_priority(), 0);
        assert_eq!(RequestPriority::Lowest.to_quic_priority(), 3);
        assert_eq!(RequestPriority::Idle.to_quic_priority(), 4);
        assert_eq!(RequestPriority::Throttled.to_quic_priority(), 4);
        assert_eq!(RequestPriority::default(), RequestPriority::Lowest);
    }

    #[test]
    fn keep_alive_rules() {
        assert!(parse(b"HTTP/1.1 407 Auth\r\nContent-Length: 0\r\n\r\n").is_keep_alive());
        assert!(!parse(b"HTTP/1.1 407 Auth\r\nConnection: close\r\n\r\n").is_keep_alive());
        assert!(!parse(b"HTTP/1.1 407 Auth\r\nProxy-Connection: Close\r\n\r\n").is_keep_alive());
        assert!(!parse(b"HTTP/1.0 407 Auth\r\n\r\n").is_keep_alive());
        assert!(parse(b"HTTP/1.0 407 Auth\r\nProxy-Connection: keep-alive\r\n\r\n")
            .is_keep_alive());
    }

    #[test]
    fn body_framing() {
        let info = parse(b"HTTP/1.1 407 Auth\r\nContent-Length: 12\r\n\r\n");
        assert_eq!(info.content_length(), Some(12));
        assert!(!info.is_chunked());
        let info = parse(b"HTTP/1.1 407 Auth\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(info.content_length(), None);
        assert!(info.is_chunked());
    }
}
