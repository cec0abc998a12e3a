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

//! This module defines the proxy connect error types.

use http::StatusCode;
use std::io;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// An enumeration of possible errors.
///
/// Errors coming out of a nested transport job are re-mapped to the
/// `Proxy*` kinds before they reach the caller of a connect job.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    // Proxy specific kinds surfaced by the connect job.
    #[error("Failed to connect to the proxy")]
    ProxyConnectionFailed,
    #[error("Proxy certificate is invalid")]
    ProxyCertificateInvalid,
    #[error("Proxy requires HTTP/1.1")]
    ProxyHttp11Required,
    #[error("Proxy authentication requested")]
    ProxyAuthRequested,
    #[error("Unable to reuse connection for proxy auth")]
    UnableToReuseConnectionForProxyAuth,
    #[error("Tunnel connection failed: {0}")]
    TunnelConnectionFailed(String),
    #[error("Proxy connect job timed out")]
    TimedOut,

    // Transport and session level kinds.
    #[error("Certificate error: {0}")]
    CertificateError(String),
    #[error("SSL client certificate needed")]
    SslClientAuthCertNeeded,
    #[error("Bad SSL client certificate")]
    BadSslClientAuthCert,
    #[error("HTTP/1.1 required")]
    Http11Required,
    #[error("Name not resolved: {0}")]
    NameNotResolved(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection reset")]
    ConnectionReset,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Socket is not connected")]
    SocketNotConnected,
    #[error("Response headers too big")]
    ResponseHeadersTooBig,
    #[error("Invalid HTTP response: {0}")]
    InvalidResponse(String),
    #[error("Unsupported authentication scheme")]
    UnsupportedAuthScheme,
    #[error("No supported QUIC version")]
    NoQuicVersion,
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    // Configuration.
    #[error("Invalid socket params: {0}")]
    InvalidParams(&'static str),
    #[error("Invalid proxy configuration string")]
    MalformedConfigString,
    #[error("Invalid port number")]
    InvalidPortNumber,
    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedProxyScheme(String),
    #[error("Invalid timeout configuration: {0}")]
    InvalidTimeoutConfig(&'static str),

    #[error("Unexpected state: {0}")]
    UnexpectedState(&'static str),
}

impl Error {
    /// Tunnel failure for a non-success CONNECT response.
    pub fn tunnel_status(status: StatusCode) -> Self {
        Error::TunnelConnectionFailed(format!("unexpected status {}", status))
    }

    pub fn is_certificate_error(&self) -> bool {
        matches!(self, Error::CertificateError(_) | Error::ProxyCertificateInvalid)
    }

    /// True for the kinds that mean the peer went away under us.
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Error::ConnectionClosed
            | Error::ConnectionReset
            | Error::ConnectionAborted
            | Error::SocketNotConnected => true,
            Error::IoError(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
