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

//! Sockets that reach the destination through a CONNECT tunnel.
//!
//! Three transports carry the CONNECT exchange: a plain byte stream
//! (HTTP/1.1), an HTTP/2 stream and a QUIC stream. Once connected
//! each of them reads and writes like a direct connection to the
//! destination.

mod http1;
mod quic;
mod spdy;
mod stream;

pub use http1::HttpProxyClientSocket;
pub use quic::QuicProxyClientSocket;
pub use spdy::SpdyProxyClientSocket;

use crate::auth::HttpAuthController;
use crate::error::{Error, Result};
use crate::params::{HostPortPair, ProxyServer};
use crate::socket::{HttpResponseInfo, RequestPriority, StreamSocket};
use log::debug;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// The common contract of the tunnel sockets.
pub trait ProxyClientSocket: AsyncRead + AsyncWrite + Send + Unpin {
    /// Starts, then drives, the CONNECT handshake.
    ///
    /// Fails with `Error::ProxyAuthRequested` when the proxy asks for
    /// credentials; `connect_response_info` then holds the challenge.
    fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>>;

    /// Resends the CONNECT request with the credentials now held by
    /// the auth controller. Fails with
    /// `Error::UnableToReuseConnectionForProxyAuth` when a new
    /// connection is needed.
    fn poll_restart_with_auth(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>>;

    fn is_connected(&self) -> bool;

    fn connect_response_info(&self) -> Option<&HttpResponseInfo>;

    fn auth_controller(&self) -> Option<&Arc<dyn HttpAuthController>>;

    fn set_stream_priority(&mut self, priority: RequestPriority);
}

/// What a tunnel socket needs to know to build its CONNECT request.
#[derive(Clone)]
pub struct TunnelParams {
    pub endpoint: HostPortPair,
    pub proxy_server: ProxyServer,
    pub user_agent: String,
    pub auth: Option<Arc<dyn HttpAuthController>>,
}

impl TunnelParams {
    fn proxy_authorization(&self) -> Option<String> {
        self.auth.as_ref().and_then(|auth| auth.auth_header())
    }

    /// Hands a 407 response to the auth controller and returns the
    /// error the handshake ends with.
    fn handle_proxy_auth_challenge(&self, response: &HttpResponseInfo) -> Error {
        let Some(auth) = &self.auth else {
            return Error::tunnel_status(response.status);
        };
        match auth.handle_auth_challenge(response) {
            Ok(()) => {
                debug!("{} requested auth for {}", self.proxy_server, self.endpoint);
                Error::ProxyAuthRequested
            }
            Err(err) => err,
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tunnel is not connected")
}

/// A socket that completed (or is completing) a CONNECT handshake.
pub enum TunnelSocket {
    Http(HttpProxyClientSocket),
    Spdy(SpdyProxyClientSocket),
    Quic(QuicProxyClientSocket),
}

impl TunnelSocket {
    fn as_dyn(&self) -> &dyn ProxyClientSocket {
        match self {
            TunnelSocket::Http(socket) => socket,
            TunnelSocket::Spdy(socket) => socket,
            TunnelSocket::Quic(socket) => socket,
        }
    }

    fn as_dyn_mut(&mut self) -> &mut dyn ProxyClientSocket {
        match self {
            TunnelSocket::Http(socket) => socket,
            TunnelSocket::Spdy(socket) => socket,
            TunnelSocket::Quic(socket) => socket,
        }
    }
}

impl fmt::Debug for TunnelSocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self {
            TunnelSocket::Http(_) => "Http",
            TunnelSocket::Spdy(_) => "Spdy",
            TunnelSocket::Quic(_) => "Quic",
        };
        f.debug_struct("TunnelSocket")
            .field("kind", &kind)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ProxyClientSocket for TunnelSocket {
    fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.as_dyn_mut().poll_connect(cx)
    }

    fn poll_restart_with_auth(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.as_dyn_mut().poll_restart_with_auth(cx)
    }

    fn is_connected(&self) -> bool {
        self.as_dyn().is_connected()
    }

    fn connect_response_info(&self) -> Option<&HttpResponseInfo> {
        self.as_dyn().connect_response_info()
    }

    fn auth_controller(&self) -> Option<&Arc<dyn HttpAuthController>> {
        self.as_dyn().auth_controller()
    }

    fn set_stream_priority(&mut self, priority: RequestPriority) {
        self.as_dyn_mut().set_stream_priority(priority)
    }
}

impl AsyncRead for TunnelSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().as_dyn_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(self.get_mut().as_dyn_mut()).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().as_dyn_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().as_dyn_mut()).poll_shutdown(cx)
    }
}

/// The socket handed to the caller of a connect job.
pub enum ProxySocket {
    /// Connection to the proxy itself, for plain requests sent to the
    /// proxy without a tunnel.
    Direct(Box<dyn StreamSocket>),
    Tunnel(TunnelSocket),
}

impl fmt::Debug for ProxySocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProxySocket::Direct(_) => f.write_str("Direct"),
            ProxySocket::Tunnel(tunnel) => f.debug_tuple("Tunnel").field(tunnel).finish(),
        }
    }
}

impl ProxySocket {
    pub fn is_tunnel(&self) -> bool {
        matches!(self, ProxySocket::Tunnel(_))
    }

    pub fn as_tunnel(&self) -> Option<&TunnelSocket> {
        match self {
            ProxySocket::Tunnel(tunnel) => Some(tunnel),
            ProxySocket::Direct(_) => None,
        }
    }
}

impl AsyncRead for ProxySocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxySocket::Direct(socket) => Pin::new(socket).poll_read(cx, buf),
            ProxySocket::Tunnel(tunnel) => Pin::new(tunnel).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxySocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxySocket::Direct(socket) => Pin::new(socket).poll_write(cx, buf),
            ProxySocket::Tunnel(tunnel) => Pin::new(tunnel).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxySocket::Direct(socket) => Pin::new(socket).poll_flush(cx),
            ProxySocket::Tunnel(tunnel) => Pin::new(tunnel).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxySocket::Direct(socket) => Pin::new(socket).poll_shutdown(cx),
            ProxySocket::Tunnel(tunnel) => Pin::new(tunnel).poll_shutdown(cx),
        }
    }
}
