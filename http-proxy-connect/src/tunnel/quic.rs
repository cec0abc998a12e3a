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

use super::stream::StreamTunnel;
use super::{ProxyClientSocket, TunnelParams};
use crate::auth::HttpAuthController;
use crate::error::Result;
use crate::session::QuicSessionHandle;
use crate::socket::{HttpResponseInfo, ProxyStream, RequestPriority};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// CONNECT tunnel over a stream of a QUIC session to the proxy.
///
/// Holds on to the session handle so the session outlives the tunnel.
pub struct QuicProxyClientSocket {
    tunnel: StreamTunnel,
    _session: Box<dyn QuicSessionHandle>,
}

impl QuicProxyClientSocket {
    pub fn new(
        stream: Box<dyn ProxyStream>,
        session: Box<dyn QuicSessionHandle>,
        params: TunnelParams,
    ) -> Self {
        QuicProxyClientSocket { tunnel: StreamTunnel::new(stream, params), _session: session }
    }
}

impl ProxyClientSocket for QuicProxyClientSocket {
    fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.tunnel.poll_connect(cx)
    }

    fn poll_restart_with_auth(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.tunnel.poll_restart_with_auth()
    }

    fn is_connected(&self) -> bool {
        self.tunnel.is_connected()
    }

    fn connect_response_info(&self) -> Option<&HttpResponseInfo> {
        self.tunnel.response()
    }

    fn auth_controller(&self) -> Option<&Arc<dyn HttpAuthController>> {
        self.tunnel.params().auth.as_ref()
    }

    fn set_stream_priority(&mut self, priority: RequestPriority) {
        self.tunnel.set_priority(priority.to_quic_priority());
    }
}

impl AsyncRead for QuicProxyClientSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tunnel).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicProxyClientSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().tunnel).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tunnel).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tunnel).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::params::TrafficAnnotationTag;
    use crate::tunnel::spdy::tests::{tunnel_params, FakeStream};
    use futures::future::{poll_fn, BoxFuture};
    use futures::FutureExt;
    use http::StatusCode;
    use tokio::io::duplex;

    struct NoStreams;

    impl QuicSessionHandle for NoStreams {
        fn request_stream(
            &mut self,
            _requires_confirmation: bool,
            _traffic_annotation: TrafficAnnotationTag,
        ) -> BoxFuture<'static, Result<Box<dyn ProxyStream>>> {
            async { Err(Error::ConnectionClosed) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_priority_forwarded_as_quic_urgency() {
        let (client, _server) = duplex(1024);
        let stream = FakeStream::new(client, Ok(HttpResponseInfo::new(StatusCode::OK)));
        let priorities = stream.priorities.clone();
        let mut socket =
            QuicProxyClientSocket::new(Box::new(stream), Box::new(NoStreams), tunnel_params(None));

        socket.set_stream_priority(RequestPriority::Highest);
        poll_fn(|cx| socket.poll_connect(cx)).await.unwrap();
        socket.set_stream_priority(RequestPriority::Idle);
        assert!(socket.is_connected());
        assert_eq!(*priorities.lock().unwrap(), vec![0, 4]);
    }

    #[tokio::test]
    async fn test_restart_needs_new_stream() {
        let (client, _server) = duplex(1024);
        let stream = FakeStream::new(
            client,
            Ok(HttpResponseInfo::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED)),
        );
        let mut socket =
            QuicProxyClientSocket::new(Box::new(stream), Box::new(NoStreams), tunnel_params(None));
        // Without an auth controller a 407 is a plain tunnel failure.
        let err = poll_fn(|cx| socket.poll_connect(cx)).await.unwrap_err();
        assert!(matches!(err, Error::TunnelConnectionFailed(_)));
        let err = poll_fn(|cx| socket.poll_restart_with_auth(cx)).await.unwrap_err();
        assert!(matches!(err, Error::UnableToReuseConnectionForProxyAuth));
    }
}
