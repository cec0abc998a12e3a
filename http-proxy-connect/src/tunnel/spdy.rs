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
use crate::socket::{HttpResponseInfo, ProxyStream, RequestPriority};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// CONNECT tunnel over a stream of an HTTP/2 session to the proxy.
pub struct SpdyProxyClientSocket {
    tunnel: StreamTunnel,
}

impl SpdyProxyClientSocket {
    pub fn new(stream: Box<dyn ProxyStream>, params: TunnelParams) -> Self {
        SpdyProxyClientSocket { tunnel: StreamTunnel::new(stream, params) }
    }
}

impl ProxyClientSocket for SpdyProxyClientSocket {
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

    // The stream priority was fixed when it was requested.
    fn set_stream_priority(&mut self, _priority: RequestPriority) {}
}

impl AsyncRead for SpdyProxyClientSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tunnel).poll_read(cx, buf)
    }
}

impl AsyncWrite for SpdyProxyClientSocket {
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
pub(crate) mod tests {
    use super::*;
    use crate::auth::{BasicAuthControllerFactory, HttpAuthCache, HttpAuthControllerFactory};
    use crate::auth::{AuthCredentials, HttpAuthTarget};
    use crate::error::Error;
    use crate::params::{HostPortPair, NetworkIsolationKey, ProxyScheme, ProxyServer};
    use futures::future::{poll_fn, BoxFuture};
    use futures::FutureExt;
    use http::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, USER_AGENT};
    use http::{Method, Request, StatusCode};
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// A request stream answering CONNECT with a canned response and
    /// carrying data over an in-memory pipe.
    pub(crate) struct FakeStream {
        pub io: DuplexStream,
        pub response: Option<Result<HttpResponseInfo>>,
        pub sent: Arc<Mutex<Vec<Request<()>>>>,
        pub priorities: Arc<Mutex<Vec<u8>>>,
    }

    impl FakeStream {
        pub(crate) fn new(io: DuplexStream, response: Result<HttpResponseInfo>) -> Self {
            FakeStream {
                io,
                response: Some(response),
                sent: Arc::default(),
                priorities: Arc::default(),
            }
        }
    }

    impl ProxyStream for FakeStream {
        fn send_request_headers(&mut self, request: Request<()>) -> BoxFuture<'_, Result<()>> {
            self.sent.lock().unwrap().push(request);
            async { Ok(()) }.boxed()
        }

        fn read_response_headers(&mut self) -> BoxFuture<'_, Result<HttpResponseInfo>> {
            let response = self.response.take().unwrap_or(Err(Error::ConnectionClosed));
            async move { response }.boxed()
        }

        fn set_priority(&mut self, priority: u8) {
            self.priorities.lock().unwrap().push(priority);
        }
    }

    impl AsyncRead for FakeStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FakeStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().io).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
        }
    }

    pub(crate) fn tunnel_params(auth: Option<Arc<dyn HttpAuthController>>) -> TunnelParams {
        TunnelParams {
            endpoint: HostPortPair::new("www.example.org", 443),
            proxy_server: ProxyServer::new(
                ProxyScheme::Https,
                HostPortPair::new("proxy.example.com", 443),
            ),
            user_agent: "netsim".to_string(),
            auth,
        }
    }

    #[tokio::test]
    async fn test_connect_request_and_data() {
        let (client, mut server) = duplex(1024);
        let stream = FakeStream::new(client, Ok(HttpResponseInfo::new(StatusCode::OK)));
        let sent = stream.sent.clone();
        let mut socket = SpdyProxyClientSocket::new(Box::new(stream), tunnel_params(None));

        poll_fn(|cx| socket.poll_connect(cx)).await.unwrap();
        assert!(socket.is_connected());
        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].method(), Method::CONNECT);
            assert_eq!(sent[0].uri().authority().unwrap().as_str(), "www.example.org:443");
            assert_eq!(sent[0].headers()[USER_AGENT], "netsim");
            assert!(sent[0].headers().get(PROXY_AUTHORIZATION).is_none());
        }

        socket.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_auth_challenge_never_reuses_stream() {
        let auth = BasicAuthControllerFactory::new(Arc::new(HttpAuthCache::new())).create(
            HttpAuthTarget::Proxy,
            "https://proxy.example.com:443".parse().unwrap(),
            NetworkIsolationKey::default(),
        );
        let mut challenge = HttpResponseInfo::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        challenge
            .headers
            .append(PROXY_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"MyRealm1\""));
        let (client, _server) = duplex(1024);
        let stream = FakeStream::new(client, Ok(challenge));
        let mut socket = SpdyProxyClientSocket::new(Box::new(stream), tunnel_params(Some(auth.clone())));

        let err = poll_fn(|cx| socket.poll_connect(cx)).await.unwrap_err();
        assert!(matches!(err, Error::ProxyAuthRequested));
        assert!(socket.auth_controller().is_some());
        assert_eq!(
            socket.connect_response_info().unwrap().status,
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
        );

        auth.reset_auth(Some(AuthCredentials::new("user", "password")));
        let err = poll_fn(|cx| socket.poll_restart_with_auth(cx)).await.unwrap_err();
        assert!(matches!(err, Error::UnableToReuseConnectionForProxyAuth));
        assert!(!socket.is_connected());
    }

    #[tokio::test]
    async fn test_stream_error_passes_through() {
        let (client, _server) = duplex(1024);
        let stream = FakeStream::new(client, Err(Error::Http11Required));
        let mut socket = SpdyProxyClientSocket::new(Box::new(stream), tunnel_params(None));
        let err = poll_fn(|cx| socket.poll_connect(cx)).await.unwrap_err();
        assert!(matches!(err, Error::Http11Required));
        assert!(socket.connect_response_info().is_none());
    }

    #[tokio::test]
    async fn test_error_status() {
        let (client, _server) = duplex(1024);
        let stream =
            FakeStream::new(client, Ok(HttpResponseInfo::new(StatusCode::SERVICE_UNAVAILABLE)));
        let mut socket = SpdyProxyClientSocket::new(Box::new(stream), tunnel_params(None));
        let err = poll_fn(|cx| socket.poll_connect(cx)).await.unwrap_err();
        assert!(matches!(err, Error::TunnelConnectionFailed(_)));
    }
}
