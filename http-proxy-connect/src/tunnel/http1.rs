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

use super::{not_connected, ProxyClientSocket, TunnelParams};
use crate::auth::HttpAuthController;
use crate::error::{Error, Result};
use crate::socket::{HttpResponseInfo, RequestPriority, StreamSocket};
use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::StatusCode;
use log::{debug, info};
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const HTTP_VERSION: &str = "1.1";

/// Upper bound on the size of the CONNECT response head.
const MAX_HEADERS_SIZE: usize = 256 * 1024;
const MAX_HEADERS: usize = 64;

/// The socket moves into the handshake future and comes back out
/// with the outcome.
struct Handshake {
    socket: Box<dyn StreamSocket>,
    result: Result<(HttpResponseInfo, usize)>,
}

enum State {
    Idle(Box<dyn StreamSocket>),
    Handshake(BoxFuture<'static, Handshake>),
    /// `drain` is the number of 407 body bytes still unread, `None`
    /// when the connection cannot carry another request.
    AuthRequired { socket: Box<dyn StreamSocket>, drain: Option<u64> },
    Connected(Box<dyn StreamSocket>),
    Disconnected,
}

/// CONNECT tunnel over an HTTP/1.1 connection to the proxy.
pub struct HttpProxyClientSocket {
    state: State,
    params: TunnelParams,
    response: Option<HttpResponseInfo>,
}

impl HttpProxyClientSocket {
    pub fn new(socket: Box<dyn StreamSocket>, params: TunnelParams) -> Self {
        HttpProxyClientSocket { state: State::Idle(socket), params, response: None }
    }

    fn build_tunnel_request(&self) -> String {
        let endpoint = &self.params.endpoint;
        let mut request = format!("CONNECT {} HTTP/{}\r\n", endpoint, HTTP_VERSION);
        request.push_str(&format!("Host: {}\r\n", endpoint));
        request.push_str("Proxy-Connection: keep-alive\r\n");
        if !self.params.user_agent.is_empty() {
            request.push_str(&format!("User-Agent: {}\r\n", self.params.user_agent));
        }
        if let Some(auth_header) = self.params.proxy_authorization() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth_header));
        }
        request.push_str("\r\n");
        request
    }

    fn start_handshake(&mut self, socket: Box<dyn StreamSocket>, drain: u64) {
        let request = self.build_tunnel_request();
        self.state = State::Handshake(handshake(socket, request, drain).boxed());
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let handshake = match &mut self.state {
            State::Handshake(handshake) => handshake,
            State::Connected(_) => return Poll::Ready(Ok(())),
            _ => return Poll::Ready(Err(Error::SocketNotConnected)),
        };
        let Handshake { socket, result } = ready!(handshake.as_mut().poll(cx));
        Poll::Ready(self.on_handshake(socket, result))
    }

    fn on_handshake(
        &mut self,
        socket: Box<dyn StreamSocket>,
        result: Result<(HttpResponseInfo, usize)>,
    ) -> Result<()> {
        self.state = State::Disconnected;
        let (response, extra) = result?;
        let status = response.status;
        debug!("CONNECT {} via {}: {}", self.params.endpoint, self.params.proxy_server, status);
        let outcome = match status {
            StatusCode::OK if extra > 0 => {
                Err(Error::TunnelConnectionFailed("data past the end of the headers".into()))
            }
            StatusCode::OK => {
                self.state = State::Connected(socket);
                Ok(())
            }
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let drain = if response.is_keep_alive() && !response.is_chunked() {
                    response.content_length().and_then(|len| len.checked_sub(extra as u64))
                } else {
                    None
                };
                let err = self.params.handle_proxy_auth_challenge(&response);
                self.state = State::AuthRequired { socket, drain };
                Err(err)
            }
            _ => Err(Error::tunnel_status(status)),
        };
        self.response = Some(response);
        outcome
    }
}

async fn handshake(mut socket: Box<dyn StreamSocket>, request: String, drain: u64) -> Handshake {
    let result = exchange(&mut socket, request, drain).await;
    Handshake { socket, result }
}

/// Sends `request` and reads the response head. Returns the response
/// and the number of bytes read past its end.
async fn exchange(
    socket: &mut Box<dyn StreamSocket>,
    request: String,
    drain: u64,
) -> Result<(HttpResponseInfo, usize)> {
    if drain > 0 {
        let drained =
            tokio::io::copy(&mut AsyncReadExt::take(&mut *socket, drain), &mut tokio::io::sink())
                .await?;
        if drained < drain {
            return Err(Error::ConnectionClosed);
        }
    }
    socket.write_all(request.as_bytes()).await?;
    socket.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if socket.read_buf(&mut buf).await? == 0 {
            return Err(if buf.is_empty() {
                Error::ConnectionClosed
            } else {
                Error::InvalidResponse("truncated response headers".into())
            });
        }
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                let info = HttpResponseInfo::from_parsed(&response)?;
                return Ok((info, buf.len() - len));
            }
            Ok(httparse::Status::Partial) if buf.len() > MAX_HEADERS_SIZE => {
                return Err(Error::ResponseHeadersTooBig);
            }
            Ok(httparse::Status::Partial) => {}
            Err(err) => return Err(Error::InvalidResponse(err.to_string())),
        }
    }
}

impl ProxyClientSocket for HttpProxyClientSocket {
    fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let State::Idle(_) = &self.state {
            if let State::Idle(socket) = mem::replace(&mut self.state, State::Disconnected) {
                self.start_handshake(socket, 0);
            }
        }
        self.poll_handshake(cx)
    }

    fn poll_restart_with_auth(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let State::AuthRequired { .. } = &self.state {
            match mem::replace(&mut self.state, State::Disconnected) {
                State::AuthRequired { socket, drain: Some(drain) } if socket.is_connected() => {
                    debug!("Resending CONNECT to {} on the same connection", self.params.proxy_server);
                    self.start_handshake(socket, drain);
                }
                _ => {
                    info!("{} closed the connection after 407", self.params.proxy_server);
                    return Poll::Ready(Err(Error::UnableToReuseConnectionForProxyAuth));
                }
            }
        }
        self.poll_handshake(cx)
    }

    fn is_connected(&self) -> bool {
        match &self.state {
            State::Connected(socket) => socket.is_connected(),
            _ => false,
        }
    }

    fn connect_response_info(&self) -> Option<&HttpResponseInfo> {
        self.response.as_ref()
    }

    fn auth_controller(&self) -> Option<&Arc<dyn HttpAuthController>> {
        self.params.auth.as_ref()
    }

    fn set_stream_priority(&mut self, _priority: RequestPriority) {}
}

impl AsyncRead for HttpProxyClientSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Connected(socket) => Pin::new(socket).poll_read(cx, buf),
            _ => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for HttpProxyClientSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().state {
            State::Connected(socket) => Pin::new(socket).poll_write(cx, buf),
            _ => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Connected(socket) => Pin::new(socket).poll_flush(cx),
            _ => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Connected(socket) => Pin::new(socket).poll_shutdown(cx),
            _ => Poll::Ready(Err(not_connected())),
        }
    }
}
