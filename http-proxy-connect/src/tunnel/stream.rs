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

//! CONNECT over a single request stream of a multiplexed session.
//!
//! Shared by the HTTP/2 and QUIC tunnel sockets. A stream carries
//! exactly one request, so a restart with credentials always needs a
//! fresh stream.

use super::{not_connected, TunnelParams};
use crate::error::{Error, Result};
use crate::socket::{HttpResponseInfo, ProxyStream};
use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::{PROXY_AUTHORIZATION, USER_AGENT};
use http::{Method, Request, StatusCode};
use log::debug;
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

struct Exchange {
    stream: Box<dyn ProxyStream>,
    result: Result<HttpResponseInfo>,
}

enum State {
    Idle(Box<dyn ProxyStream>),
    Handshake(BoxFuture<'static, Exchange>),
    AuthRequired(Box<dyn ProxyStream>),
    Connected(Box<dyn ProxyStream>),
    Closed,
}

pub(super) struct StreamTunnel {
    state: State,
    params: TunnelParams,
    response: Option<HttpResponseInfo>,
    /// Priority set while the stream was inside the handshake future.
    pending_priority: Option<u8>,
}

async fn exchange(mut stream: Box<dyn ProxyStream>, request: Request<()>) -> Exchange {
    let result = send_connect(&mut stream, request).await;
    Exchange { stream, result }
}

async fn send_connect(
    stream: &mut Box<dyn ProxyStream>,
    request: Request<()>,
) -> Result<HttpResponseInfo> {
    stream.send_request_headers(request).await?;
    stream.read_response_headers().await
}

impl StreamTunnel {
    pub(super) fn new(stream: Box<dyn ProxyStream>, params: TunnelParams) -> Self {
        StreamTunnel { state: State::Idle(stream), params, response: None, pending_priority: None }
    }

    pub(super) fn params(&self) -> &TunnelParams {
        &self.params
    }

    fn build_request(&self) -> Result<Request<()>> {
        let mut builder =
            Request::builder().method(Method::CONNECT).uri(self.params.endpoint.to_string());
        if !self.params.user_agent.is_empty() {
            builder = builder.header(USER_AGENT, self.params.user_agent.as_str());
        }
        if let Some(auth_header) = self.params.proxy_authorization() {
            builder = builder.header(PROXY_AUTHORIZATION, auth_header);
        }
        builder.body(()).map_err(|err| Error::TunnelConnectionFailed(err.to_string()))
    }

    pub(super) fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let State::Idle(_) = &self.state {
            if let State::Idle(stream) = mem::replace(&mut self.state, State::Closed) {
                let request = self.build_request()?;
                self.state = State::Handshake(exchange(stream, request).boxed());
            }
        }
        let handshake = match &mut self.state {
            State::Handshake(handshake) => handshake,
            State::Connected(_) => return Poll::Ready(Ok(())),
            _ => return Poll::Ready(Err(Error::SocketNotConnected)),
        };
        let Exchange { mut stream, result } = ready!(handshake.as_mut().poll(cx));
        if let Some(priority) = self.pending_priority.take() {
            stream.set_priority(priority);
        }
        Poll::Ready(self.on_response(stream, result))
    }

    fn on_response(
        &mut self,
        stream: Box<dyn ProxyStream>,
        result: Result<HttpResponseInfo>,
    ) -> Result<()> {
        self.state = State::Closed;
        let response = result?;
        debug!(
            "CONNECT {} via {}: {}",
            self.params.endpoint, self.params.proxy_server, response.status
        );
        let outcome = match response.status {
            StatusCode::OK => {
                self.state = State::Connected(stream);
                Ok(())
            }
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let err = self.params.handle_proxy_auth_challenge(&response);
                self.state = State::AuthRequired(stream);
                Err(err)
            }
            status => Err(Error::tunnel_status(status)),
        };
        self.response = Some(response);
        outcome
    }

    pub(super) fn poll_restart_with_auth(&mut self) -> Poll<Result<()>> {
        self.state = State::Closed;
        Poll::Ready(Err(Error::UnableToReuseConnectionForProxyAuth))
    }

    pub(super) fn is_connected(&self) -> bool {
        match &self.state {
            State::Connected(stream) => stream.is_open(),
            _ => false,
        }
    }

    pub(super) fn response(&self) -> Option<&HttpResponseInfo> {
        self.response.as_ref()
    }

    pub(super) fn set_priority(&mut self, priority: u8) {
        match &mut self.state {
            State::Idle(stream) | State::AuthRequired(stream) | State::Connected(stream) => {
                stream.set_priority(priority)
            }
            State::Handshake(_) => self.pending_priority = Some(priority),
            State::Closed => {}
        }
    }

    fn connected(&mut self) -> io::Result<Pin<&mut Box<dyn ProxyStream>>> {
        match &mut self.state {
            State::Connected(stream) => Ok(Pin::new(stream)),
            _ => Err(not_connected()),
        }
    }
}

impl AsyncRead for StreamTunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().connected()?.poll_read(cx, buf)
    }
}

impl AsyncWrite for StreamTunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().connected()?.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().connected()?.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().connected()?.poll_shutdown(cx)
    }
}
