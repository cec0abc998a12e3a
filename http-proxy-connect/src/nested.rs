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

//! Nested transport jobs: the TCP or TLS connection to the proxy
//! itself, made before any tunnel is negotiated.

use crate::error::{Error, Result};
use crate::params::{
    HostPortPair, SocketTag, SslSocketParams, TransportDestination, TransportSocketParams,
};
use crate::socket::{LoadState, NextProto, RequestPriority, StreamSocket};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Sleep;

/// Budget for resolving the proxy host and connecting to it.
pub const TRANSPORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(240);

/// Budget for a single address; the next address is tried after it.
pub const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

type Connector = fn(SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>>;

fn tcp_connect(addr: SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>> {
    TcpStream::connect(addr).boxed()
}

/// Timestamps of the phases of a transport connect.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectTiming {
    pub dns_start: Option<Instant>,
    pub dns_end: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_end: Option<Instant>,
}

/// Details of a failed host resolution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolveErrorInfo {
    pub error: Option<String>,
    pub is_secure_network_error: bool,
}

/// Information about a TLS client certificate request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SslCertRequestInfo {
    pub host_and_port: HostPortPair,
    /// Set when the request came from a proxy rather than the origin.
    pub is_proxy: bool,
    pub cert_authorities: Vec<Vec<u8>>,
}

/// A TCP or TLS connect to the proxy.
///
/// `poll_connect` is first called to start the connect and then
/// again after each wakeup until it returns `Ready`.
pub trait NestedConnectJob: Send {
    fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>>;

    /// Moves the connected socket out. Yields `Some` at most once,
    /// after a successful connect.
    fn pass_socket(&mut self) -> Option<Box<dyn StreamSocket>>;

    fn negotiated_protocol(&self) -> NextProto;

    fn load_state(&self) -> LoadState;

    fn has_established_connection(&self) -> bool;

    /// Only meaningful after a `SslClientAuthCertNeeded` failure.
    fn cert_request_info(&self) -> Option<SslCertRequestInfo>;

    fn resolve_error_info(&self) -> ResolveErrorInfo;

    fn change_priority(&mut self, priority: RequestPriority);

    fn connect_timing(&self) -> ConnectTiming;
}

/// Creates the nested jobs used by an `HttpProxyConnectJob`.
pub trait ConnectJobFactory: Send + Sync {
    fn create_transport_job(
        &self,
        params: &TransportSocketParams,
        priority: RequestPriority,
        socket_tag: SocketTag,
    ) -> Box<dyn NestedConnectJob>;

    /// Returns `None` when this factory cannot make TLS connections.
    fn create_ssl_job(
        &self,
        _params: &SslSocketParams,
        _priority: RequestPriority,
        _socket_tag: SocketTag,
    ) -> Option<Box<dyn NestedConnectJob>> {
        None
    }
}

/// Makes plain TCP connections with tokio.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnectJobFactory;

impl ConnectJobFactory for TcpConnectJobFactory {
    fn create_transport_job(
        &self,
        params: &TransportSocketParams,
        priority: RequestPriority,
        _socket_tag: SocketTag,
    ) -> Box<dyn NestedConnectJob> {
        Box::new(TransportConnectJob::new(params.clone(), priority))
    }
}

enum TransportState {
    Init,
    Resolving(BoxFuture<'static, io::Result<Vec<SocketAddr>>>),
    Connecting(BoxFuture<'static, Result<TcpStream>>),
    Connected(TcpStream),
    Done,
}

/// Resolves the proxy host and connects to each address in turn
/// until one succeeds.
///
/// The whole connect is bounded by `TRANSPORT_CONNECT_TIMEOUT` and each
/// address by `CONNECT_ATTEMPT_TIMEOUT`. Both fail with
/// `Error::TimedOut`.
pub struct TransportConnectJob {
    params: TransportSocketParams,
    priority: RequestPriority,
    state: TransportState,
    connector: Connector,
    connect_timeout: Duration,
    attempt_timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
    established: bool,
    timing: ConnectTiming,
    resolve_error_info: ResolveErrorInfo,
}

impl TransportConnectJob {
    pub fn new(params: TransportSocketParams, priority: RequestPriority) -> Self {
        Self::with_connector(params, priority, tcp_connect)
    }

    pub(crate) fn with_connector(
        params: TransportSocketParams,
        priority: RequestPriority,
        connector: Connector,
    ) -> Self {
        TransportConnectJob {
            params,
            priority,
            state: TransportState::Init,
            connector,
            connect_timeout: TRANSPORT_CONNECT_TIMEOUT,
            attempt_timeout: CONNECT_ATTEMPT_TIMEOUT,
            deadline: None,
            established: false,
            timing: ConnectTiming::default(),
            resolve_error_info: ResolveErrorInfo::default(),
        }
    }

    /// Overrides the overall and per-address connect timeouts.
    pub fn with_timeouts(mut self, connect_timeout: Duration, attempt_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(deadline) = self.deadline.as_mut() else {
            return Poll::Pending;
        };
        if deadline.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }
        debug!("Connect to {} timed out after {:?}", self.host_port(), self.connect_timeout);
        self.deadline = None;
        self.state = TransportState::Done;
        Poll::Ready(Err(Error::TimedOut))
    }

    fn host_port(&self) -> HostPortPair {
        match self.params.destination() {
            TransportDestination::HostPort(host_port) => host_port.clone(),
            TransportDestination::SchemeHostPort(scheme_host_port) => {
                scheme_host_port.host_port.clone()
            }
        }
    }
}

async fn connect_any(
    addrs: Vec<SocketAddr>,
    connector: Connector,
    attempt_timeout: Duration,
) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        match tokio::time::timeout(attempt_timeout, connector(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => {
                debug!("TCP connect to {} failed: {}", addr, err);
                last_error = Some(Error::from(err));
            }
            Err(_) => {
                debug!("TCP connect to {} timed out", addr);
                last_error = Some(Error::TimedOut);
            }
        }
    }
    Err(last_error.unwrap_or(Error::ProxyConnectionFailed))
}

impl NestedConnectJob for TransportConnectJob {
    fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        loop {
            match &mut self.state {
                TransportState::Init => {
                    let host_port = self.host_port();
                    self.timing.dns_start = Some(Instant::now());
                    self.deadline = Some(Box::pin(tokio::time::sleep(self.connect_timeout)));
                    let target = (host_port.host().to_string(), host_port.port());
                    self.state = TransportState::Resolving(
                        async move { lookup_host(target).await.map(|addrs| addrs.collect()) }
                            .boxed(),
                    );
                }
                TransportState::Resolving(resolve) => {
                    let addrs = match resolve.as_mut().poll(cx) {
                        Poll::Pending => return self.poll_deadline(cx),
                        Poll::Ready(result) => result,
                    };
                    self.timing.dns_end = Some(Instant::now());
                    let addrs: Vec<SocketAddr> = match addrs {
                        Ok(addrs) => addrs,
                        Err(err) => {
                            self.resolve_error_info.error = Some(err.to_string());
                            self.deadline = None;
                            self.state = TransportState::Done;
                            return Poll::Ready(Err(Error::NameNotResolved(err.to_string())));
                        }
                    };
                    if addrs.is_empty() {
                        self.resolve_error_info.error = Some("no addresses".to_string());
                        self.deadline = None;
                        self.state = TransportState::Done;
                        return Poll::Ready(Err(Error::NameNotResolved("no addresses".into())));
                    }
                    self.timing.connect_start = Some(Instant::now());
                    self.state = TransportState::Connecting(
                        connect_any(addrs, self.connector, self.attempt_timeout).boxed(),
                    );
                }
                TransportState::Connecting(connect) => {
                    let result = match connect.as_mut().poll(cx) {
                        Poll::Pending => return self.poll_deadline(cx),
                        Poll::Ready(result) => result,
                    };
                    self.timing.connect_end = Some(Instant::now());
                    self.deadline = None;
                    return match result {
                        Ok(stream) => {
                            self.established = true;
                            self.state = TransportState::Connected(stream);
                            Poll::Ready(Ok(()))
                        }
                        Err(err) => {
                            self.state = TransportState::Done;
                            Poll::Ready(Err(err))
                        }
                    };
                }
                TransportState::Connected(_) => return Poll::Ready(Ok(())),
                TransportState::Done => {
                    return Poll::Ready(Err(Error::UnexpectedState("transport job finished")))
                }
            }
        }
    }

    fn pass_socket(&mut self) -> Option<Box<dyn StreamSocket>> {
        match std::mem::replace(&mut self.state, TransportState::Done) {
            TransportState::Connected(stream) => Some(Box::new(stream)),
            other => {
                self.state = other;
                None
            }
        }
    }

    fn negotiated_protocol(&self) -> NextProto {
        NextProto::Unknown
    }

    fn load_state(&self) -> LoadState {
        match self.state {
            TransportState::Init | TransportState::Resolving(_) => LoadState::ResolvingHost,
            TransportState::Connecting(_) => LoadState::Connecting,
            TransportState::Connected(_) | TransportState::Done => LoadState::Idle,
        }
    }

    fn has_established_connection(&self) -> bool {
        self.established
    }

    fn cert_request_info(&self) -> Option<SslCertRequestInfo> {
        None
    }

    fn resolve_error_info(&self) -> ResolveErrorInfo {
        self.resolve_error_info.clone()
    }

    fn change_priority(&mut self, priority: RequestPriority) {
        self.priority = priority;
    }

    fn connect_timing(&self) -> ConnectTiming {
        self.timing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{pending, poll_fn};
    use tokio::net::TcpListener;

    /// Connects nowhere, like a proxy that drops SYNs.
    fn blackhole(_addr: SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>> {
        pending().boxed()
    }

    fn loopback() -> TransportSocketParams {
        TransportSocketParams::host_port(HostPortPair::new("127.0.0.1", 3128))
    }

    #[tokio::test]
    async fn test_transport_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let params = TransportSocketParams::host_port(HostPortPair::new("127.0.0.1", addr.port()));
        let mut job = TransportConnectJob::new(params, RequestPriority::DEFAULT);
        assert_eq!(job.load_state(), LoadState::ResolvingHost);
        assert!(!job.has_established_connection());

        poll_fn(|cx| job.poll_connect(cx)).await.unwrap();
        assert!(job.has_established_connection());
        assert!(job.connect_timing().connect_end.is_some());
        assert!(job.pass_socket().is_some());
        assert!(job.pass_socket().is_none());

        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_connect_refused() {
        // Bind and drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let params = TransportSocketParams::host_port(HostPortPair::new("127.0.0.1", port));
        let mut job = TransportConnectJob::new(params, RequestPriority::DEFAULT);
        let result = poll_fn(|cx| job.poll_connect(cx)).await;
        assert!(result.is_err());
        assert!(!job.has_established_connection());
        assert!(job.pass_socket().is_none());
        assert_eq!(job.resolve_error_info(), ResolveErrorInfo::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_connect_times_out() {
        let mut job =
            TransportConnectJob::with_connector(loopback(), RequestPriority::DEFAULT, blackhole);
        let started = tokio::time::Instant::now();
        let result = poll_fn(|cx| job.poll_connect(cx)).await;
        assert!(matches!(result, Err(Error::TimedOut)));
        assert_eq!(started.elapsed(), CONNECT_ATTEMPT_TIMEOUT);
        assert!(!job.has_established_connection());
        assert!(job.pass_socket().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_deadline_bounds_all_attempts() {
        let mut job =
            TransportConnectJob::with_connector(loopback(), RequestPriority::DEFAULT, blackhole)
                .with_timeouts(Duration::from_secs(5), Duration::from_secs(60));
        let started = tokio::time::Instant::now();
        let result = poll_fn(|cx| job.poll_connect(cx)).await;
        assert!(matches!(result, Err(Error::TimedOut)));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(job.load_state(), LoadState::Idle);
    }
}
