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

// # HTTP proxy connect job
//
// `HttpProxyConnectJob` produces a socket to an endpoint through an
// HTTP, HTTPS or QUIC proxy. It is a `Stream` of `JobEvent`s: zero or
// more `NeedsProxyAuth` followed by exactly one `Complete`.
//
// Each poll runs a trampoline over `ConnectState`. A `do_*` step
// either finishes synchronously and names the next state, or returns
// `Poll::Pending` after parking its state in `next_state`. The
// in-flight operation of a `*Complete` state lives in one of the
// `Option` slots of the job and is polled again on the next wakeup.
//
// Phases and their timers:
//
//   BeginConnect ........ nested connect timeout (adaptive)
//   tunnel steps ........ TUNNEL_TIMEOUT
//   auth challenge ...... no timer
//
// Auth challenges are reported on the poll after the one that saw
// them. The `RestartWithAuth` handle in the challenge resumes the job,
// dropping it fails the job with `Error::ProxyAuthRequested`.

use crate::auth::{
    BasicAuthControllerFactory, HttpAuthCache, HttpAuthController, HttpAuthControllerFactory,
    HttpAuthTarget,
};
use crate::error::{Error, Result};
use crate::nested::{
    ConnectJobFactory, NestedConnectJob, ResolveErrorInfo, SslCertRequestInfo,
    TcpConnectJobFactory,
};
use crate::params::{HttpProxySocketParams, ProxyScheme, SocketTag};
use crate::session::{
    Http2Session, Http2SessionPool, QuicSessionHandle, QuicSessionRequest, QuicStreamFactory,
    QuicVersion,
};
use crate::socket::{HttpResponseInfo, LoadState, NextProto, ProxyStream, RequestPriority};
use crate::timeout::{
    alternate_nested_connection_timeout, NetworkQualityEstimator, ProxyTimeoutConfig,
    TUNNEL_TIMEOUT,
};
use crate::tunnel::{
    HttpProxyClientSocket, ProxyClientSocket, ProxySocket, QuicProxyClientSocket,
    SpdyProxyClientSocket, TunnelParams, TunnelSocket,
};
use futures::future::BoxFuture;
use futures::stream::{FusedStream, Stream};
use log::{debug, info, warn};
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::Sleep;

/// Priority of the HTTP/2 and QUIC stream requests made for a tunnel.
/// Not affected by `change_priority`.
pub const TUNNEL_PRIORITY: RequestPriority = RequestPriority::DEFAULT;

/// Collaborators shared by the connect jobs of one network context.
#[derive(Clone)]
pub struct CommonConnectJobParams {
    pub connect_job_factory: Arc<dyn ConnectJobFactory>,
    pub http2_session_pool: Option<Arc<dyn Http2SessionPool>>,
    pub quic_stream_factory: Option<Arc<dyn QuicStreamFactory>>,
    /// The first entry is used for new QUIC sessions.
    pub quic_supported_versions: Vec<QuicVersion>,
    pub auth_controller_factory: Arc<dyn HttpAuthControllerFactory>,
    pub network_quality_estimator: Option<Arc<dyn NetworkQualityEstimator>>,
    pub user_agent: Option<String>,
    pub timeout_config: ProxyTimeoutConfig,
}

impl Default for CommonConnectJobParams {
    fn default() -> Self {
        CommonConnectJobParams {
            connect_job_factory: Arc::new(TcpConnectJobFactory),
            http2_session_pool: None,
            quic_stream_factory: None,
            quic_supported_versions: Vec::new(),
            auth_controller_factory: Arc::new(BasicAuthControllerFactory::new(Arc::new(
                HttpAuthCache::new(),
            ))),
            network_quality_estimator: None,
            user_agent: None,
            timeout_config: ProxyTimeoutConfig::default(),
        }
    }
}

impl CommonConnectJobParams {
    pub fn with_connect_job_factory(mut self, factory: Arc<dyn ConnectJobFactory>) -> Self {
        self.connect_job_factory = factory;
        self
    }

    pub fn with_http2_session_pool(mut self, pool: Arc<dyn Http2SessionPool>) -> Self {
        self.http2_session_pool = Some(pool);
        self
    }

    pub fn with_quic_stream_factory(
        mut self,
        factory: Arc<dyn QuicStreamFactory>,
        supported_versions: Vec<QuicVersion>,
    ) -> Self {
        self.quic_stream_factory = Some(factory);
        self.quic_supported_versions = supported_versions;
        self
    }

    pub fn with_auth_controller_factory(
        mut self,
        factory: Arc<dyn HttpAuthControllerFactory>,
    ) -> Self {
        self.auth_controller_factory = factory;
        self
    }

    pub fn with_network_quality_estimator(
        mut self,
        estimator: Arc<dyn NetworkQualityEstimator>,
    ) -> Self {
        self.network_quality_estimator = Some(estimator);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_timeout_config(mut self, timeout_config: ProxyTimeoutConfig) -> Self {
        self.timeout_config = timeout_config;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectState {
    BeginConnect,
    TransportConnect,
    TransportConnectComplete,
    HttpTunnelConnect,
    HttpTunnelConnectComplete,
    Http2StreamCreate,
    Http2StreamCreateComplete,
    QuicSessionCreate,
    QuicStreamCreate,
    QuicStreamCreateComplete,
    RestartWithAuth,
    RestartWithAuthComplete,
    None,
}

/// Resumes a job paused on an auth challenge.
///
/// Set the credentials on the challenge's auth controller first.
pub struct RestartWithAuth {
    tx: oneshot::Sender<()>,
}

impl RestartWithAuth {
    /// Does nothing if the job is gone.
    pub fn restart(self) {
        let _ = self.tx.send(());
    }
}

/// A proxy asked for credentials.
pub struct AuthChallenge {
    pub response: HttpResponseInfo,
    pub auth_controller: Arc<dyn HttpAuthController>,
    pub restart: RestartWithAuth,
}

pub enum JobEvent {
    NeedsProxyAuth(AuthChallenge),
    Complete(Result<ProxySocket>),
}

impl fmt::Debug for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobEvent::NeedsProxyAuth(challenge) => {
                write!(f, "NeedsProxyAuth({})", challenge.response.status)
            }
            JobEvent::Complete(result) => f.debug_tuple("Complete").field(result).finish(),
        }
    }
}

enum AuthWait {
    Idle,
    /// A challenge was seen; report it on the next poll.
    Notify,
    Waiting(oneshot::Receiver<()>),
}

pub struct HttpProxyConnectJob {
    params: HttpProxySocketParams,
    common: CommonConnectJobParams,
    priority: RequestPriority,
    socket_tag: SocketTag,
    next_state: ConnectState,
    started: bool,
    done: bool,

    nested_job: Option<Box<dyn NestedConnectJob>>,
    transport_socket: Option<TunnelSocket>,
    http2_stream_request: Option<BoxFuture<'static, Result<Box<dyn ProxyStream>>>>,
    quic_session_request: Option<BoxFuture<'static, Result<Box<dyn QuicSessionHandle>>>>,
    quic_session: Option<Box<dyn QuicSessionHandle>>,
    quic_stream_request: Option<BoxFuture<'static, Result<Box<dyn ProxyStream>>>>,
    socket: Option<ProxySocket>,

    auth_controller: Option<Arc<dyn HttpAuthController>>,
    auth: AuthWait,
    has_established_connection: bool,
    has_restarted: bool,
    resolve_error_info: ResolveErrorInfo,
    cert_request_info: Option<SslCertRequestInfo>,

    timer: Option<Pin<Box<Sleep>>>,
    connect_start: Option<Instant>,
}

impl HttpProxyConnectJob {
    /// Creates a job. Nothing happens until the job is first polled.
    ///
    /// When tunneling, an auth controller for the proxy is created from
    /// `common.auth_controller_factory`.
    pub fn new(
        params: HttpProxySocketParams,
        common: CommonConnectJobParams,
        priority: RequestPriority,
        socket_tag: SocketTag,
    ) -> Result<Self> {
        let auth_controller = if params.tunnel() {
            let scheme = if params.ssl_params().is_some() { "https" } else { "http" };
            let url = params.destination()?.to_uri(scheme)?;
            Some(common.auth_controller_factory.create(
                HttpAuthTarget::Proxy,
                url,
                params.network_isolation_key().clone(),
            ))
        } else {
            None
        };
        Ok(HttpProxyConnectJob {
            params,
            common,
            priority,
            socket_tag,
            next_state: ConnectState::None,
            started: false,
            done: false,
            nested_job: None,
            transport_socket: None,
            http2_stream_request: None,
            quic_session_request: None,
            quic_session: None,
            quic_stream_request: None,
            socket: None,
            auth_controller,
            auth: AuthWait::Idle,
            has_established_connection: false,
            has_restarted: false,
            resolve_error_info: ResolveErrorInfo::default(),
            cert_request_info: None,
            timer: None,
            connect_start: None,
        })
    }

    pub fn params(&self) -> &HttpProxySocketParams {
        &self.params
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    pub fn connect_state(&self) -> ConnectState {
        self.next_state
    }

    pub fn auth_controller(&self) -> Option<&Arc<dyn HttpAuthController>> {
        self.auth_controller.as_ref()
    }

    /// Applies to the nested job and the tunnel socket. Stream requests
    /// keep `TUNNEL_PRIORITY`.
    pub fn change_priority(&mut self, priority: RequestPriority) {
        self.priority = priority;
        if let Some(nested_job) = self.nested_job.as_mut() {
            nested_job.change_priority(priority);
        }
        if let Some(transport_socket) = self.transport_socket.as_mut() {
            transport_socket.set_stream_priority(priority);
        }
    }

    pub fn load_state(&self) -> LoadState {
        match self.next_state {
            ConnectState::TransportConnectComplete => {
                self.nested_job.as_ref().map(|job| job.load_state()).unwrap_or_default()
            }
            ConnectState::HttpTunnelConnect
            | ConnectState::HttpTunnelConnectComplete
            | ConnectState::Http2StreamCreate
            | ConnectState::Http2StreamCreateComplete
            | ConnectState::QuicSessionCreate
            | ConnectState::QuicStreamCreate
            | ConnectState::QuicStreamCreateComplete
            | ConnectState::RestartWithAuth
            | ConnectState::RestartWithAuthComplete => LoadState::EstablishingProxyTunnel,
            ConnectState::BeginConnect | ConnectState::TransportConnect | ConnectState::None => {
                LoadState::Idle
            }
        }
    }

    /// True once a connection to the proxy exists, including one the
    /// nested job made but has not finished handshaking on.
    pub fn has_established_connection(&self) -> bool {
        self.has_established_connection
            || self.nested_job.as_ref().is_some_and(|job| job.has_established_connection())
    }

    pub fn resolve_error_info(&self) -> &ResolveErrorInfo {
        &self.resolve_error_info
    }

    /// Set after the proxy asked for a client certificate.
    pub fn cert_request_info(&self) -> Option<&SslCertRequestInfo> {
        self.cert_request_info.as_ref()
    }

    pub fn is_ssl_error(&self) -> bool {
        self.cert_request_info.is_some()
    }

    fn reset_timer(&mut self, timeout: Duration) {
        self.timer =
            if timeout.is_zero() { None } else { Some(Box::pin(tokio::time::sleep(timeout))) };
    }

    fn wait(&mut self, state: ConnectState) -> Poll<Result<()>> {
        self.next_state = state;
        Poll::Pending
    }

    fn tunnel_params(&self) -> Result<TunnelParams> {
        Ok(TunnelParams {
            endpoint: self.params.endpoint().clone(),
            proxy_server: self.params.proxy_server()?,
            user_agent: self.common.user_agent.clone().unwrap_or_default(),
            auth: self.auth_controller.clone(),
        })
    }

    fn find_http2_session(&self) -> Result<Option<Arc<dyn Http2Session>>> {
        let Some(pool) = &self.common.http2_session_pool else {
            return Ok(None);
        };
        let key = self.params.spdy_session_key(self.socket_tag)?;
        Ok(pool.find_available_session(&key, false, false))
    }

    fn elapsed(&self) -> Duration {
        self.connect_start.map(|start| start.elapsed()).unwrap_or_default()
    }

    fn do_loop(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        loop {
            let state = mem::replace(&mut self.next_state, ConnectState::None);
            let rv = match state {
                ConnectState::BeginConnect => self.do_begin_connect(),
                ConnectState::TransportConnect => self.do_transport_connect(),
                ConnectState::TransportConnectComplete => self.do_transport_connect_complete(cx),
                ConnectState::HttpTunnelConnect => self.do_http_tunnel_connect(),
                ConnectState::HttpTunnelConnectComplete => {
                    self.do_http_tunnel_connect_complete(cx)
                }
                ConnectState::Http2StreamCreate => self.do_http2_stream_create(),
                ConnectState::Http2StreamCreateComplete => {
                    self.do_http2_stream_create_complete(cx)
                }
                ConnectState::QuicSessionCreate => self.do_quic_session_create(),
                ConnectState::QuicStreamCreate => self.do_quic_stream_create(cx),
                ConnectState::QuicStreamCreateComplete => self.do_quic_stream_create_complete(cx),
                ConnectState::RestartWithAuth => self.do_restart_with_auth(),
                ConnectState::RestartWithAuthComplete => self.do_restart_with_auth_complete(cx),
                ConnectState::None => {
                    return Poll::Ready(Err(Error::UnexpectedState("connect loop without state")))
                }
            };
            match rv {
                Poll::Ready(Ok(())) if self.next_state != ConnectState::None => {
                    debug!("Proxy connect job: {:?} -> {:?}", state, self.next_state);
                }
                rv => return rv,
            }
        }
    }

    fn do_begin_connect(&mut self) -> Poll<Result<()>> {
        self.connect_start = Some(Instant::now());
        let timeout = alternate_nested_connection_timeout(
            &self.params,
            self.common.network_quality_estimator.as_deref(),
            &self.common.timeout_config,
        );
        self.reset_timer(timeout);
        self.next_state = match self.params.proxy_scheme() {
            ProxyScheme::Quic => {
                // QUIC has its own connection establishment.
                self.has_established_connection = true;
                ConnectState::QuicSessionCreate
            }
            ProxyScheme::Http => ConnectState::TransportConnect,
            ProxyScheme::Https if self.params.tunnel() && self.find_http2_session()?.is_some() => {
                ConnectState::Http2StreamCreate
            }
            ProxyScheme::Https => ConnectState::TransportConnect,
        };
        Poll::Ready(Ok(()))
    }

    fn do_transport_connect(&mut self) -> Poll<Result<()>> {
        let factory = &self.common.connect_job_factory;
        let nested_job = match self.params.proxy_scheme() {
            ProxyScheme::Http => {
                let transport_params = self
                    .params
                    .transport_params()
                    .ok_or(Error::UnexpectedState("plain proxy without transport params"))?;
                factory.create_transport_job(transport_params, self.priority, self.socket_tag)
            }
            ProxyScheme::Https | ProxyScheme::Quic => {
                let ssl_params = self
                    .params
                    .ssl_params()
                    .ok_or(Error::UnexpectedState("secure proxy without TLS params"))?;
                factory
                    .create_ssl_job(ssl_params, self.priority, self.socket_tag)
                    .ok_or(Error::MissingCollaborator("TLS connect job factory"))?
            }
        };
        self.nested_job = Some(nested_job);
        self.next_state = ConnectState::TransportConnectComplete;
        Poll::Ready(Ok(()))
    }

    fn do_transport_connect_complete(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let elapsed = self.elapsed();
        let Some(nested_job) = self.nested_job.as_mut() else {
            return Poll::Ready(Err(Error::UnexpectedState("transport connect without job")));
        };
        let result = match nested_job.poll_connect(cx) {
            Poll::Pending => return self.wait(ConnectState::TransportConnectComplete),
            Poll::Ready(result) => result,
        };
        self.resolve_error_info = nested_job.resolve_error_info();
        let scheme = self.params.proxy_scheme();

        if let Err(err) = result {
            debug!("Connect to {} proxy failed after {:?}: {}", scheme, elapsed, err);
            if err.is_certificate_error() {
                return Poll::Ready(Err(Error::ProxyCertificateInvalid));
            }
            if let Error::SslClientAuthCertNeeded = err {
                let mut cert_request_info = nested_job.cert_request_info().unwrap_or_default();
                cert_request_info.is_proxy = true;
                self.cert_request_info = Some(cert_request_info);
                return Poll::Ready(Err(err));
            }
            return Poll::Ready(Err(Error::ProxyConnectionFailed));
        }
        debug!("Connected to {} proxy in {:?}", scheme, elapsed);
        self.has_established_connection = true;

        if !self.params.tunnel() {
            let socket = nested_job
                .pass_socket()
                .ok_or(Error::UnexpectedState("nested job finished without socket"))?;
            self.nested_job = None;
            self.socket = Some(ProxySocket::Direct(socket));
            return Poll::Ready(Ok(()));
        }

        self.next_state = if nested_job.negotiated_protocol() == NextProto::Http2 {
            ConnectState::Http2StreamCreate
        } else {
            ConnectState::HttpTunnelConnect
        };
        Poll::Ready(Ok(()))
    }

    fn do_http_tunnel_connect(&mut self) -> Poll<Result<()>> {
        self.reset_timer(TUNNEL_TIMEOUT);
        let socket = self
            .nested_job
            .take()
            .and_then(|mut job| job.pass_socket())
            .ok_or(Error::UnexpectedState("tunnel connect without transport socket"))?;
        let tunnel_params = self.tunnel_params()?;
        self.transport_socket =
            Some(TunnelSocket::Http(HttpProxyClientSocket::new(socket, tunnel_params)));
        self.next_state = ConnectState::HttpTunnelConnectComplete;
        Poll::Ready(Ok(()))
    }

    fn do_http_tunnel_connect_complete(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(transport_socket) = self.transport_socket.as_mut() else {
            return Poll::Ready(Err(Error::UnexpectedState("tunnel connect without socket")));
        };
        let result = match transport_socket.poll_connect(cx) {
            Poll::Pending => return self.wait(ConnectState::HttpTunnelConnectComplete),
            Poll::Ready(result) => result,
        };
        self.handle_tunnel_result(result, cx)
    }

    fn handle_tunnel_result(&mut self, result: Result<()>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match result {
            Ok(()) => {
                let socket = self
                    .transport_socket
                    .take()
                    .ok_or(Error::UnexpectedState("tunnel finished without socket"))?;
                debug!("Tunnel to {} established in {:?}", self.params.endpoint(), self.elapsed());
                self.socket = Some(ProxySocket::Tunnel(socket));
                Poll::Ready(Ok(()))
            }
            Err(Error::ProxyAuthRequested) => {
                // Reported from the next poll.
                self.auth = AuthWait::Notify;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(Error::Http11Required) => Poll::Ready(Err(Error::ProxyHttp11Required)),
            // Client certificate rejections can surface on the first read
            // after the TLS handshake.
            Err(Error::BadSslClientAuthCert) => Poll::Ready(Err(Error::ProxyConnectionFailed)),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn do_http2_stream_create(&mut self) -> Poll<Result<()>> {
        self.reset_timer(TUNNEL_TIMEOUT);
        let pool = self
            .common
            .http2_session_pool
            .clone()
            .ok_or(Error::MissingCollaborator("HTTP/2 session pool"))?;
        let key = self.params.spdy_session_key(self.socket_tag)?;
        let session = match pool.find_available_session(&key, false, false) {
            Some(session) => {
                // A session to the proxy may have been created meanwhile.
                debug!("Using existing HTTP/2 session to {}", key.host_port);
                self.nested_job = None;
                session
            }
            None => {
                let mut nested_job = self
                    .nested_job
                    .take()
                    .ok_or(Error::UnexpectedState("no HTTP/2 session or transport"))?;
                let socket = nested_job
                    .pass_socket()
                    .ok_or(Error::UnexpectedState("nested job finished without socket"))?;
                pool.create_available_session_from_socket(
                    &key,
                    socket,
                    nested_job.connect_timing(),
                )?
            }
        };
        let url = self.params.endpoint().to_uri("https")?;
        self.http2_stream_request = Some(session.request_stream(
            url,
            TUNNEL_PRIORITY,
            self.socket_tag,
            self.params.traffic_annotation(),
        ));
        self.next_state = ConnectState::Http2StreamCreateComplete;
        Poll::Ready(Ok(()))
    }

    fn do_http2_stream_create_complete(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(request) = self.http2_stream_request.as_mut() else {
            return Poll::Ready(Err(Error::UnexpectedState("no HTTP/2 stream request")));
        };
        let result = match request.as_mut().poll(cx) {
            Poll::Pending => return self.wait(ConnectState::Http2StreamCreateComplete),
            Poll::Ready(result) => result,
        };
        self.http2_stream_request = None;
        let stream = match result {
            Ok(stream) => stream,
            Err(Error::BadSslClientAuthCert) => {
                return Poll::Ready(Err(Error::ProxyConnectionFailed))
            }
            Err(err) => return Poll::Ready(Err(err)),
        };
        let tunnel_params = self.tunnel_params()?;
        self.transport_socket =
            Some(TunnelSocket::Spdy(SpdyProxyClientSocket::new(stream, tunnel_params)));
        self.next_state = ConnectState::HttpTunnelConnectComplete;
        Poll::Ready(Ok(()))
    }

    fn do_quic_session_create(&mut self) -> Poll<Result<()>> {
        self.reset_timer(TUNNEL_TIMEOUT);
        let ssl_params = self
            .params
            .ssl_params()
            .ok_or(Error::UnexpectedState("QUIC proxy without TLS params"))?;
        let factory = self
            .common
            .quic_stream_factory
            .as_ref()
            .ok_or(Error::MissingCollaborator("QUIC stream factory"))?;
        let version = *self.common.quic_supported_versions.first().ok_or(Error::NoQuicVersion)?;
        let destination = self.params.destination()?.clone();
        let url = destination.to_uri("https")?;
        let request = QuicSessionRequest {
            scheme: "https",
            destination,
            version,
            privacy_mode: ssl_params.privacy_mode(),
            priority: TUNNEL_PRIORITY,
            socket_tag: self.socket_tag,
            network_isolation_key: self.params.network_isolation_key().clone(),
            secure_dns_policy: ssl_params.direct_connection_params().secure_dns_policy(),
            cert_verify_flags: ssl_params.cert_verify_flags(),
            url,
        };
        self.quic_session_request = Some(factory.request(request));
        self.next_state = ConnectState::QuicStreamCreate;
        Poll::Ready(Ok(()))
    }

    fn do_quic_stream_create(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(request) = self.quic_session_request.as_mut() else {
            return Poll::Ready(Err(Error::UnexpectedState("no QUIC session request")));
        };
        let result = match request.as_mut().poll(cx) {
            Poll::Pending => return self.wait(ConnectState::QuicStreamCreate),
            Poll::Ready(result) => result,
        };
        self.quic_session_request = None;
        let mut session = result?;
        self.quic_stream_request =
            Some(session.request_stream(false, self.params.traffic_annotation()));
        self.quic_session = Some(session);
        self.next_state = ConnectState::QuicStreamCreateComplete;
        Poll::Ready(Ok(()))
    }

    fn do_quic_stream_create_complete(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(request) = self.quic_stream_request.as_mut() else {
            return Poll::Ready(Err(Error::UnexpectedState("no QUIC stream request")));
        };
        let result = match request.as_mut().poll(cx) {
            Poll::Pending => return self.wait(ConnectState::QuicStreamCreateComplete),
            Poll::Ready(result) => result,
        };
        self.quic_stream_request = None;
        let mut stream = result?;
        stream.set_priority(TUNNEL_PRIORITY.to_quic_priority());
        let session =
            self.quic_session.take().ok_or(Error::UnexpectedState("QUIC stream without session"))?;
        let tunnel_params = self.tunnel_params()?;
        self.transport_socket =
            Some(TunnelSocket::Quic(QuicProxyClientSocket::new(stream, session, tunnel_params)));
        self.next_state = ConnectState::HttpTunnelConnectComplete;
        Poll::Ready(Ok(()))
    }

    fn do_restart_with_auth(&mut self) -> Poll<Result<()>> {
        if self.transport_socket.is_none() {
            return Poll::Ready(Err(Error::UnexpectedState("restart without tunnel socket")));
        }
        self.reset_timer(TUNNEL_TIMEOUT);
        self.next_state = ConnectState::RestartWithAuthComplete;
        Poll::Ready(Ok(()))
    }

    fn do_restart_with_auth_complete(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(transport_socket) = self.transport_socket.as_mut() else {
            return Poll::Ready(Err(Error::UnexpectedState("restart without tunnel socket")));
        };
        let mut result = match transport_socket.poll_restart_with_auth(cx) {
            Poll::Pending => return self.wait(ConnectState::RestartWithAuthComplete),
            Poll::Ready(result) => result,
        };
        if result.is_ok() && !transport_socket.is_connected() {
            result = Err(Error::UnableToReuseConnectionForProxyAuth);
        }

        // Keep the auth state: the proxy may expect each leg of the
        // handshake on a separate connection.
        let mut reconnect = matches!(result, Err(Error::UnableToReuseConnectionForProxyAuth));

        // The proxy may have given up while credentials were collected.
        // Retry once, starting the auth scheme from scratch.
        if !self.has_restarted && matches!(&result, Err(err) if err.is_connection_closed()) {
            reconnect = true;
            self.has_restarted = true;
            if let Some(auth_controller) = &self.auth_controller {
                auth_controller.on_connection_closed();
            }
        }

        if reconnect {
            info!("Reconnecting to {} to send proxy credentials", self.params.proxy_scheme());
            self.transport_socket = None;
            self.next_state = ConnectState::BeginConnect;
            return Poll::Ready(Ok(()));
        }
        self.handle_tunnel_result(result, cx)
    }

    fn notify_auth(&mut self) -> JobEvent {
        // No timer while the caller gathers credentials.
        self.reset_timer(Duration::ZERO);
        let challenge = self.transport_socket.as_ref().and_then(|socket| {
            Some((socket.connect_response_info()?.clone(), socket.auth_controller()?.clone()))
        });
        let Some((response, auth_controller)) = challenge else {
            return self.complete(Err(Error::UnexpectedState("auth challenge without tunnel")));
        };
        info!("Proxy {} requested credentials ({})", self.params.proxy_scheme(), response.status);
        let (tx, rx) = oneshot::channel();
        self.auth = AuthWait::Waiting(rx);
        JobEvent::NeedsProxyAuth(AuthChallenge {
            response,
            auth_controller,
            restart: RestartWithAuth { tx },
        })
    }

    fn on_timed_out(&mut self) -> JobEvent {
        warn!(
            "Proxy connect job to {} timed out in {:?} after {:?}",
            self.params.endpoint(),
            self.next_state,
            self.elapsed()
        );
        self.nested_job = None;
        self.transport_socket = None;
        self.http2_stream_request = None;
        self.quic_session_request = None;
        self.quic_session = None;
        self.quic_stream_request = None;
        self.complete(Err(Error::TimedOut))
    }

    fn complete(&mut self, result: Result<()>) -> JobEvent {
        self.done = true;
        self.next_state = ConnectState::None;
        self.timer = None;
        self.auth = AuthWait::Idle;
        let result = result.and_then(|()| {
            self.socket.take().ok_or(Error::UnexpectedState("connect finished without socket"))
        });
        if let Err(err) = &result {
            debug!("Proxy connect job to {} failed: {}", self.params.endpoint(), err);
        }
        JobEvent::Complete(result)
    }
}

impl Stream for HttpProxyConnectJob {
    type Item = JobEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobEvent>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if !this.started {
            this.started = true;
            this.next_state = ConnectState::BeginConnect;
        }

        match mem::replace(&mut this.auth, AuthWait::Idle) {
            AuthWait::Idle => {}
            AuthWait::Notify => return Poll::Ready(Some(this.notify_auth())),
            AuthWait::Waiting(mut rx) => match Pin::new(&mut rx).poll(cx) {
                Poll::Pending => {
                    this.auth = AuthWait::Waiting(rx);
                    return Poll::Pending;
                }
                Poll::Ready(Ok(())) => this.next_state = ConnectState::RestartWithAuth,
                Poll::Ready(Err(_)) => {
                    debug!("Auth challenge abandoned");
                    return Poll::Ready(Some(this.complete(Err(Error::ProxyAuthRequested))));
                }
            },
        }

        match this.do_loop(cx) {
            Poll::Ready(result) => Poll::Ready(Some(this.complete(result))),
            Poll::Pending => {
                if let AuthWait::Idle = this.auth {
                    if let Some(timer) = this.timer.as_mut() {
                        if timer.as_mut().poll(cx).is_ready() {
                            return Poll::Ready(Some(this.on_timed_out()));
                        }
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl FusedStream for HttpProxyConnectJob {
    fn is_terminated(&self) -> bool {
        self.done
    }
}
