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

//! Providers of multiplexed sessions to a proxy.
//!
//! The HTTP/2 session pool and the QUIC stream factory are shared by
//! every connect job and synchronize internally. A connect job only
//! looks sessions up and requests streams from them.

use crate::error::Result;
use crate::nested::ConnectTiming;
use crate::params::{
    HostPortPair, NetworkIsolationKey, PrivacyMode, SecureDnsPolicy, SocketTag, SpdySessionKey,
    TrafficAnnotationTag,
};
use crate::socket::{ProxyStream, RequestPriority, StreamSocket};
use futures::future::BoxFuture;
use http::Uri;
use std::sync::Arc;

/// An established HTTP/2 session to a proxy.
pub trait Http2Session: Send + Sync {
    /// Opens a bidirectional stream on the session.
    fn request_stream(
        &self,
        url: Uri,
        priority: RequestPriority,
        socket_tag: SocketTag,
        traffic_annotation: TrafficAnnotationTag,
    ) -> BoxFuture<'static, Result<Box<dyn ProxyStream>>>;
}

pub trait Http2SessionPool: Send + Sync {
    fn find_available_session(
        &self,
        key: &SpdySessionKey,
        enable_ip_based_pooling: bool,
        is_websocket: bool,
    ) -> Option<Arc<dyn Http2Session>>;

    /// Takes ownership of `socket` and makes it available to others
    /// under `key`.
    fn create_available_session_from_socket(
        &self,
        key: &SpdySessionKey,
        socket: Box<dyn StreamSocket>,
        connect_timing: ConnectTiming,
    ) -> Result<Arc<dyn Http2Session>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QuicVersion(pub u32);

/// Everything needed to find or create a QUIC session to a proxy.
#[derive(Clone, Debug)]
pub struct QuicSessionRequest {
    pub scheme: &'static str,
    pub destination: HostPortPair,
    pub version: QuicVersion,
    pub privacy_mode: PrivacyMode,
    pub priority: RequestPriority,
    pub socket_tag: SocketTag,
    pub network_isolation_key: NetworkIsolationKey,
    pub secure_dns_policy: SecureDnsPolicy,
    pub cert_verify_flags: u32,
    pub url: Uri,
}

/// Handle to a QUIC session that can open one request stream.
pub trait QuicSessionHandle: Send {
    fn request_stream(
        &mut self,
        requires_confirmation: bool,
        traffic_annotation: TrafficAnnotationTag,
    ) -> BoxFuture<'static, Result<Box<dyn ProxyStream>>>;
}

pub trait QuicStreamFactory: Send + Sync {
    fn request(
        &self,
        request: QuicSessionRequest,
    ) -> BoxFuture<'static, Result<Box<dyn QuicSessionHandle>>>;
}
