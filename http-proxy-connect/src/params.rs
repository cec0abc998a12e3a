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

// # Socket params
//
// Immutable per-attempt configuration handed to an
// `HttpProxyConnectJob`, and the small value types that describe
// where the proxy lives and how to reach it.

use crate::error::{Error, Result};
use http::Uri;
use std::fmt;

/// A host (name or literal address) and port without a scheme.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct HostPortPair {
    host: String,
    port: u16,
}

impl HostPortPair {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        // Store IPv6 literals without brackets, add them back in Display.
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        HostPortPair { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Builds `scheme://host:port`.
    pub fn to_uri(&self, scheme: &str) -> Result<Uri> {
        format!("{}://{}", scheme, self).parse::<Uri>().map_err(|_| Error::InvalidParams("host"))
    }
}

impl fmt::Display for HostPortPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A destination qualified with a URL scheme.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SchemeHostPort {
    pub scheme: String,
    pub host_port: HostPortPair,
}

/// Where a transport connects to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportDestination {
    HostPort(HostPortPair),
    /// Not accepted for proxy destinations yet, see
    /// `HttpProxySocketParams::new`.
    SchemeHostPort(SchemeHostPort),
}

impl TransportDestination {
    fn host_port(&self) -> Option<&HostPortPair> {
        match self {
            TransportDestination::HostPort(host_port) => Some(host_port),
            TransportDestination::SchemeHostPort(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SecureDnsPolicy {
    #[default]
    Allow,
    Disable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrivacyMode {
    #[default]
    Disabled,
    Enabled,
}

/// Opaque partition key; sessions and cached credentials are never
/// shared across different keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NetworkIsolationKey(pub String);

/// Identifies the purpose of the traffic for auditing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TrafficAnnotationTag(pub u32);

/// Tag applied to sockets for per-owner accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SocketTag {
    pub uid: Option<u32>,
    pub tag: u32,
}

/// Parameters for a plain TCP connection to the proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportSocketParams {
    destination: TransportDestination,
    secure_dns_policy: SecureDnsPolicy,
}

impl TransportSocketParams {
    pub fn new(destination: TransportDestination, secure_dns_policy: SecureDnsPolicy) -> Self {
        TransportSocketParams { destination, secure_dns_policy }
    }

    pub fn host_port(host_port: HostPortPair) -> Self {
        Self::new(TransportDestination::HostPort(host_port), SecureDnsPolicy::default())
    }

    pub fn destination(&self) -> &TransportDestination {
        &self.destination
    }

    pub fn secure_dns_policy(&self) -> SecureDnsPolicy {
        self.secure_dns_policy
    }
}

/// Parameters for a TLS connection made directly to the proxy. Proxy
/// connections are never layered on top of another proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SslSocketParams {
    direct: TransportSocketParams,
    privacy_mode: PrivacyMode,
    cert_verify_flags: u32,
}

impl SslSocketParams {
    pub fn new(
        direct: TransportSocketParams,
        privacy_mode: PrivacyMode,
        cert_verify_flags: u32,
    ) -> Self {
        SslSocketParams { direct, privacy_mode, cert_verify_flags }
    }

    pub fn direct_connection_params(&self) -> &TransportSocketParams {
        &self.direct
    }

    pub fn privacy_mode(&self) -> PrivacyMode {
        self.privacy_mode
    }

    pub fn cert_verify_flags(&self) -> u32 {
        self.cert_verify_flags
    }
}

/// The proxy transport variant, derived once from the params.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    Http,
    Https,
    Quic,
}

impl ProxyScheme {
    pub fn is_secure(self) -> bool {
        self != ProxyScheme::Http
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProxyScheme::Http => write!(f, "http"),
            ProxyScheme::Https => write!(f, "https"),
            ProxyScheme::Quic => write!(f, "quic"),
        }
    }
}

/// A proxy and the scheme used to talk to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyServer {
    pub scheme: ProxyScheme,
    pub host_port: HostPortPair,
}

impl ProxyServer {
    pub fn new(scheme: ProxyScheme, host_port: HostPortPair) -> Self {
        ProxyServer { scheme, host_port }
    }
}

impl fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host_port)
    }
}

/// Key under which HTTP/2 sessions to a proxy are pooled.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpdySessionKey {
    pub host_port: HostPortPair,
    pub privacy_mode: PrivacyMode,
    pub is_proxy_session: bool,
    pub socket_tag: SocketTag,
    pub network_isolation_key: NetworkIsolationKey,
    pub secure_dns_policy: SecureDnsPolicy,
}

/// Immutable configuration of one proxy connect attempt.
#[derive(Clone, Debug)]
pub struct HttpProxySocketParams {
    transport_params: Option<TransportSocketParams>,
    ssl_params: Option<SslSocketParams>,
    is_quic: bool,
    endpoint: HostPortPair,
    tunnel: bool,
    traffic_annotation: TrafficAnnotationTag,
    network_isolation_key: NetworkIsolationKey,
}

impl HttpProxySocketParams {
    /// Validates and builds the params.
    ///
    /// # Errors
    /// Returns `Error::InvalidParams` unless exactly one of
    /// `transport_params` and `ssl_params` is set, when `is_quic` is set
    /// without `ssl_params` or without `tunnel`, or when the proxy
    /// destination carries a scheme.
    ///
    /// # Limitations
    /// * Proxy destinations with a scheme are not supported yet.
    pub fn new(
        transport_params: Option<TransportSocketParams>,
        ssl_params: Option<SslSocketParams>,
        is_quic: bool,
        endpoint: HostPortPair,
        tunnel: bool,
        traffic_annotation: TrafficAnnotationTag,
        network_isolation_key: NetworkIsolationKey,
    ) -> Result<Self> {
        let direct = match (&transport_params, &ssl_params) {
            (Some(transport), None) => transport,
            (None, Some(ssl)) => ssl.direct_connection_params(),
            (None, None) => return Err(Error::InvalidParams("no proxy transport")),
            (Some(_), Some(_)) => return Err(Error::InvalidParams("two proxy transports")),
        };
        if is_quic && ssl_params.is_none() {
            return Err(Error::InvalidParams("QUIC proxy without TLS params"));
        }
        if is_quic && !tunnel {
            return Err(Error::InvalidParams("QUIC proxy without tunnel"));
        }
        if direct.destination().host_port().is_none() {
            return Err(Error::InvalidParams("proxy destination with scheme"));
        }
        Ok(HttpProxySocketParams {
            transport_params,
            ssl_params,
            is_quic,
            endpoint,
            tunnel,
            traffic_annotation,
            network_isolation_key,
        })
    }

    pub fn transport_params(&self) -> Option<&TransportSocketParams> {
        self.transport_params.as_ref()
    }

    pub fn ssl_params(&self) -> Option<&SslSocketParams> {
        self.ssl_params.as_ref()
    }

    pub fn is_quic(&self) -> bool {
        self.is_quic
    }

    pub fn endpoint(&self) -> &HostPortPair {
        &self.endpoint
    }

    pub fn tunnel(&self) -> bool {
        self.tunnel
    }

    pub fn traffic_annotation(&self) -> TrafficAnnotationTag {
        self.traffic_annotation
    }

    pub fn network_isolation_key(&self) -> &NetworkIsolationKey {
        &self.network_isolation_key
    }

    pub fn proxy_scheme(&self) -> ProxyScheme {
        if self.is_quic {
            ProxyScheme::Quic
        } else if self.transport_params.is_some() {
            ProxyScheme::Http
        } else {
            ProxyScheme::Https
        }
    }

    fn direct_connection_params(&self) -> Option<&TransportSocketParams> {
        self.transport_params
            .as_ref()
            .or_else(|| self.ssl_params.as_ref().map(|ssl| ssl.direct_connection_params()))
    }

    /// The proxy's own host and port.
    pub fn destination(&self) -> Result<&HostPortPair> {
        self.direct_connection_params()
            .and_then(|params| params.destination().host_port())
            .ok_or(Error::UnexpectedState("proxy destination"))
    }

    pub fn proxy_server(&self) -> Result<ProxyServer> {
        Ok(ProxyServer::new(self.proxy_scheme(), self.destination()?.clone()))
    }

    pub fn secure_dns_policy(&self) -> SecureDnsPolicy {
        self.direct_connection_params().map(|params| params.secure_dns_policy()).unwrap_or_default()
    }

    pub fn spdy_session_key(&self, socket_tag: SocketTag) -> Result<SpdySessionKey> {
        Ok(SpdySessionKey {
            host_port: self.destination()?.clone(),
            privacy_mode: PrivacyMode::Disabled,
            is_proxy_session: true,
            socket_tag,
            network_isolation_key: self.network_isolation_key.clone(),
            secure_dns_policy: self.secure_dns_policy(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> HostPortPair {
        HostPortPair::new("proxy.example.com", 443)
    }

    fn endpoint() -> HostPortPair {
        HostPortPair::new("www.example.org", 443)
    }

    fn ssl() -> SslSocketParams {
        SslSocketParams::new(TransportSocketParams::host_port(proxy()), PrivacyMode::Disabled, 0)
    }

    fn build(
        transport: Option<TransportSocketParams>,
        ssl: Option<SslSocketParams>,
        is_quic: bool,
        tunnel: bool,
    ) -> Result<HttpProxySocketParams> {
        HttpProxySocketParams::new(
            transport,
            ssl,
            is_quic,
            endpoint(),
            tunnel,
            TrafficAnnotationTag::default(),
            NetworkIsolationKey::default(),
        )
    }

    #[test]
    fn exactly_one_transport_descriptor() {
        assert!(build(None, None, false, true).is_err());
        assert!(build(Some(TransportSocketParams::host_port(proxy())), Some(ssl()), false, true)
            .is_err());
        assert!(build(Some(TransportSocketParams::host_port(proxy())), None, false, true).is_ok());
        assert!(build(None, Some(ssl()), false, true).is_ok());
    }

    #[test]
    fn quic_requires_ssl_and_tunnel() {
        assert!(build(Some(TransportSocketParams::host_port(proxy())), None, true, true).is_err());
        assert!(build(None, Some(ssl()), true, false).is_err());
        let params = build(None, Some(ssl()), true, true).unwrap();
        assert_eq!(params.proxy_scheme(), ProxyScheme::Quic);
    }

    #[test]
    fn scheme_qualified_destination_rejected() {
        let destination = TransportDestination::SchemeHostPort(SchemeHostPort {
            scheme: "https".into(),
            host_port: proxy(),
        });
        let transport = TransportSocketParams::new(destination, SecureDnsPolicy::Allow);
        let err = build(Some(transport), None, false, true).unwrap_err();
        assert_eq!(err.to_string(), "Invalid socket params: proxy destination with scheme");
    }

    #[test]
    fn proxy_scheme_and_destination() {
        let params = build(Some(TransportSocketParams::host_port(proxy())), None, false, false)
            .unwrap();
        assert_eq!(params.proxy_scheme(), ProxyScheme::Http);
        assert_eq!(params.destination().unwrap(), &proxy());
        assert_eq!(params.proxy_server().unwrap().to_string(), "http://proxy.example.com:443");

        let params = build(None, Some(ssl()), false, true).unwrap();
        assert_eq!(params.proxy_scheme(), ProxyScheme::Https);
        let key = params.spdy_session_key(SocketTag::default()).unwrap();
        assert!(key.is_proxy_session);
        assert_eq!(key.host_port, proxy());
    }

    #[test]
    fn host_port_display_brackets_ipv6() {
        assert_eq!(HostPortPair::new("[::1]", 8080).to_string(), "[::1]:8080");
        assert_eq!(HostPortPair::new("::1", 8080).host(), "::1");
        let uri = HostPortPair::new("::1", 8080).to_uri("https").unwrap();
        assert_eq!(uri.scheme_str(), Some("https"));
        assert_eq!(uri.port_u16(), Some(8080));
    }
}
