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

// # Proxy configuration strings
//
// `ProxyConfig::from_string` parses a proxy configuration string in
// the format `[scheme://][username:password@]host:port`, where scheme
// is one of `http` (the default), `https` and `quic`. The parsed
// config builds the `HttpProxySocketParams` of a connect job to any
// endpoint.
//
// Hostnames are kept as given; resolution happens when the job
// connects.

use crate::auth::AuthCredentials;
use crate::error::{Error, Result};
use crate::params::{
    HostPortPair, HttpProxySocketParams, NetworkIsolationKey, PrivacyMode, ProxyScheme,
    ProxyServer, SslSocketParams, TrafficAnnotationTag, TransportSocketParams,
};
use regex::Regex;

/// Proxy configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    pub scheme: ProxyScheme,
    pub host_port: HostPortPair,
    pub credentials: Option<AuthCredentials>,
}

impl ProxyConfig {
    /// Parses a proxy configuration string.
    ///
    /// `host` may be a name, an IPv4 address or an IPv6 address
    /// enclosed in square brackets (e.g. "[::1]").
    ///
    /// # Errors
    /// Returns `Error::MalformedConfigString` if the string is not in
    /// the expected format, `Error::InvalidPortNumber` if the port does
    /// not fit in 16 bits and `Error::UnsupportedProxyScheme` for other
    /// schemes.
    ///
    /// # Limitations
    /// * Usernames and passwords cannot contain `@` or `:`.
    pub fn from_string(config_string: &str) -> Result<ProxyConfig> {
        let re = Regex::new(r"^(?:(?P<scheme>\w+)://)?(?:(?P<user>\w+):(?P<pass>\w+)@)?(?P<host>(?:[\w\.-]+|\[[^\]]+\])):(?P<port>\d+)$")
            .map_err(|_| Error::MalformedConfigString)?;
        let caps = re.captures(config_string).ok_or(Error::MalformedConfigString)?;

        let scheme = match caps.name("scheme").map_or("http", |m| m.as_str()) {
            "http" => ProxyScheme::Http,
            "https" => ProxyScheme::Https,
            "quic" => ProxyScheme::Quic,
            other => return Err(Error::UnsupportedProxyScheme(other.to_string())),
        };
        let credentials = match (caps.name("user"), caps.name("pass")) {
            (Some(user), Some(pass)) => Some(AuthCredentials::new(user.as_str(), pass.as_str())),
            _ => None,
        };
        let host = caps.name("host").ok_or(Error::MalformedConfigString)?.as_str();
        let port = caps
            .name("port")
            .ok_or(Error::MalformedConfigString)?
            .as_str()
            .parse::<u16>()
            .map_err(|_| Error::InvalidPortNumber)?;

        Ok(ProxyConfig { scheme, host_port: HostPortPair::new(host, port), credentials })
    }

    pub fn proxy_server(&self) -> ProxyServer {
        ProxyServer::new(self.scheme, self.host_port.clone())
    }

    /// Params for a connect job to `endpoint` through this proxy.
    ///
    /// QUIC proxies always tunnel, so `tunnel` is forced on for them.
    pub fn socket_params(
        &self,
        endpoint: HostPortPair,
        tunnel: bool,
        traffic_annotation: TrafficAnnotationTag,
        network_isolation_key: NetworkIsolationKey,
    ) -> Result<HttpProxySocketParams> {
        let transport = TransportSocketParams::host_port(self.host_port.clone());
        let (transport_params, ssl_params) = match self.scheme {
            ProxyScheme::Http => (Some(transport), None),
            ProxyScheme::Https | ProxyScheme::Quic => {
                (None, Some(SslSocketParams::new(transport, PrivacyMode::Disabled, 0)))
            }
        };
        let is_quic = self.scheme == ProxyScheme::Quic;
        HttpProxySocketParams::new(
            transport_params,
            ssl_params,
            is_quic,
            endpoint,
            tunnel || is_quic,
            traffic_annotation,
            network_isolation_key,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_configuration_string_success() {
        let data = [
            ("127.0.0.1:8080", ProxyScheme::Http, HostPortPair::new("127.0.0.1", 8080), None),
            ("http://127.0.0.1:8080", ProxyScheme::Http, HostPortPair::new("127.0.0.1", 8080), None),
            (
                "https://proxy.example.com:443",
                ProxyScheme::Https,
                HostPortPair::new("proxy.example.com", 443),
                None,
            ),
            ("quic://[::1]:7000", ProxyScheme::Quic, HostPortPair::new("::1", 7000), None),
            (
                "user:pass@192.168.0.18:3128",
                ProxyScheme::Http,
                HostPortPair::new("192.168.0.18", 3128),
                Some(AuthCredentials::new("user", "pass")),
            ),
            ("[::1]:7000", ProxyScheme::Http, HostPortPair::new("::1", 7000), None),
        ];

        for (input, scheme, host_port, credentials) in data {
            let config = ProxyConfig::from_string(input)
                .unwrap_or_else(|err| panic!("Unexpected error {} for input: {}", err, input));
            assert_eq!(config.scheme, scheme, "For input: {}", input);
            assert_eq!(config.host_port, host_port, "For input: {}", input);
            assert_eq!(config.credentials, credentials, "For input: {}", input);
        }
    }

    #[test]
    fn parse_configuration_string_with_errors() {
        let data = [
            ("http://", Error::MalformedConfigString),
            ("", Error::MalformedConfigString),
            ("127.0.0.1:foo", Error::MalformedConfigString),
            ("127.0.0.1:-2", Error::MalformedConfigString),
            ("127.0.0.1:100000", Error::InvalidPortNumber),
            ("127.0.0.1", Error::MalformedConfigString),
            ("http:127.0.0.1:8080", Error::MalformedConfigString),
            ("::1:8080", Error::MalformedConfigString),
            ("user@pass:127.0.0.1:8080", Error::MalformedConfigString),
            ("user@127.0.0.1:8080", Error::MalformedConfigString),
            ("[::1}:7000", Error::MalformedConfigString),
            ("socks5://127.0.0.1:1080", Error::UnsupportedProxyScheme("socks5".to_string())),
        ];

        for (input, expected_error) in data {
            let result = ProxyConfig::from_string(input);
            assert_eq!(
                result.err().unwrap().to_string(),
                expected_error.to_string(),
                "Expected an error for input: {}",
                input
            );
        }
    }

    #[test]
    fn socket_params_per_scheme() {
        let endpoint = HostPortPair::new("www.example.org", 443);

        let http = ProxyConfig::from_string("proxy:3128").unwrap();
        let params = http
            .socket_params(endpoint.clone(), false, TrafficAnnotationTag(1), Default::default())
            .unwrap();
        assert_eq!(params.proxy_scheme(), ProxyScheme::Http);
        assert!(!params.tunnel());
        assert_eq!(params.destination().unwrap(), &HostPortPair::new("proxy", 3128));

        let https = ProxyConfig::from_string("https://proxy:443").unwrap();
        let params = https
            .socket_params(endpoint.clone(), true, TrafficAnnotationTag(1), Default::default())
            .unwrap();
        assert_eq!(params.proxy_scheme(), ProxyScheme::Https);
        assert!(params.ssl_params().is_some());

        let quic = ProxyConfig::from_string("quic://proxy:443").unwrap();
        let params = quic
            .socket_params(endpoint, false, TrafficAnnotationTag(1), Default::default())
            .unwrap();
        assert_eq!(params.proxy_scheme(), ProxyScheme::Quic);
        assert!(params.tunnel());
        assert_eq!(quic.proxy_server().to_string(), "quic://proxy:443");
    }
}
