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

// # Proxy authentication
//
// An `HttpAuthController` owns the credential state for one proxy
// across the retries of a connect job. The tunnel sockets ask it for
// the `Proxy-Authorization` value and hand it every 407 challenge;
// the connect job only surfaces it to the caller and tells it when a
// connection carrying auth state was closed.
//
// `BasicAuthController` implements the Basic scheme on top of a
// shared `HttpAuthCache`.

use crate::error::{Error, Result};
use crate::params::NetworkIsolationKey;
use crate::socket::HttpResponseInfo;
use base64::{engine::general_purpose, Engine as _};
use http::header::{PROXY_AUTHENTICATE, WWW_AUTHENTICATE};
use http::Uri;
use log::{debug, info};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Who is asking for credentials.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HttpAuthTarget {
    Proxy,
    Server,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AuthCredentials {
    username: String,
    password: String,
}

impl AuthCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        AuthCredentials { username: username.into(), password: password.into() }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

// Keep passwords out of logs.
impl fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthCredentials").field("username", &self.username).finish()
    }
}

/// A challenge as shown to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthChallengeInfo {
    pub is_proxy: bool,
    pub challenger: String,
    pub scheme: String,
    pub realm: String,
}

/// Credential state for one proxy (or server) destination.
pub trait HttpAuthController: Send + Sync {
    /// Records a 401/407 challenge.
    ///
    /// # Errors
    /// `Error::UnsupportedAuthScheme` when no offered scheme can be
    /// answered.
    fn handle_auth_challenge(&self, response: &HttpResponseInfo) -> Result<()>;

    /// Value for the `Proxy-Authorization` header of the next request.
    fn auth_header(&self) -> Option<String>;

    /// True when credentials are ready to be sent.
    fn have_auth(&self) -> bool;

    /// Supplies (or clears) the credentials for the pending challenge.
    fn reset_auth(&self, credentials: Option<AuthCredentials>);

    /// The connection that carried the auth exchange is gone.
    fn on_connection_closed(&self);

    fn challenge(&self) -> Option<AuthChallengeInfo>;
}

/// Creates controllers; one per connect job.
pub trait HttpAuthControllerFactory: Send + Sync {
    fn create(
        &self,
        target: HttpAuthTarget,
        url: Uri,
        network_isolation_key: NetworkIsolationKey,
    ) -> Arc<dyn HttpAuthController>;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    origin: String,
    realm: String,
    network_isolation_key: NetworkIsolationKey,
}

/// Credentials shared by all connect jobs, keyed by origin, realm and
/// isolation key.
#[derive(Default)]
pub struct HttpAuthCache {
    entries: Mutex<HashMap<CacheKey, AuthCredentials>>,
}

impl HttpAuthCache {
    pub fn new() -> Self {
        HttpAuthCache::default()
    }

    fn lock(&self) -> MutexGuard<HashMap<CacheKey, AuthCredentials>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(
        &self,
        origin: &str,
        realm: &str,
        key: &NetworkIsolationKey,
        credentials: AuthCredentials,
    ) {
        let cache_key = CacheKey {
            origin: origin.to_string(),
            realm: realm.to_string(),
            network_isolation_key: key.clone(),
        };
        self.lock().insert(cache_key, credentials);
    }

    pub fn lookup(
        &self,
        origin: &str,
        realm: &str,
        key: &NetworkIsolationKey,
    ) -> Option<AuthCredentials> {
        let cache_key = CacheKey {
            origin: origin.to_string(),
            realm: realm.to_string(),
            network_isolation_key: key.clone(),
        };
        self.lock().get(&cache_key).cloned()
    }

    /// Any credentials for `origin`, used preemptively before a
    /// challenge is seen on a new connection.
    pub fn lookup_by_origin(
        &self,
        origin: &str,
        key: &NetworkIsolationKey,
    ) -> Option<AuthCredentials> {
        self.lock()
            .iter()
            .find(|(k, _)| k.origin == origin && &k.network_isolation_key == key)
            .map(|(_, credentials)| credentials.clone())
    }

    pub fn remove(&self, origin: &str, realm: &str, key: &NetworkIsolationKey) -> bool {
        let cache_key = CacheKey {
            origin: origin.to_string(),
            realm: realm.to_string(),
            network_isolation_key: key.clone(),
        };
        self.lock().remove(&cache_key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory for `BasicAuthController`s sharing one cache.
#[derive(Clone, Default)]
pub struct BasicAuthControllerFactory {
    cache: Arc<HttpAuthCache>,
}

impl BasicAuthControllerFactory {
    pub fn new(cache: Arc<HttpAuthCache>) -> Self {
        BasicAuthControllerFactory { cache }
    }

    pub fn cache(&self) -> &Arc<HttpAuthCache> {
        &self.cache
    }
}

impl HttpAuthControllerFactory for BasicAuthControllerFactory {
    fn create(
        &self,
        target: HttpAuthTarget,
        url: Uri,
        network_isolation_key: NetworkIsolationKey,
    ) -> Arc<dyn HttpAuthController> {
        Arc::new(BasicAuthController::new(target, &url, network_isolation_key, self.cache.clone()))
    }
}

#[derive(Default)]
struct BasicState {
    realm: Option<String>,
    identity: Option<AuthCredentials>,
    identity_sent: bool,
}

/// Answers Basic challenges.
pub struct BasicAuthController {
    target: HttpAuthTarget,
    origin: String,
    network_isolation_key: NetworkIsolationKey,
    cache: Arc<HttpAuthCache>,
    state: Mutex<BasicState>,
}

impl BasicAuthController {
    pub fn new(
        target: HttpAuthTarget,
        url: &Uri,
        network_isolation_key: NetworkIsolationKey,
        cache: Arc<HttpAuthCache>,
    ) -> Self {
        let origin = match (url.scheme_str(), url.authority()) {
            (Some(scheme), Some(authority)) => format!("{}://{}", scheme, authority),
            _ => url.to_string(),
        };
        BasicAuthController {
            target,
            origin,
            network_isolation_key,
            cache,
            state: Mutex::new(BasicState::default()),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn lock(&self) -> MutexGuard<BasicState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn encode_basic(credentials: &AuthCredentials) -> String {
    let token = general_purpose::STANDARD
        .encode(format!("{}:{}", credentials.username, credentials.password).as_bytes());
    format!("Basic {}", token)
}

/// Returns the realm of the first Basic challenge in `response`.
fn parse_basic_realm(target: HttpAuthTarget, response: &HttpResponseInfo) -> Option<String> {
    let header = match target {
        HttpAuthTarget::Proxy => PROXY_AUTHENTICATE,
        HttpAuthTarget::Server => WWW_AUTHENTICATE,
    };
    let re = Regex::new(r#"(?i)realm\s*=\s*(?:"(?P<quoted>[^"]*)"|(?P<token>[^\s,]+))"#).ok()?;
    response.headers.get_all(header).iter().filter_map(|value| value.to_str().ok()).find_map(
        |challenge| {
            let challenge = challenge.trim();
            let (scheme, params) = challenge.split_once(' ').unwrap_or((challenge, ""));
            if !scheme.eq_ignore_ascii_case("basic") {
                return None;
            }
            let realm = re
                .captures(params)
                .and_then(|caps| caps.name("quoted").or_else(|| caps.name("token")))
                .map_or_else(String::new, |m| m.as_str().to_string());
            Some(realm)
        },
    )
}

impl HttpAuthController for BasicAuthController {
    fn handle_auth_challenge(&self, response: &HttpResponseInfo) -> Result<()> {
        let realm =
            parse_basic_realm(self.target, response).ok_or(Error::UnsupportedAuthScheme)?;
        let mut state = self.lock();
        if state.identity_sent {
            if let Some(rejected) = state.identity.take() {
                info!("Credentials for {} rejected by {}", rejected.username, self.origin);
                self.cache.remove(&self.origin, &realm, &self.network_isolation_key);
            }
        }
        state.identity_sent = false;
        if state.identity.is_none() {
            state.identity = self.cache.lookup(&self.origin, &realm, &self.network_isolation_key);
        }
        debug!("Basic challenge from {} realm {:?}", self.origin, realm);
        state.realm = Some(realm);
        Ok(())
    }

    fn auth_header(&self) -> Option<String> {
        let mut state = self.lock();
        if state.identity.is_none() {
            state.identity =
                self.cache.lookup_by_origin(&self.origin, &self.network_isolation_key);
        }
        let header = state.identity.as_ref().map(encode_basic)?;
        state.identity_sent = true;
        Some(header)
    }

    fn have_auth(&self) -> bool {
        self.lock().identity.is_some()
    }

    fn reset_auth(&self, credentials: Option<AuthCredentials>) {
        let mut state = self.lock();
        if let (Some(credentials), Some(realm)) = (&credentials, &state.realm) {
            self.cache.add(&self.origin, realm, &self.network_isolation_key, credentials.clone());
        }
        state.identity = credentials;
        state.identity_sent = false;
    }

    fn on_connection_closed(&self) {
        let mut state = self.lock();
        state.realm = None;
        state.identity_sent = false;
    }

    fn challenge(&self) -> Option<AuthChallengeInfo> {
        self.lock().realm.as_ref().map(|realm| AuthChallengeInfo {
            is_proxy: self.target == HttpAuthTarget::Proxy,
            challenger: self.origin.clone(),
            scheme: "basic".to_string(),
            realm: realm.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, StatusCode};

    fn challenge(value: &'static str) -> HttpResponseInfo {
        let mut response = HttpResponseInfo::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        response.headers.append(PROXY_AUTHENTICATE, HeaderValue::from_static(value));
        response
    }

    fn controller(cache: &Arc<HttpAuthCache>) -> Arc<dyn HttpAuthController> {
        BasicAuthControllerFactory::new(cache.clone()).create(
            HttpAuthTarget::Proxy,
            "https://proxy.example.com:443".parse().unwrap(),
            NetworkIsolationKey::default(),
        )
    }

    #[test]
    fn test_basic_header_encoding() {
        let credentials = AuthCredentials::new("user", "password");
        assert_eq!(encode_basic(&credentials), "Basic dXNlcjpwYXNzd29yZA==");
    }

    #[test]
    fn test_debug_hides_password() {
        let credentials = AuthCredentials::new("user", "hunter2");
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }

    #[test]
    fn test_challenge_then_credentials() {
        let cache = Arc::new(HttpAuthCache::new());
        let auth = controller(&cache);
        assert!(auth.auth_header().is_none());

        auth.handle_auth_challenge(&challenge("Basic realm=\"MyRealm1\"")).unwrap();
        assert!(!auth.have_auth());
        let info = auth.challenge().unwrap();
        assert_eq!(info.realm, "MyRealm1");
        assert!(info.is_proxy);
        assert_eq!(info.challenger, "https://proxy.example.com:443");

        auth.reset_auth(Some(AuthCredentials::new("user", "password")));
        assert!(auth.have_auth());
        assert_eq!(auth.auth_header().unwrap(), "Basic dXNlcjpwYXNzd29yZA==");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cached_credentials_reused_by_new_controller() {
        let cache = Arc::new(HttpAuthCache::new());
        let first = controller(&cache);
        first.handle_auth_challenge(&challenge("Basic realm=proxy")).unwrap();
        first.reset_auth(Some(AuthCredentials::new("user", "password")));

        let second = controller(&cache);
        assert_eq!(second.auth_header().unwrap(), "Basic dXNlcjpwYXNzd29yZA==");
    }

    #[test]
    fn test_rejected_credentials_evicted() {
        let cache = Arc::new(HttpAuthCache::new());
        let auth = controller(&cache);
        auth.handle_auth_challenge(&challenge("Basic realm=proxy")).unwrap();
        auth.reset_auth(Some(AuthCredentials::new("user", "wrong")));
        assert!(auth.auth_header().is_some());

        auth.handle_auth_challenge(&challenge("Basic realm=proxy")).unwrap();
        assert!(!auth.have_auth());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unsupported_scheme() {
        let cache = Arc::new(HttpAuthCache::new());
        let auth = controller(&cache);
        let err = auth.handle_auth_challenge(&challenge("Negotiate")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAuthScheme));
    }

    #[test]
    fn test_connection_closed_keeps_identity() {
        let cache = Arc::new(HttpAuthCache::new());
        let auth = controller(&cache);
        auth.handle_auth_challenge(&challenge("Basic realm=proxy")).unwrap();
        auth.reset_auth(Some(AuthCredentials::new("user", "password")));
        auth.on_connection_closed();
        assert!(auth.challenge().is_none());
        assert!(auth.have_auth());
    }
}
