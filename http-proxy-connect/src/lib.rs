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

//! # HTTP Proxy Connect
//!
//! This crate establishes connections to a destination endpoint
//! through a forward proxy. Three kinds of proxies are supported:
//! plain HTTP proxies, HTTPS proxies speaking HTTP/1.1 or HTTP/2, and
//! QUIC proxies.
//!
//! The main component of this crate is `HttpProxyConnectJob`, a
//! `Stream` of `JobEvent`s that connects to the proxy, negotiates a
//! CONNECT tunnel when asked to, and reports proxy authentication
//! challenges to its caller before completing with a `ProxySocket`.
//!
//! TLS handshakes, HTTP/2 sessions and QUIC sessions are provided by
//! the caller through the `ConnectJobFactory`, `Http2SessionPool` and
//! `QuicStreamFactory` traits. Plain TCP connections and Basic proxy
//! authentication work out of the box.
//!
//! ## Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use http_proxy_connect::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ProxyConfig::from_string("127.0.0.1:3128")?;
//!     let params = config.socket_params(
//!         HostPortPair::new("www.example.org", 443),
//!         true,
//!         TrafficAnnotationTag::default(),
//!         NetworkIsolationKey::default(),
//!     )?;
//!     let mut job = HttpProxyConnectJob::new(
//!         params,
//!         CommonConnectJobParams::default(),
//!         RequestPriority::DEFAULT,
//!         SocketTag::default(),
//!     )?;
//!     while let Some(event) = job.next().await {
//!         match event {
//!             JobEvent::NeedsProxyAuth(challenge) => {
//!                 challenge.auth_controller.reset_auth(config.credentials.clone());
//!                 challenge.restart.restart();
//!             }
//!             JobEvent::Complete(socket) => {
//!                 let _socket = socket?;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Limitations
//!
//! * Proxy destinations qualified with a scheme are rejected.
//! * Usernames and passwords in configuration strings cannot contain
//!   `@` or `:`.

mod auth;
mod config;
mod error;
mod job;
mod nested;
mod params;
mod session;
mod socket;
mod timeout;
mod tunnel;

pub use auth::*;
pub use config::*;
pub use error::{Error, Result};
pub use job::*;
pub use nested::*;
pub use params::*;
pub use session::*;
pub use socket::*;
pub use timeout::*;
pub use tunnel::*;
