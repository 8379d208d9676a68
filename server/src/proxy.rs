// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Proxy responder: longest-prefix route matching and upstream forwarding.
//!
//! The upstream exchange is synchronous and stalls the worker for its
//! duration; the timeouts below bound that stall.

use core::fmt::Display;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use parser::h1::RequestLine;
use tracing::{debug, warn};

use crate::config::ProxyRoute;
use crate::response::Response;

/// Upstream connect/read/write timeout.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Represents possible failures while interpreting an upstream URL
#[derive(Debug, PartialEq, Eq)]
pub enum UpstreamError {
    /// The URL does not start with `http://`.
    Scheme,
    /// Empty host or unparseable port.
    Authority,
}

impl UpstreamError {
    fn description_str(&self) -> &'static str {
        match *self {
            UpstreamError::Scheme => "Upstream URL must start with http://",
            UpstreamError::Authority => "Upstream URL has an invalid host or port",
        }
    }
}

impl Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for UpstreamError {}

/// A parsed upstream authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Upstream {
    /// Parses an `http://host[:port]` base URL. The port defaults to 80.
    pub fn parse(url: &str) -> Result<Upstream, UpstreamError> {
        let rest = url
            .strip_prefix("http://")
            .ok_or(UpstreamError::Scheme)?
            .trim_end_matches('/');

        let (host, port) = match rest.split_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| UpstreamError::Authority)?),
            None => (rest, 80),
        };

        if host.is_empty() {
            return Err(UpstreamError::Authority);
        }

        Ok(Upstream {
            host: host.to_string(),
            port,
        })
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Picks the route with the longest matching prefix; ties go to the earlier
/// route in configuration order.
pub fn match_route<'a>(path: &str, routes: &'a [ProxyRoute]) -> Option<&'a ProxyRoute> {
    let mut best: Option<&ProxyRoute> = None;
    for route in routes {
        if path.starts_with(&route.prefix) {
            match best {
                Some(found) if found.prefix.len() >= route.prefix.len() => {}
                _ => best = Some(route),
            }
        }
    }
    best
}

/// Forwards a request to the matched route's upstream and returns the
/// response bytes verbatim.
///
/// The upstream request carries the original target and headers, with
/// `Host` rewritten to the upstream authority and `Connection: close`
/// forced so the response is complete at EOF. Any failure along the way
/// becomes a locally built `502 Bad Gateway`.
pub fn forward(
    request: &RequestLine,
    header_lines: &[String],
    body: &[u8],
    route: &ProxyRoute,
) -> Vec<u8> {
    let upstream = match Upstream::parse(&route.upstream) {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(upstream = %route.upstream, %err, "unusable upstream");
            return bad_gateway();
        }
    };

    match exchange(request, header_lines, body, &upstream) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => {
            warn!(upstream = %upstream.authority(), "upstream closed without a response");
            bad_gateway()
        }
        Err(err) => {
            warn!(upstream = %upstream.authority(), %err, "upstream exchange failed");
            bad_gateway()
        }
    }
}

fn exchange(
    request: &RequestLine,
    header_lines: &[String],
    body: &[u8],
    upstream: &Upstream,
) -> io::Result<Vec<u8>> {
    let addr = upstream
        .authority()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "upstream did not resolve"))?;

    let mut stream = TcpStream::connect_timeout(&addr, UPSTREAM_TIMEOUT)?;
    stream.set_read_timeout(Some(UPSTREAM_TIMEOUT))?;
    stream.set_write_timeout(Some(UPSTREAM_TIMEOUT))?;

    stream.write_all(&build_request(request, header_lines, body, upstream))?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    debug!(
        upstream = %upstream.authority(),
        bytes = response.len(),
        "upstream response relayed"
    );
    Ok(response)
}

fn build_request(
    request: &RequestLine,
    header_lines: &[String],
    body: &[u8],
    upstream: &Upstream,
) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, request.target);
    for line in header_lines {
        // The blank line ends the header block; anything past it is body.
        if line.is_empty() {
            break;
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("host:") || lower.starts_with("connection:") {
            continue;
        }
        head.push_str(line);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Host: {}\r\n", upstream.authority()));
    head.push_str("Connection: close\r\n\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

fn bad_gateway() -> Vec<u8> {
    Response::new(502, "Bad Gateway")
        .header("Content-Type", "text/plain")
        .body(b"Bad Gateway".to_vec())
        .into_bytes()
}
