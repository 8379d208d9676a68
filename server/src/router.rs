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

//! Request routing: static root, proxy routes, or 405.

use parser::h1::RequestLine;
use tracing::warn;

use crate::config::{Config, ProxyRoute};
use crate::proxy;
use crate::response::Response;
use crate::static_files;

/// Where a request is dispatched.
#[derive(Debug)]
pub enum Route<'a> {
    /// Serve from the static root.
    Static,
    /// Forward to a proxy upstream.
    Proxy(&'a ProxyRoute),
    /// No handler for this method/path pair.
    MethodNotAllowed,
}

/// Applies the routing order: `GET /` is static, then proxy routes by
/// longest prefix, then any other `GET` is static, everything else is 405.
pub fn decide<'a>(method: &str, path: &str, routes: &'a [ProxyRoute]) -> Route<'a> {
    if method == "GET" && path == "/" {
        return Route::Static;
    }
    if let Some(route) = proxy::match_route(path, routes) {
        return Route::Proxy(route);
    }
    if method == "GET" {
        return Route::Static;
    }
    Route::MethodNotAllowed
}

/// Produces the full response bytes for one framed request.
///
/// `header_lines` are the raw lines after the start-line; `body` is
/// whatever followed the header terminator in the request buffer.
pub fn respond(
    request: &RequestLine,
    header_lines: &[String],
    body: &[u8],
    config: &Config,
) -> Vec<u8> {
    match decide(&request.method, &request.target, &config.proxy) {
        Route::Static => static_files::serve(&request.target, &config.static_files),
        Route::Proxy(route) => proxy::forward(request, header_lines, body, route),
        Route::MethodNotAllowed => {
            warn!(method = %request.method, target = %request.target, "method not allowed");
            Response::new(405, "Method Not Allowed").into_bytes()
        }
    }
}
