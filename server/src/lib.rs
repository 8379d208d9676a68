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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! rapp is a prefork HTTP/1.1 reverse proxy and static file server.
//!
//! A master process owns the listening socket and hands each accepted
//! connection's descriptor to one of N forked workers over a Unix-domain
//! control channel, keeping clients from the same IP on the same worker.
//! Each worker multiplexes its connections with a non-blocking readiness
//! loop, serving files from a static root or forwarding to an upstream
//! matched by longest-prefix route.

pub mod affinity;
pub mod config;
pub mod connection;
pub mod fdpass;
pub mod master;
pub mod proxy;
pub mod response;
pub mod router;
pub mod static_files;
pub mod worker;
