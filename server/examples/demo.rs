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

//! Runs a small instance without a config file: static files from `./www`,
//! `/api` proxied to a local upstream on port 9000.
//!
//! ```sh
//! cargo run --example demo
//! curl http://127.0.0.1:8080/
//! ```

use anyhow::Result;

use rapp::config::{Config, ProxyRoute, ServerConfig, StaticConfig};
use rapp::master::Master;

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let config = Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            workers: 2,
        },
        static_files: StaticConfig {
            root: "./www".into(),
            index: "index.html".to_string(),
        },
        proxy: vec![ProxyRoute {
            prefix: "/api".to_string(),
            upstream: "http://127.0.0.1:9000".to_string(),
        }],
    };

    Master::new(config)?.run()
}
