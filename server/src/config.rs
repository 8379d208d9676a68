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

//! Runtime configuration, read once at startup and immutable afterwards.

use std::{fs, net::SocketAddr, path::PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::proxy::Upstream;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listener and worker-pool settings.
    pub server: ServerConfig,
    /// Static file serving settings.
    #[serde(rename = "static")]
    pub static_files: StaticConfig,
    /// Proxy routes, matched by longest prefix.
    #[serde(default)]
    pub proxy: Vec<ProxyRoute>,
}

/// Listener and worker-pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the listening socket binds.
    pub host: String,
    /// Port the listening socket binds.
    pub port: u16,
    /// Number of worker processes to prefork.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Static file serving settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    /// Directory request paths resolve under.
    pub root: PathBuf,
    /// File served for the bare `/` path.
    #[serde(default = "default_index")]
    pub index: String,
}

/// A single proxy route.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRoute {
    /// Path prefix this route matches.
    pub prefix: String,
    /// Upstream base URL, e.g. `http://127.0.0.1:9000`.
    pub upstream: String,
}

impl Config {
    /// Loads and validates the configuration file.
    pub fn load(path: &str) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// The socket address the listener binds.
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid listen address {}:{}",
                    self.server.host, self.server.port
                )
            })
    }

    fn validate(&self) -> Result<()> {
        if self.server.workers == 0 {
            bail!("server.workers must be at least 1");
        }
        self.addr()?;
        for route in &self.proxy {
            if !route.prefix.starts_with('/') {
                bail!("proxy prefix {:?} must start with '/'", route.prefix);
            }
            Upstream::parse(&route.upstream)
                .with_context(|| format!("invalid upstream {:?}", route.upstream))?;
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    2
}

fn default_index() -> String {
    "index.html".to_string()
}
