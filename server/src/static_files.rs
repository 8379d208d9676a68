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

//! Static file responses.

use std::fs;

use tracing::debug;

use crate::config::StaticConfig;
use crate::response::Response;

/// Builds the full response for a static request path.
///
/// `/` is substituted with the configured index file. The resolved path must
/// stay under the configured root; `../` escapes resolve outside it and take
/// the 404 branch like any other missing file.
pub fn serve(path: &str, config: &StaticConfig) -> Vec<u8> {
    let path = if path == "/" {
        format!("/{}", config.index)
    } else {
        path.to_string()
    };

    let root = match config.root.canonicalize() {
        Ok(root) => root,
        Err(_) => return not_found(&path),
    };
    let full = match root.join(path.trim_start_matches('/')).canonicalize() {
        Ok(full) => full,
        Err(_) => return not_found(&path),
    };
    if !full.starts_with(&root) || !full.is_file() {
        return not_found(&path);
    }

    match fs::read(&full) {
        Ok(body) => {
            debug!(path = %path, bytes = body.len(), "serving static file");
            Response::new(200, "OK")
                .header("Content-Type", "text/html")
                .body(body)
                .into_bytes()
        }
        Err(_) => not_found(&path),
    }
}

fn not_found(path: &str) -> Vec<u8> {
    debug!(path = %path, "static file not found");
    Response::new(404, "Not Found")
        .header("Content-Type", "text/plain")
        .body(b"Not Found".to_vec())
        .into_bytes()
}

#[cfg(test)]
mod test {
    use super::serve;
    use crate::config::StaticConfig;
    use std::fs;

    fn config(root: &std::path::Path) -> StaticConfig {
        StaticConfig {
            root: root.to_path_buf(),
            index: "index.html".to_string(),
        }
    }

    #[test]
    fn root_path_serves_the_index_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<h1>hi</h1>").unwrap();

        let bytes = serve("/", &config(dir.path()));
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nContent-Length: 11\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.ends_with("<h1>hi</h1>"));
    }

    #[test]
    fn nested_file_is_served_by_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/page.html"), b"page").unwrap();

        let bytes = serve("/docs/page.html", &config(dir.path()));
        assert!(String::from_utf8_lossy(&bytes).starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn missing_file_is_the_literal_not_found_response() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = serve("/missing", &config(dir.path()));
        assert_eq!(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nContent-Type: text/plain\r\n\r\nNot Found"
                .as_slice(),
            bytes.as_slice()
        );
    }

    #[test]
    fn directory_paths_are_not_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        let bytes = serve("/docs", &config(dir.path()));
        assert!(String::from_utf8_lossy(&bytes).starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn traversal_out_of_the_root_is_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("www");
        fs::create_dir(&root).unwrap();
        fs::write(outer.path().join("secret.txt"), b"secret").unwrap();

        let bytes = serve("/../secret.txt", &config(&root));
        assert!(String::from_utf8_lossy(&bytes).starts_with("HTTP/1.1 404 Not Found\r\n"));
    }
}
