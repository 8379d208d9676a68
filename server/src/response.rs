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

//! HTTP/1.1 response serialization.
//!
//! Responses are always `Content-Length` framed; chunked encoding is not
//! produced anywhere in this server.

/// A response under construction.
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: &'static str,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Response {
    /// Creates a response with the given status line.
    pub fn new(status: u16, reason: &'static str) -> Self {
        Response {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Appends a header. `Content-Length` is emitted automatically and must
    /// not be set here.
    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Serializes the status line, headers and body to wire bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n",
            self.status,
            self.reason,
            self.body.len()
        );
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

#[cfg(test)]
mod test {
    use super::Response;

    #[test]
    fn method_not_allowed_matches_wire_literal() {
        let bytes = Response::new(405, "Method Not Allowed").into_bytes();
        assert_eq!(
            b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n".as_slice(),
            bytes.as_slice()
        );
    }

    #[test]
    fn not_found_carries_body_and_content_type() {
        let bytes = Response::new(404, "Not Found")
            .header("Content-Type", "text/plain")
            .body(b"Not Found".to_vec())
            .into_bytes();
        assert_eq!(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nContent-Type: text/plain\r\n\r\nNot Found"
                .as_slice(),
            bytes.as_slice()
        );
    }

    #[test]
    fn content_length_tracks_body_size() {
        let bytes = Response::new(200, "OK")
            .header("Content-Type", "text/html")
            .body(vec![b'x'; 1024])
            .into_bytes();
        let head = String::from_utf8_lossy(&bytes);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\nContent-Length: 1024\r\n"));
        assert_eq!(1024, bytes.len() - bytes.windows(4).position(|w| w == b"\r\n\r\n").unwrap() - 4);
    }
}
