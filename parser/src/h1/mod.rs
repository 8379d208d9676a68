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

//! H1 request framing
//!
//! Bytes are decoded as ISO-8859-1, which maps every byte value to a code
//! point and therefore cannot fail on arbitrary input.

use core::fmt::Display;

/// Represents possible failures while parsing a request start-line
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Missing or empty method token.
    Method,
    /// Missing request target.
    Target,
    /// Missing or invalid HTTP version.
    Version,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "Invalid or missing method",
            ParseError::Target => "Invalid or missing target",
            ParseError::Version => "Invalid or missing version",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// A parsed request start-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// Method token, e.g. `GET`.
    pub method: String,
    /// Request target as sent by the client.
    pub target: String,
    /// Version token, e.g. `HTTP/1.1`.
    pub version: String,
}

impl RequestLine {
    /// Splits the first line of a request into its three tokens.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut parts = line.split_whitespace();
        let method = parts.next().ok_or(ParseError::Method)?;
        let target = parts.next().ok_or(ParseError::Target)?;
        let version = parts.next().ok_or(ParseError::Version)?;

        if !version.starts_with("HTTP/") {
            return Err(ParseError::Version);
        }

        Ok(RequestLine {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        })
    }
}

/// Finds the offset of the `\r\n\r\n` header terminator, if present.
#[inline]
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Decodes the buffer as ISO-8859-1 and splits it on `\r\n`.
///
/// The first line is the start-line; the rest are raw header lines and,
/// past the blank line, whatever body bytes were buffered.
pub fn request_lines(buf: &[u8]) -> Vec<String> {
    decode(buf).split("\r\n").map(str::to_string).collect()
}

/// Reports whether `buf` holds at least one complete request.
///
/// Methods that usually carry a body (`POST`, `PUT`) are complete once
/// `Content-Length` bytes follow the header block; a missing or malformed
/// `Content-Length` leaves the request incomplete. Every other method is
/// complete at the end of the header block.
pub fn is_complete(buf: &[u8]) -> bool {
    let end = match header_end(buf) {
        Some(end) => end,
        None => return false,
    };

    let head = decode(&buf[..end]);
    let mut lines = head.split("\r\n");
    let method = lines
        .next()
        .and_then(|line| line.split(' ').next())
        .unwrap_or("");

    if method != "POST" && method != "PUT" {
        return true;
    }

    for line in lines {
        if let Some(value) = header_value(line, "content-length") {
            return match value.trim().parse::<usize>() {
                Ok(length) => buf.len() >= end + 4 + length,
                Err(_) => false,
            };
        }
    }

    false
}

/// Computes keep-alive for a request.
///
/// Keep-alive holds iff the version is `HTTP/1.1` and the first
/// `Connection:` header, when present, does not ask to close.
pub fn wants_keep_alive(version: &str, header_lines: &[String]) -> bool {
    if version != "HTTP/1.1" {
        return false;
    }

    for line in header_lines {
        if let Some(value) = header_value(line, "connection") {
            return !value.to_ascii_lowercase().contains("close");
        }
    }

    true
}

fn decode(buf: &[u8]) -> String {
    buf.iter().map(|&b| b as char).collect()
}

/// Case-insensitive `name:` prefix match, returning the raw header value.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let prefix = line.get(..name.len())?;
    if !prefix.eq_ignore_ascii_case(name) {
        return None;
    }
    line.get(name.len()..)?.strip_prefix(':')
}

#[cfg(test)]
mod test {
    use super::{header_end, is_complete, request_lines, wants_keep_alive, ParseError, RequestLine};

    const GET: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    #[test]
    fn get_is_complete_at_end_of_headers() {
        assert!(is_complete(GET));
    }

    #[test]
    fn missing_header_terminator_is_incomplete() {
        assert!(!is_complete(b"GET / HTTP/1.1\r\nHost: x\r\n"));
    }

    #[test]
    fn every_proper_prefix_is_incomplete() {
        for k in 0..GET.len() {
            assert!(!is_complete(&GET[..k]), "prefix of length {} framed", k);
        }
        assert!(is_complete(GET));
    }

    #[test]
    fn post_waits_for_content_length_bytes() {
        // body arrives in two pieces, "ab" then "cde"
        let partial = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nab";
        let full = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde";
        assert!(!is_complete(partial));
        assert!(is_complete(full));
    }

    #[test]
    fn post_without_content_length_is_incomplete() {
        assert!(!is_complete(b"POST /x HTTP/1.1\r\nHost: x\r\n\r\n"));
    }

    #[test]
    fn post_with_malformed_content_length_is_incomplete() {
        assert!(!is_complete(b"POST /x HTTP/1.1\r\nContent-Length: five\r\n\r\nhello"));
    }

    #[test]
    fn put_honors_content_length() {
        assert!(!is_complete(b"PUT /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nhi"));
        assert!(is_complete(b"PUT /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nhi!"));
    }

    #[test]
    fn content_length_name_is_case_insensitive() {
        assert!(is_complete(b"POST /x HTTP/1.1\r\ncontent-LENGTH: 2\r\n\r\nok"));
    }

    #[test]
    fn delete_is_complete_without_body() {
        assert!(is_complete(b"DELETE /foo HTTP/1.1\r\nHost: x\r\n\r\n"));
    }

    #[test]
    fn high_bytes_do_not_break_framing() {
        let mut buf = b"GET /caf\xe9 HTTP/1.1\r\nX-Raw: \xff\xfe\r\n\r\n".to_vec();
        assert!(is_complete(&buf));
        buf.pop();
        assert!(!is_complete(&buf));
    }

    #[test]
    fn header_end_finds_terminator_offset() {
        assert_eq!(Some(14), header_end(b"GET / HTTP/1.1\r\n\r\n"));
        assert_eq!(None, header_end(b"GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn request_lines_splits_on_crlf() {
        let lines = request_lines(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!("GET / HTTP/1.1", lines[0]);
        assert_eq!("Host: x", lines[1]);
        assert_eq!("", lines[2]);
    }

    #[test]
    fn request_line_parses_three_tokens() {
        let line = RequestLine::parse("GET /index.html HTTP/1.1").unwrap();
        assert_eq!("GET", line.method);
        assert_eq!("/index.html", line.target);
        assert_eq!("HTTP/1.1", line.version);
    }

    #[test]
    fn request_line_rejects_missing_tokens() {
        assert_eq!(Err(ParseError::Method), RequestLine::parse(""));
        assert_eq!(Err(ParseError::Target), RequestLine::parse("GET"));
        assert_eq!(Err(ParseError::Version), RequestLine::parse("GET /"));
    }

    #[test]
    fn request_line_rejects_bad_version() {
        assert_eq!(Err(ParseError::Version), RequestLine::parse("GET / FTP/1.1"));
    }

    #[test]
    fn keep_alive_defaults_on_for_http11() {
        let headers = vec!["Host: x".to_string()];
        assert!(wants_keep_alive("HTTP/1.1", &headers));
    }

    #[test]
    fn keep_alive_off_for_http10() {
        let headers = vec!["Host: x".to_string()];
        assert!(!wants_keep_alive("HTTP/1.0", &headers));
    }

    #[test]
    fn keep_alive_off_when_connection_close() {
        let headers = vec!["Host: x".to_string(), "Connection: close".to_string()];
        assert!(!wants_keep_alive("HTTP/1.1", &headers));
    }

    #[test]
    fn keep_alive_on_when_connection_keep_alive() {
        let headers = vec!["Connection: keep-alive".to_string()];
        assert!(wants_keep_alive("HTTP/1.1", &headers));
    }
}
