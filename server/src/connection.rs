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

//! Per-connection state for the worker event loop.

use std::io::{self, Error, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::{net::TcpStream, Interest};

const READ_CHUNK: usize = 4096;

/// Which readiness the connection is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Accumulating request bytes.
    Reading,
    /// Draining response bytes.
    Writing,
}

/// One client connection, owned by the worker that adopted its descriptor.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    recv_buffer: Vec<u8>,
    send_buffer: Vec<u8>,
    last_active: Instant,
    keep_alive: bool,
    stage: Stage,
}

impl Connection {
    /// Wraps an adopted non-blocking stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Connection {
            stream,
            peer_addr,
            recv_buffer: Vec::new(),
            send_buffer: Vec::new(),
            last_active: Instant::now(),
            keep_alive: true,
            stage: Stage::Reading,
        }
    }

    /// The peer address captured when the descriptor was adopted.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Bytes buffered towards the next complete request.
    pub fn recv_buffer(&self) -> &[u8] {
        &self.recv_buffer
    }

    /// Whether the connection re-arms for another request after the
    /// response drains.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Recomputed per request from the version and `Connection` header.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Current stage of the request/response cycle.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The readiness the current stage requires.
    pub fn interest(&self) -> Interest {
        match self.stage {
            Stage::Reading => Interest::READABLE,
            Stage::Writing => Interest::WRITABLE,
        }
    }

    /// The registerable event source.
    pub fn source(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Drains the readable socket into the receive buffer.
    ///
    /// `Ok(0)` is end-of-stream with nothing new buffered; `Err(WouldBlock)`
    /// means no bytes were available. Registration is edge-triggered, so the
    /// socket must be read until it would block.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut read = 0;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    // A final segment before FIN still gets dispatched; the
                    // end-of-stream resurfaces on the next readiness.
                    if read == 0 {
                        return Ok(0);
                    }
                    return Ok(read);
                }
                Ok(n) => {
                    self.recv_buffer.extend_from_slice(&chunk[..n]);
                    self.last_active = Instant::now();
                    read += n;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        if read == 0 {
                            return Err(e);
                        }
                        return Ok(read);
                    }
                    ErrorKind::Interrupted => {}
                    _ => return Err(e),
                },
            }
        }
    }

    /// Flushes buffered response bytes, trimming the written prefix.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut flushed = 0;

        while !self.send_buffer.is_empty() {
            match self.stream.write(&self.send_buffer) {
                Ok(0) => return Err(Error::new(ErrorKind::WriteZero, "stream accepted no bytes")),
                Ok(n) => {
                    self.send_buffer.drain(..n);
                    self.last_active = Instant::now();
                    flushed += n;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        if flushed == 0 {
                            return Err(e);
                        }
                        break;
                    }
                    ErrorKind::Interrupted => {}
                    _ => return Err(e),
                },
            }
        }

        Ok(flushed)
    }

    /// Buffers a response, clears the request bytes, and flips to the
    /// writing stage.
    pub fn start_response(&mut self, bytes: Vec<u8>) {
        self.send_buffer = bytes;
        self.recv_buffer.clear();
        self.stage = Stage::Writing;
    }

    /// True once the buffered response is fully drained.
    pub fn response_complete(&self) -> bool {
        self.send_buffer.is_empty()
    }

    /// Re-arms for the next request on a keep-alive connection.
    pub fn await_next_request(&mut self) {
        self.stage = Stage::Reading;
    }

    /// Time since the last successful read or write.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }
}

#[cfg(test)]
mod test {
    use super::{Connection, Stage};
    use mio::Interest;
    use std::io::{ErrorKind, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let peer_addr = server.peer_addr().unwrap();
        let connection = Connection::new(mio::net::TcpStream::from_std(server), peer_addr);
        (connection, client)
    }

    fn fill_until_data(connection: &mut Connection) -> usize {
        for _ in 0..100 {
            match connection.fill() {
                Ok(n) if n > 0 => return n,
                Ok(_) => panic!("unexpected end of stream"),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("fill failed: {e}"),
            }
        }
        panic!("no data arrived");
    }

    #[test]
    fn fill_appends_available_bytes() {
        let (mut connection, mut client) = pair();
        client.write_all(b"hello").unwrap();

        let read = fill_until_data(&mut connection);
        assert_eq!(5, read);
        assert_eq!(b"hello", connection.recv_buffer());
    }

    #[test]
    fn fill_would_block_without_data() {
        let (mut connection, _client) = pair();
        let err = connection.fill().unwrap_err();
        assert_eq!(ErrorKind::WouldBlock, err.kind());
    }

    #[test]
    fn fill_reports_end_of_stream_after_peer_close() {
        let (mut connection, client) = pair();
        drop(client);

        for _ in 0..100 {
            match connection.fill() {
                Ok(0) => return,
                Ok(n) => panic!("unexpected {n} bytes"),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("fill failed: {e}"),
            }
        }
        panic!("end of stream never surfaced");
    }

    #[test]
    fn flush_drains_the_send_buffer_to_the_peer() {
        let (mut connection, mut client) = pair();
        connection.start_response(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec());

        connection.flush().unwrap();
        assert!(connection.response_complete());

        let mut received = [0u8; 64];
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let n = client.read(&mut received).unwrap();
        assert_eq!(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", &received[..n]);
    }

    #[test]
    fn stages_drive_interest_and_buffers() {
        let (mut connection, _client) = pair();
        assert_eq!(Stage::Reading, connection.stage());
        assert_eq!(Interest::READABLE, connection.interest());

        connection.start_response(b"bytes".to_vec());
        assert_eq!(Stage::Writing, connection.stage());
        assert_eq!(Interest::WRITABLE, connection.interest());
        assert!(connection.recv_buffer().is_empty());

        connection.await_next_request();
        assert_eq!(Stage::Reading, connection.stage());
    }

    #[test]
    fn idle_time_counts_from_last_activity() {
        let (connection, _client) = pair();
        let later = Instant::now() + Duration::from_secs(70);
        assert!(connection.idle_for(later) > Duration::from_secs(60));
    }
}
