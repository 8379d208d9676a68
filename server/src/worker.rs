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

//! Worker: a single-threaded readiness loop over the master control channel
//! and every client socket dispatched to this process.
//!
//! All client I/O is non-blocking; the only tolerated blocking point is the
//! upstream proxy exchange, during which this worker serves no one else.

use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use nix::sys::signal::{self, SigHandler, Signal};
use slab::Slab;
use tracing::{debug, error, info, trace, warn};

use parser::h1::{self, RequestLine};

use crate::config::Config;
use crate::connection::Connection;
use crate::fdpass;
use crate::router;

const CONTROL: Token = Token(usize::MAX);

/// Selector wait bound; the shutdown flag and idle sweep run at least this
/// often.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections idle longer than this are closed by the sweep.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Child-process entry point: serves until SIGTERM, then drains and exits.
///
/// Returns the process exit code. SIGINT is reset to default here so a
/// keyboard interrupt only ever reaches the master.
pub fn run(control: OwnedFd, config: Config) -> i32 {
    if let Err(err) = unsafe { signal::signal(Signal::SIGINT, SigHandler::SigDfl) } {
        error!(%err, "failed to reset SIGINT disposition");
        return 1;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(err) =
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
    {
        error!(%err, "failed to install SIGTERM flag");
        return 1;
    }

    let mut worker = match Worker::new(control, config, shutdown) {
        Ok(worker) => worker,
        Err(err) => {
            error!(%err, "worker failed to initialize");
            return 1;
        }
    };

    info!(pid = process::id(), "worker started");
    match worker.run() {
        Ok(()) => 0,
        Err(err) => {
            error!(%err, "worker event loop failed");
            1
        }
    }
}

/// The event loop owning every connection dispatched to this process.
#[derive(Debug)]
pub struct Worker {
    poll: Poll,
    control: UnixDatagram,
    connections: Slab<Connection>,
    config: Config,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    /// Registers the control channel and prepares an empty connection table.
    pub fn new(control: OwnedFd, config: Config, shutdown: Arc<AtomicBool>) -> io::Result<Worker> {
        let control = UnixDatagram::from(control);
        control.set_nonblocking(true)?;

        let poll = Poll::new()?;
        let raw = control.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&raw), CONTROL, Interest::READABLE)?;

        Ok(Worker {
            poll,
            control,
            connections: Slab::new(),
            config,
            shutdown,
        })
    }

    /// Number of connections currently owned by this worker.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs the loop until the shutdown flag is observed, then closes every
    /// connection.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                // The selector itself is broken; nothing can be served.
                Err(err) => return Err(err),
            }

            for event in events.iter() {
                match event.token() {
                    CONTROL => {
                        self.adopt_transfers();
                        if event.is_read_closed() {
                            info!("control channel closed, shutting down");
                            self.shutdown.store(true, Ordering::Relaxed);
                        }
                    }
                    token => self.connection_event(token, event),
                }
            }

            self.sweep_idle();
        }

        self.close_all();
        info!("worker exiting");
        Ok(())
    }

    // Drain every queued transfer; each descriptor becomes a registered
    // connection in the reading stage.
    fn adopt_transfers(&mut self) {
        loop {
            match fdpass::recv_fd(self.control.as_raw_fd()) {
                Ok(Some(fd)) => {
                    if let Err(err) = self.adopt(fd) {
                        warn!(fd, %err, "failed to adopt transferred socket");
                    }
                }
                Ok(None) => warn!("control message carried no descriptor"),
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(%err, "control channel receive failed");
                    break;
                }
            }
        }
    }

    fn adopt(&mut self, fd: RawFd) -> io::Result<()> {
        // Ownership of the open file moves into this wrapper.
        let stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        stream.set_nonblocking(true)?;
        let stream = mio::net::TcpStream::from_std(stream);
        let peer_addr = stream.peer_addr()?;

        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        let mut connection = Connection::new(stream, peer_addr);
        self.poll
            .registry()
            .register(connection.source(), token, Interest::READABLE)?;
        entry.insert(connection);

        debug!(%peer_addr, token = token.0, "adopted connection");
        Ok(())
    }

    fn connection_event(&mut self, token: Token, event: &mio::event::Event) {
        if !self.connections.contains(token.0) {
            return;
        }

        let keep = if event.is_readable() {
            self.read_ready(token)
        } else if event.is_writable() {
            self.write_ready(token)
        } else {
            !event.is_error()
        };

        if !keep {
            self.close(token);
        }
    }

    // Advances a connection in the reading stage. Returns false to close.
    fn read_ready(&mut self, token: Token) -> bool {
        let connection = match self.connections.get_mut(token.0) {
            Some(connection) => connection,
            None => return true,
        };

        match connection.fill() {
            Ok(0) => {
                debug!(peer = %connection.peer_addr(), "client closed connection");
                return false;
            }
            Ok(_) => {}
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return true,
            Err(err) => {
                warn!(peer = %connection.peer_addr(), %err, "read failed");
                return false;
            }
        }

        let header_end = match h1::header_end(connection.recv_buffer()) {
            Some(end) => end,
            None => {
                trace!(
                    peer = %connection.peer_addr(),
                    buffered = connection.recv_buffer().len(),
                    "waiting for a complete request"
                );
                return true;
            }
        };
        if !h1::is_complete(connection.recv_buffer()) {
            trace!(peer = %connection.peer_addr(), "waiting for the request body");
            return true;
        }

        let lines = h1::request_lines(connection.recv_buffer());
        let request = match lines.first().map(String::as_str).map(RequestLine::parse) {
            Some(Ok(request)) => request,
            _ => {
                warn!(peer = %connection.peer_addr(), "malformed request start-line");
                return false;
            }
        };

        info!(
            peer = %connection.peer_addr(),
            method = %request.method,
            target = %request.target,
            version = %request.version,
            "request"
        );

        connection.set_keep_alive(h1::wants_keep_alive(&request.version, &lines[1..]));

        let body = &connection.recv_buffer()[header_end + 4..];
        let response = router::respond(&request, &lines[1..], body, &self.config);
        connection.start_response(response);

        let interest = connection.interest();
        if let Err(err) = self
            .poll
            .registry()
            .reregister(connection.source(), token, interest)
        {
            warn!(%err, "failed to arm connection for writing");
            return false;
        }

        true
    }

    // Drains the response. Returns false to close.
    fn write_ready(&mut self, token: Token) -> bool {
        let connection = match self.connections.get_mut(token.0) {
            Some(connection) => connection,
            None => return true,
        };

        match connection.flush() {
            Ok(_) => {}
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return true,
            Err(err) => {
                warn!(peer = %connection.peer_addr(), %err, "write failed");
                return false;
            }
        }

        if !connection.response_complete() {
            return true;
        }

        debug!(peer = %connection.peer_addr(), "response finished");
        if !connection.keep_alive() {
            return false;
        }

        connection.await_next_request();
        let interest = connection.interest();
        if let Err(err) = self
            .poll
            .registry()
            .reregister(connection.source(), token, interest)
        {
            warn!(%err, "failed to re-arm connection for reading");
            return false;
        }

        trace!(peer = %connection.peer_addr(), "re-armed for next request");
        true
    }

    // O(connections), runs after every selector wait.
    fn sweep_idle(&mut self) {
        let now = Instant::now();
        let idle: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.idle_for(now) > IDLE_TIMEOUT)
            .map(|(key, _)| Token(key))
            .collect();

        for token in idle {
            info!(token = token.0, "closing idle connection");
            self.close(token);
        }
    }

    fn close(&mut self, token: Token) {
        if self.connections.contains(token.0) {
            let mut connection = self.connections.remove(token.0);
            if let Err(err) = self.poll.registry().deregister(connection.source()) {
                warn!(%err, "failed to deregister connection");
            }
            debug!(peer = %connection.peer_addr(), "connection closed");
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.connections.iter().map(|(key, _)| Token(key)).collect();
        for token in tokens {
            self.close(token);
        }
    }
}
