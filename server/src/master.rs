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

//! Master: owns the listening socket, preforks the worker pool, and
//! dispatches each accepted connection's descriptor by client-IP affinity.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::process;

use anyhow::{Context, Result};
use mio::{net::TcpListener, unix::SourceFd, Events, Interest, Poll, Token};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::waitpid;
use nix::unistd::{close, fork, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::affinity::AffinityCache;
use crate::config::Config;
use crate::fdpass;
use crate::worker;

const LISTENER: Token = Token(usize::MAX);
const SIGNAL: Token = Token(usize::MAX - 1);

/// One prefork worker as seen from the master: its pid and the master-side
/// end of the control channel.
#[derive(Debug)]
pub struct WorkerChannel {
    pid: Pid,
    channel: OwnedFd,
}

/// Owns the listening socket, the worker table, and the affinity cache.
#[derive(Debug)]
pub struct Master {
    listener: TcpListener,
    channels: Vec<WorkerChannel>,
    cache: AffinityCache,
    next_worker: usize,
    config: Config,
}

impl Master {
    /// Binds the listening socket. An unusable address fails fast, before
    /// any worker is forked.
    pub fn new(config: Config) -> Result<Master> {
        let addr = config.addr()?;
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, workers = config.server.workers, "listening");

        Ok(Master {
            listener,
            channels: Vec::new(),
            cache: AffinityCache::new(),
            next_worker: 0,
            config,
        })
    }

    /// Preforks the configured workers, then dispatches accepted
    /// connections until SIGINT and tears the pool down.
    pub fn run(mut self) -> Result<()> {
        self.spawn_workers()?;

        // Signal context only writes one end of this pair; the loop below
        // reads the other.
        let (sigint_rx, sigint_tx) = UnixStream::pair().context("failed to create signal pipe")?;
        sigint_rx.set_nonblocking(true)?;
        sigint_tx.set_nonblocking(true)?;
        signal_hook::low_level::pipe::register(signal_hook::consts::SIGINT, sigint_tx)
            .context("failed to install SIGINT handler")?;

        let mut poll = Poll::new().context("failed to create selector")?;
        poll.registry()
            .register(&mut self.listener, LISTENER, Interest::READABLE)
            .context("failed to register listener")?;
        let sigint_fd = sigint_rx.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&sigint_fd), SIGNAL, Interest::READABLE)
            .context("failed to register signal pipe")?;

        let mut events = Events::with_capacity(128);
        'accept: loop {
            match poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("selector failed"),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(),
                    SIGNAL => {
                        info!("received SIGINT, shutting down workers");
                        break 'accept;
                    }
                    _ => {}
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn spawn_workers(&mut self) -> Result<()> {
        for _ in 0..self.config.server.workers {
            let (parent_end, child_end) = socketpair(
                AddressFamily::Unix,
                SockType::Datagram,
                None,
                SockFlag::empty(),
            )
            .context("failed to create control socketpair")?;

            match unsafe { fork() }.context("fork failed")? {
                ForkResult::Child => {
                    // Everything that belongs to the master is closed here:
                    // this pair's parent end, the earlier workers' parent
                    // ends, and the listening socket.
                    drop(parent_end);
                    drop(std::mem::take(&mut self.channels));
                    let _ = close(self.listener.as_raw_fd());

                    let code = worker::run(child_end, self.config.clone());
                    process::exit(code);
                }
                ForkResult::Parent { child } => {
                    drop(child_end);
                    info!(pid = %child, "spawned worker");
                    self.channels.push(WorkerChannel {
                        pid: child,
                        channel: parent_end,
                    });
                }
            }
        }
        Ok(())
    }

    // Accept until the listener would block, dispatching each connection.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.dispatch(stream, addr),
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(%err, "accept failed");
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, stream: mio::net::TcpStream, addr: SocketAddr) {
        let index = select_worker(
            &mut self.cache,
            &mut self.next_worker,
            self.channels.len(),
            addr.ip(),
        );
        let channel = &self.channels[index];

        match fdpass::send_fd(channel.channel.as_raw_fd(), stream.as_raw_fd()) {
            Ok(()) => debug!(peer = %addr, worker = %channel.pid, "dispatched connection"),
            Err(err) => {
                warn!(peer = %addr, worker = %channel.pid, %err, "dispatch failed, dropping client")
            }
        }
        // The worker now holds the only lasting reference; dropping the
        // stream releases the master's copy either way.
        drop(stream);
    }

    fn shutdown(&mut self) {
        for channel in &self.channels {
            match kill(channel.pid, Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => warn!(pid = %channel.pid, %err, "failed to signal worker"),
            }
        }

        for channel in &self.channels {
            match waitpid(channel.pid, None) {
                Ok(status) => info!(pid = %channel.pid, ?status, "worker exited"),
                Err(Errno::ECHILD) => {}
                Err(err) => warn!(pid = %channel.pid, %err, "failed to reap worker"),
            }
        }

        info!("shutdown complete");
    }
}

// Affinity lookup, falling back to the round-robin pointer on a miss.
fn select_worker(
    cache: &mut AffinityCache,
    next_worker: &mut usize,
    workers: usize,
    ip: IpAddr,
) -> usize {
    if let Some(index) = cache.get(ip) {
        debug!(%ip, worker = index, "affinity hit");
        return index;
    }

    let index = *next_worker;
    cache.put(ip, index);
    *next_worker = (index + 1) % workers;
    debug!(%ip, worker = index, "affinity miss, assigned round-robin");
    index
}
