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

//! Descriptor transfer over the master/worker control channel.
//!
//! Each message is a one-byte-minimum datagram carrying a single
//! `SCM_RIGHTS` control message with exactly one descriptor. A successful
//! send duplicates the open file into the peer process; the sender must
//! close its own copy to release the reference.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::RawFd;

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// Payload marking an fd-carrying control message.
const MARKER: &[u8] = b"FD";

/// Sends one open descriptor over a datagram control channel.
pub fn send_fd(channel: RawFd, fd: RawFd) -> io::Result<()> {
    let iov = [IoSlice::new(MARKER)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(channel, &iov, &cmsg, MsgFlags::empty(), None).map_err(io::Error::from)?;
    Ok(())
}

/// Receives one control message, extracting the first transferred
/// descriptor. `Ok(None)` means the message carried no descriptor.
pub fn recv_fd(channel: RawFd) -> io::Result<Option<RawFd>> {
    let mut payload = [0u8; 8];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut cmsg = cmsg_space!(RawFd);

    let msg = recvmsg::<()>(channel, &mut iov, Some(&mut cmsg), MsgFlags::empty())
        .map_err(io::Error::from)?;

    for message in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = message {
            if let Some(&fd) = fds.first() {
                return Ok(Some(fd));
            }
        }
    }

    Ok(None)
}
