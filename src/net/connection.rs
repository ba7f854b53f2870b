//-
// Copyright (c) 2024, the Arcmail Developers
//
// This file is part of Arcmail.
//
// Arcmail is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public License as  published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Arcmail is distributed in the hope that  it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Arcmail. If not, see <http://www.gnu.org/licenses/>.

//! One buffered, non-blocking socket.
//!
//! I/O trouble is not raised through return values scattered across the
//! protocol code; instead every noteworthy condition becomes an `Event`
//! handed to the connection's single `Reactor`. The event loop is the only
//! caller of `read`/`write`/`close`.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{getsockopt, sockopt};
use nix::unistd;

use super::buffer::NetBuffer;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Inactive,
    Connecting,
    Connected,
    Closing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Listener,
    ImapServer,
    Pop3Server,
    SmtpServer,
    HttpServer,
    ManageSieveServer,
    DatabaseClient,
    LogClient,
    Client,
    Pipe,
}

/// Everything that can happen to a connection, delivered to its reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Read,
    Connect,
    Close,
    Error,
    Shutdown,
    Timeout,
}

/// The single reducer for one connection's events.
pub trait Reactor {
    fn react(
        &mut self,
        connection: &mut Connection,
        event: Event,
    ) -> Result<(), Error>;

    /// Connections this reactor wants added to the loop (listeners hand
    /// their accepted sockets over this way). Called after each dispatch.
    fn take_spawned(&mut self) -> Vec<super::event_loop::Managed> {
        Vec::new()
    }
}

pub struct Connection {
    fd: RawFd,
    state: State,
    ctype: Type,
    description: String,
    read_buffer: NetBuffer,
    write_buffer: NetBuffer,
    /// Unix-seconds deadline; 0 means no timeout.
    timeout: i64,
    peer_open: bool,
    pending: Vec<Event>,
}

impl Connection {
    /// Wraps `fd`, putting it into non-blocking mode.
    pub fn new(
        fd: RawFd,
        ctype: Type,
        description: impl Into<String>,
    ) -> Result<Self, Error> {
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

        Ok(Connection {
            fd,
            state: State::Inactive,
            ctype,
            description: description.into(),
            read_buffer: NetBuffer::new(),
            write_buffer: NetBuffer::new(),
            timeout: 0,
            peer_open: true,
            pending: Vec::new(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn ctype(&self) -> Type {
        self.ctype
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn timeout(&self) -> i64 {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: i64) {
        self.timeout = timeout;
    }

    /// Whether reading could still produce data (the peer has not closed).
    pub fn can_read(&self) -> bool {
        self.peer_open
    }

    /// Whether there is anything waiting to be written.
    pub fn can_write(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    pub fn active(&self) -> bool {
        self.fd >= 0 && State::Inactive != self.state
    }

    pub fn valid(&self) -> bool {
        self.fd >= 0
    }

    pub fn read_buffer(&mut self) -> &mut NetBuffer {
        &mut self.read_buffer
    }

    pub fn write_buffer_errored(&self) -> bool {
        self.write_buffer.error().is_some()
    }

    /// Queues `bytes` for writing; the loop flushes on writability.
    pub fn enqueue(&mut self, bytes: &[u8]) {
        self.write_buffer.append(bytes);
    }

    /// Queues a synthetic event for the next dispatch.
    pub fn push_pending(&mut self, event: Event) {
        self.pending.push(event);
    }

    pub fn is_pending(&self, event: Event) -> bool {
        self.pending.contains(&event)
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Pulls whatever the socket has into the read buffer.
    ///
    /// A zero-length read means the peer closed; `can_read` goes false.
    pub fn read(&mut self) -> Result<(), Error> {
        let mut chunk = [0u8; 4096];
        loop {
            match unistd::read(self.fd, &mut chunk) {
                Ok(0) => {
                    self.peer_open = false;
                    return Ok(());
                },
                Ok(n) => self.read_buffer.append(&chunk[..n]),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Flushes as much of the write buffer as the socket accepts.
    ///
    /// Errors latch on the write buffer rather than propagating; dispatch
    /// turns them into a `Close`.
    pub fn write(&mut self) {
        while !self.write_buffer.is_empty() {
            let chunk = self.write_buffer.first_chunk();
            match unistd::write(self.fd, chunk) {
                Ok(0) => return,
                Ok(n) => self.write_buffer.consume(n),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => return,
                Err(e) => {
                    self.write_buffer.set_error(e.to_string());
                    return;
                },
            }
        }
    }

    /// Releases the file descriptor. Idempotent.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            let _ = unistd::close(self.fd);
            self.fd = -1;
        }
        self.state = State::Inactive;
    }

    /// The socket-level error code, for disambiguating a connect that
    /// reported both readable and writable.
    pub fn socket_error(&self) -> i32 {
        getsockopt(self.fd, sockopt::SocketError).unwrap_or(0)
    }

    /// Whether the kernel still recognises this as an open socket. Used by
    /// the loop to find the culprit after the wait reports a bad FD.
    pub fn probe(&self) -> bool {
        getsockopt(self.fd, sockopt::RcvBuf).is_ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
