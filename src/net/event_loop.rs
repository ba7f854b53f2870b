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

//! The cooperative event loop.
//!
//! Single-threaded; every connection and timer belongs to exactly one loop,
//! and all user code runs between readiness waits. The only blocking point
//! is `poll`, bounded to at most 60 seconds per iteration.

use chrono::prelude::*;
use log::{debug, error, info};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use super::connection::{Connection, Event, Reactor, State, Type};
use crate::support::{alloc_track, graph};

pub struct Managed {
    pub connection: Connection,
    pub reactor: Box<dyn Reactor>,
}

pub struct Timer {
    id: u64,
    /// Unix-seconds deadline.
    deadline: i64,
    callback: Box<dyn FnMut()>,
}

pub struct EventLoop {
    connections: Vec<Managed>,
    timers: Vec<Timer>,
    next_timer_id: u64,
    startup: bool,
    stop: bool,
    sweep_hooks: Vec<Box<dyn FnMut()>>,
    last_sweep: i64,
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop {
            connections: Vec::new(),
            timers: Vec::new(),
            next_timer_id: 1,
            startup: false,
            stop: false,
            sweep_hooks: Vec::new(),
            last_sweep: Utc::now().timestamp(),
        }
    }

    /// Adds `m` to the set of managed connections.
    ///
    /// Ignored during shutdown so that shutdown proceeds unhampered.
    /// Adding an FD that is already managed is a no-op.
    pub fn add_connection(&mut self, m: Managed) {
        if self.stop {
            error!("Cannot add new connections during shutdown");
            return;
        }

        if self
            .connections
            .iter()
            .any(|c| c.connection.fd() == m.connection.fd())
        {
            return;
        }

        if Type::LogClient != m.connection.ctype() {
            debug!("Added {}", m.connection.description());
        }
        self.connections.push(m);
        self.set_connection_counts();
    }

    pub fn remove_connection(&mut self, fd: i32) -> Option<Managed> {
        let ix = self
            .connections
            .iter()
            .position(|c| c.connection.fd() == fd)?;
        let m = self.connections.remove(ix);
        if Type::LogClient != m.connection.ctype() {
            debug!("Removed {}", m.connection.description());
        }
        self.set_connection_counts();
        Some(m)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Closes every connection except the two given FDs.
    pub fn close_all_except(&mut self, keep1: i32, keep2: i32) {
        let mut removed = Vec::new();
        self.connections.retain_mut(|c| {
            let fd = c.connection.fd();
            if fd == keep1 || fd == keep2 {
                true
            } else {
                c.connection.close();
                removed.push(fd);
                false
            }
        });
        if !removed.is_empty() {
            self.set_connection_counts();
        }
    }

    /// Closes every non-Listener connection; used to prepare for forking.
    pub fn close_all_except_listeners(&mut self) {
        self.connections.retain_mut(|c| {
            if Type::Listener == c.connection.ctype() {
                true
            } else {
                c.connection.close();
                false
            }
        });
        self.set_connection_counts();
    }

    /// Flushes every connection's write buffer.
    pub fn flush_all(&mut self) {
        for c in &mut self.connections {
            c.connection.write();
        }
    }

    pub fn add_timer(&mut self, deadline: i64, callback: impl FnMut() + 'static) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(Timer {
            id,
            deadline,
            callback: Box::new(callback),
        });
        id
    }

    pub fn remove_timer(&mut self, id: u64) {
        self.timers.retain(|t| t.id != id);
    }

    /// Registers a hook run whenever the loop decides to sweep caches.
    pub fn add_sweep_hook(&mut self, hook: impl FnMut() + 'static) {
        self.sweep_hooks.push(Box::new(hook));
    }

    pub fn set_startup(&mut self, startup: bool) {
        self.startup = startup;
    }

    pub fn in_startup(&self) -> bool {
        self.startup
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn in_shutdown(&self) -> bool {
        self.stop
    }

    /// Runs the loop until `stop` is called.
    pub fn run(&mut self) {
        debug!("Starting event loop");

        while !self.stop {
            self.step(60);
        }

        // A little brutal. Proper shutdown first gets rid of listeners and
        // calls this a while later.
        debug!("Shutting down event loop");
        for m in &mut self.connections {
            if State::Connected == m.connection.state() {
                if let Err(e) =
                    m.reactor.react(&mut m.connection, Event::Shutdown)
                {
                    debug!(
                        "{}: shutdown event failed: {}",
                        m.connection.description(),
                        e
                    );
                }
            }
            if State::Connected == m.connection.state() {
                m.connection.write();
            }
        }
        debug!("Event loop stopped");
    }

    /// One loop iteration: wait for readiness at most `max_wait` seconds,
    /// then run timers and dispatch connections.
    pub fn step(&mut self, max_wait: i64) {
        let mut deadline = i64::MAX;

        let mut fds = Vec::with_capacity(self.connections.len());
        let mut fd_conn = Vec::with_capacity(self.connections.len());
        for (ix, m) in self.connections.iter().enumerate() {
            let c = &m.connection;
            if !c.active()
                || (self.startup && Type::Listener == c.ctype())
            {
                continue;
            }

            let mut flags = PollFlags::empty();
            if c.can_read() && State::Closing != c.state() {
                flags |= PollFlags::POLLIN;
            }
            if c.can_write()
                || State::Connecting == c.state()
                || State::Closing == c.state()
            {
                flags |= PollFlags::POLLOUT;
            }
            if c.timeout() > 0 && c.timeout() < deadline {
                deadline = c.timeout();
            }

            fds.push(PollFd::new(c.fd(), flags));
            fd_conn.push(ix);
        }

        for t in &self.timers {
            if t.deadline < deadline {
                deadline = t.deadline;
            }
        }

        let now = Utc::now().timestamp();
        let wait = if i64::MAX == deadline {
            max_wait
        } else {
            (deadline - now).clamp(0, max_wait)
        };

        let poll_result = poll(&mut fds, (wait * 1000) as i32);
        let now = Utc::now().timestamp();

        graph::set("memory-used", alloc_track::in_use() as u64);
        let alloc = alloc_track::allocated();

        let mut dispatchable = true;
        match poll_result {
            Ok(_) => (),
            Err(Errno::EINTR) => {
                // A signal we handle; readiness results are unreliable, so
                // skip straight to timers.
                dispatchable = false;
            },
            Err(Errno::EBADF) => {
                // One of the FDs went bad under us. Probe each socket and
                // forget the dead ones, letting the rest of the server go
                // on.
                self.probe_connections();
                dispatchable = false;
            },
            Err(e) => {
                error!("poll() failed: {}; stopping event loop", e);
                self.stop = true;
                return;
            },
        }

        // Sweep caches if (a) we have allocated something but event
        // processing no longer is, (b) memory grew by both 20% and 8MB
        // since the last sweep, or (c) at least 128KB accumulated and no
        // sweep happened in the last minute.
        if !self.stop
            && ((alloc > 0 && alloc_track::allocated() == alloc)
                || (alloc_track::allocated() > 8 * 1024 * 1024
                    && alloc_track::allocated() * 5 > alloc_track::in_use())
                || (now - self.last_sweep > 60
                    && alloc_track::allocated() >= 131072))
        {
            for hook in &mut self.sweep_hooks {
                hook();
            }
            alloc_track::note_sweep();
            self.last_sweep = Utc::now().timestamp();
        }

        graph::set("memory-used", alloc_track::in_use() as u64);

        // Run every timer whose deadline has passed. Timers are one-shot.
        self.fire_due_timers(now);

        if !dispatchable {
            return;
        }

        let ready: Vec<(usize, bool, bool)> = fds
            .iter()
            .zip(fd_conn.iter())
            .map(|(pfd, &ix)| {
                let revents = pfd.revents().unwrap_or(PollFlags::empty());
                (
                    ix,
                    revents.intersects(
                        PollFlags::POLLIN
                            | PollFlags::POLLHUP
                            | PollFlags::POLLERR,
                    ),
                    revents.contains(PollFlags::POLLOUT),
                )
            })
            .collect();

        let mut spawned = Vec::new();
        let mut dead = Vec::new();
        for (ix, r, w) in ready {
            let m = &mut self.connections[ix];
            if m.connection.fd() >= 0 {
                dispatch(m, r, w, now);
                spawned.append(&mut m.reactor.take_spawned());
            }
            if !m.connection.valid() {
                dead.push(m.connection.fd());
            }
        }

        self.connections.retain(|c| c.connection.valid());
        if !dead.is_empty() {
            self.set_connection_counts();
        }
        for m in spawned {
            self.add_connection(m);
        }
    }

    fn fire_due_timers(&mut self, now: i64) {
        loop {
            let ix = match self.timers.iter().position(|t| t.deadline <= now)
            {
                Some(ix) => ix,
                None => return,
            };
            let mut timer = self.timers.remove(ix);
            (timer.callback)();
        }
    }

    fn probe_connections(&mut self) {
        let mut removed = false;
        self.connections.retain_mut(|m| {
            let c = &mut m.connection;
            if c.probe() {
                true
            } else {
                if State::Closing == c.state() {
                    // closed by the peer while we were closing it; smile
                    // and go on our way.
                } else {
                    error!(
                        "Socket {} was unexpectedly closed, removing {}",
                        c.fd(),
                        c.description()
                    );
                }
                c.close();
                removed = true;
                false
            }
        });
        if removed {
            self.set_connection_counts();
        }
    }

    /// Publishes per-type connection counts. Skipped until a listener
    /// exists; before that the process is still wiring itself up.
    fn set_connection_counts(&self) {
        let mut imap = 0u64;
        let mut pop3 = 0u64;
        let mut smtp = 0u64;
        let mut http = 0u64;
        let mut db = 0u64;
        let mut other = 0u64;
        let mut internal = 0u64;
        let mut listeners = false;

        for m in &self.connections {
            match m.connection.ctype() {
                Type::ImapServer => imap += 1,
                Type::Pop3Server => pop3 += 1,
                Type::SmtpServer => smtp += 1,
                Type::HttpServer => http += 1,
                Type::DatabaseClient => db += 1,
                Type::ManageSieveServer => other += 1,
                Type::LogClient | Type::Client | Type::Pipe => internal += 1,
                Type::Listener => listeners = true,
            }
        }

        if !listeners {
            return;
        }

        graph::set("imap-connections", imap);
        graph::set("pop3-connections", pop3);
        graph::set("smtp-connections", smtp);
        graph::set("http-connections", http);
        graph::set("db-connections", db);
        graph::set("other-connections", other);
        graph::set("internal-connections", internal);
    }
}

/// Delivers events to one connection based on readiness and the clock.
fn dispatch(m: &mut Managed, r: bool, w: bool, now: i64) {
    let Managed {
        connection: c,
        reactor,
    } = m;

    let mut r = r;
    let mut w = w;

    let result: Result<(), crate::support::error::Error> = (|| {
        if c.timeout() != 0 && now >= c.timeout() {
            c.set_timeout(0);
            reactor.react(c, Event::Timeout)?;
            w = true;
        }

        if State::Connecting == c.state() {
            let mut connected = false;
            let mut errored = false;

            if (w && !r) || c.is_pending(Event::Connect) {
                connected = true;
            } else if c.is_pending(Event::Error) {
                errored = true;
            } else if w && r {
                // Either a connection error or a successful connect with
                // data already waiting; SO_ERROR disambiguates.
                if 0 == c.socket_error() {
                    connected = true;
                } else {
                    errored = true;
                }
            }

            c.clear_pending();

            if connected {
                c.set_state(State::Connected);
                reactor.react(c, Event::Connect)?;
                w = true;
            } else if errored {
                reactor.react(c, Event::Error)?;
                c.set_state(State::Closing);
                r = false;
                w = false;
            }
        }

        if r {
            c.read()?;
            reactor.react(c, Event::Read)?;

            if !c.can_read() {
                c.set_state(State::Closing);
                reactor.react(c, Event::Close)?;
            }

            w = true;
        }

        if w {
            c.write();
            if c.write_buffer_errored() {
                c.set_state(State::Closing);
                reactor.react(c, Event::Close)?;
            }
        }

        Ok(())
    })();

    if let Err(e) = result {
        error!("Error processing {}: {}", c.description(), e);
        c.close();
    }

    if State::Closing == c.state() && !c.can_write() {
        c.close();
    }
}

/// Accepts sockets from a bound listener and hands each one to `accepted`.
pub struct ListenerReactor<F> {
    accepted: F,
    spawned: Vec<Managed>,
}

impl<F: FnMut(i32) -> Option<Managed>> ListenerReactor<F> {
    pub fn new(accepted: F) -> Self {
        ListenerReactor {
            accepted,
            spawned: Vec::new(),
        }
    }
}

impl<F: FnMut(i32) -> Option<Managed>> Reactor for ListenerReactor<F> {
    fn react(
        &mut self,
        connection: &mut Connection,
        event: Event,
    ) -> Result<(), crate::support::error::Error> {
        if Event::Read == event {
            loop {
                match nix::sys::socket::accept(connection.fd()) {
                    Ok(fd) => {
                        if let Some(m) = (self.accepted)(fd) {
                            self.spawned.push(m);
                        }
                    },
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
                    Err(e) => {
                        info!("accept() failed: {}", e);
                        break;
                    },
                }
            }
        }
        Ok(())
    }

    fn take_spawned(&mut self) -> Vec<Managed> {
        std::mem::take(&mut self.spawned)
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use nix::unistd;

    use super::*;
    use crate::support::error::Error;

    struct Recorder {
        events: Rc<RefCell<Vec<Event>>>,
    }

    impl Reactor for Recorder {
        fn react(
            &mut self,
            _connection: &mut Connection,
            event: Event,
        ) -> Result<(), Error> {
            self.events.borrow_mut().push(event);
            Ok(())
        }
    }

    fn managed_pipe_reader(
        events: Rc<RefCell<Vec<Event>>>,
    ) -> (Managed, i32) {
        let (rd, wr) = unistd::pipe().unwrap();
        let mut connection =
            Connection::new(rd, Type::Pipe, "test reader").unwrap();
        connection.set_state(State::Connected);
        (
            Managed {
                connection,
                reactor: Box::new(Recorder { events }),
            },
            wr,
        )
    }

    #[test]
    fn read_event_dispatched() {
        crate::init_test_log();

        let events = Rc::new(RefCell::new(Vec::new()));
        let (managed, wr) = managed_pipe_reader(Rc::clone(&events));

        let mut el = EventLoop::new();
        el.add_connection(managed);

        unistd::write(wr, b"ping").unwrap();
        el.step(1);

        assert_eq!(vec![Event::Read], *events.borrow());
        let _ = unistd::close(wr);
    }

    #[test]
    fn peer_close_dispatches_close_and_removes() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let (managed, wr) = managed_pipe_reader(Rc::clone(&events));

        let mut el = EventLoop::new();
        el.add_connection(managed);

        unistd::close(wr).unwrap();
        el.step(1);

        assert_eq!(vec![Event::Read, Event::Close], *events.borrow());
        assert_eq!(0, el.connection_count());
    }

    #[test]
    fn timeout_event() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let (mut managed, wr) = managed_pipe_reader(Rc::clone(&events));
        managed.connection.set_timeout(Utc::now().timestamp() - 1);

        let mut el = EventLoop::new();
        el.add_connection(managed);
        el.step(0);

        assert!(events.borrow().contains(&Event::Timeout));
        let _ = unistd::close(wr);
    }

    #[test]
    fn timers_fire_once() {
        let fired = Rc::new(RefCell::new(0));
        let mut el = EventLoop::new();

        let f = Rc::clone(&fired);
        el.add_timer(Utc::now().timestamp() - 1, move || {
            *f.borrow_mut() += 1;
        });

        el.step(0);
        el.step(0);
        assert_eq!(1, *fired.borrow());
    }

    #[test]
    fn removed_timer_never_fires() {
        let fired = Rc::new(RefCell::new(0));
        let mut el = EventLoop::new();

        let f = Rc::clone(&fired);
        let id = el.add_timer(Utc::now().timestamp() - 1, move || {
            *f.borrow_mut() += 1;
        });
        el.remove_timer(id);

        el.step(0);
        assert_eq!(0, *fired.borrow());
    }

    #[test]
    fn duplicate_add_is_noop() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let (managed, wr) = managed_pipe_reader(Rc::clone(&events));
        let fd = managed.connection.fd();

        let mut el = EventLoop::new();
        el.add_connection(managed);
        assert_eq!(1, el.connection_count());

        let (rd2, wr2) = unistd::pipe().unwrap();
        let _ = unistd::close(rd2);
        let dup = Managed {
            connection: {
                // A distinct connection claiming the same FD.
                let mut c =
                    Connection::new(fd, Type::Pipe, "duplicate").unwrap();
                c.set_state(State::Connected);
                c
            },
            reactor: Box::new(Recorder {
                events: Rc::clone(&events),
            }),
        };
        el.add_connection(dup);
        assert_eq!(1, el.connection_count());

        let _ = unistd::close(wr);
        let _ = unistd::close(wr2);
    }

    #[test]
    fn add_after_stop_is_ignored() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let (managed, wr) = managed_pipe_reader(events);

        let mut el = EventLoop::new();
        el.stop();
        el.add_connection(managed);
        assert_eq!(0, el.connection_count());
        let _ = unistd::close(wr);
    }

    #[test]
    fn startup_mode_excludes_listeners_from_read_set() {
        // A listener in startup mode must not be polled for reads; with a
        // pending connection this would otherwise dispatch. We can't bind
        // real sockets portably in unit tests, so assert on the flag
        // plumbing instead.
        let mut el = EventLoop::new();
        assert!(!el.in_startup());
        el.set_startup(true);
        assert!(el.in_startup());
        el.set_startup(false);
        assert!(!el.in_startup());
    }
}
