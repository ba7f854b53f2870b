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

//! The `serve` command: database, registry, listeners, event loop.
//!
//! The protocol dialogues themselves live above this layer; a connection
//! accepted here gets a reactor that greets, keeps the session state
//! alive, and says goodbye. Wiring a real front-end means replacing
//! `GreeterReactor` with one that drives a session against the store.

use std::cell::RefCell;
use std::net::TcpListener;
use std::os::unix::io::IntoRawFd;
use std::path::Path;
use std::rc::Rc;

use chrono::Utc;
use log::info;

use crate::db::Connection as Db;
use crate::net::connection::{Connection, Event, Reactor, State, Type};
use crate::net::event_loop::{EventLoop, ListenerReactor, Managed};
use crate::store::intern;
use crate::store::mailbox::Registry;
use crate::support::error::Error;

const IDLE_TIMEOUT_SECS: i64 = 1800;

/// A placeholder front-end: greets, answers nothing, closes politely on
/// input or shutdown.
struct GreeterReactor;

impl Reactor for GreeterReactor {
    fn react(
        &mut self,
        connection: &mut Connection,
        event: Event,
    ) -> Result<(), Error> {
        match event {
            Event::Connect => {
                connection.enqueue(b"* OK arcmail archive server ready\r\n");
            },
            Event::Read => {
                connection.read_buffer().take_all();
                connection
                    .enqueue(b"* BYE this listener speaks no protocol yet\r\n");
                connection.set_state(State::Closing);
            },
            Event::Timeout | Event::Shutdown => {
                connection.enqueue(b"* BYE\r\n");
                connection.set_state(State::Closing);
            },
            Event::Close | Event::Error => (),
        }
        Ok(())
    }
}

pub fn serve(db: &Path, listen: &str) -> Result<(), Error> {
    let mut cxn = Db::open(db)?;
    intern::setup(&mut cxn)?;
    let registry = Rc::new(RefCell::new(Registry::setup(&mut cxn)?));

    let mut el = EventLoop::new();
    el.set_startup(true);

    let listener = TcpListener::bind(listen)?;
    info!("listening on {}", listen);
    let listener_fd = listener.into_raw_fd();
    let mut listener_conn = Connection::new(
        listener_fd,
        Type::Listener,
        format!("listener {}", listen),
    )?;
    listener_conn.set_state(State::Connected);

    el.add_connection(Managed {
        connection: listener_conn,
        reactor: Box::new(ListenerReactor::new(move |fd| {
            let mut connection = Connection::new(
                fd,
                Type::ImapServer,
                format!("imap client on fd {}", fd),
            )
            .ok()?;
            // Dispatch resolves the pending Connect into the greeting.
            connection.set_state(State::Connecting);
            connection
                .set_timeout(Utc::now().timestamp() + IDLE_TIMEOUT_SECS);
            connection.push_pending(Event::Connect);
            Some(Managed {
                connection,
                reactor: Box::new(GreeterReactor),
            })
        })),
    });

    {
        let registry = Rc::clone(&registry);
        el.add_sweep_hook(move || {
            registry.borrow_mut().sweep();
        });
    }

    el.set_startup(false);
    el.run();
    Ok(())
}
