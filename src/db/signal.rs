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

//! Named database signal channels.
//!
//! The channel set mirrors the server's notification contract:
//! `flag_names_extended`, `field_names_extended` and
//! `annotation_names_extended` fire after a helper-row creator inserts new
//! dictionary rows, and `obliterated` fires after mass deletion so intern
//! tables reload. With an embedded store all peers are in-process; a
//! wire-protocol store would put LISTEN/NOTIFY behind the same two calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use log::debug;

type Callback = Arc<dyn Fn() + Send + Sync>;

lazy_static! {
    static ref CHANNELS: Mutex<HashMap<String, Vec<Callback>>> =
        Mutex::new(HashMap::new());
}

/// Registers `f` to run whenever `channel` is notified.
pub fn subscribe(channel: &str, f: impl Fn() + Send + Sync + 'static) {
    CHANNELS
        .lock()
        .unwrap()
        .entry(channel.to_owned())
        .or_default()
        .push(Arc::new(f));
}

/// Fires `channel`, running every subscriber.
///
/// Subscribers run outside the registry lock so they may notify further
/// channels.
pub fn notify(channel: &str) {
    debug!("notify {}", channel);

    let subscribers = CHANNELS
        .lock()
        .unwrap()
        .get(channel)
        .map(|v| v.to_vec())
        .unwrap_or_default();

    for f in subscribers {
        f();
    }
}
