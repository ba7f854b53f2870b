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

//! Named numeric gauges.
//!
//! The event loop publishes memory use and per-type connection counts here;
//! anything that can render numbers (the status exporter, tests) reads them
//! back by name.

use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;

lazy_static! {
    static ref GAUGES: Mutex<HashMap<&'static str, u64>> =
        Mutex::new(HashMap::new());
}

/// Sets the gauge `name` to `value`, creating it if needed.
pub fn set(name: &'static str, value: u64) {
    GAUGES.lock().unwrap().insert(name, value);
}

/// Returns the current value of the gauge `name`, or `None` if it has never
/// been set.
pub fn get(name: &str) -> Option<u64> {
    GAUGES.lock().unwrap().get(name).copied()
}

/// Returns a snapshot of every gauge.
pub fn all() -> Vec<(&'static str, u64)> {
    let mut v = GAUGES
        .lock()
        .unwrap()
        .iter()
        .map(|(&k, &n)| (k, n))
        .collect::<Vec<_>>();
    v.sort();
    v
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_and_get() {
        set("test-gauge", 42);
        assert_eq!(Some(42), get("test-gauge"));
        set("test-gauge", 7);
        assert_eq!(Some(7), get("test-gauge"));
        assert_eq!(None, get("never-set"));
    }
}
