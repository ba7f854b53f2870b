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

//! Per-connection byte queues.
//!
//! A `NetBuffer` is what sits between a socket and a protocol reducer: the
//! read side accumulates whatever arrived, the write side holds what has
//! not yet drained. The write side additionally latches the first I/O
//! error; connection dispatch checks it after every flush.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct NetBuffer {
    data: VecDeque<u8>,
    error: Option<String>,
}

impl NetBuffer {
    pub fn new() -> Self {
        NetBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend(bytes.iter().copied());
    }

    /// Returns the first contiguous chunk of buffered bytes.
    pub fn first_chunk(&self) -> &[u8] {
        self.data.as_slices().0
    }

    /// Removes `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        self.data.drain(..n.min(self.data.len()));
    }

    /// Removes and returns everything up to and including the next LF, if a
    /// complete line is buffered.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.data.iter().position(|&b| b'\n' == b)?;
        Some(self.data.drain(..=pos).collect())
    }

    /// Removes and returns the entire contents.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.data.drain(..).collect()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Latches `error`; only the first one sticks.
    pub fn set_error(&mut self, error: String) {
        self.error.get_or_insert(error);
    }
}
