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

//! Per-client views onto a mailbox.
//!
//! A session owns the UID to message-sequence-number bijection its client
//! sees, the pending EXISTS/EXPUNGE deltas, and the client's last-seen
//! modseq. Sessions subscribe to their mailbox's watcher list; a
//! `uidnext` advance marks the session dirty, and the protocol layer
//! resynchronises it with the then-visible UIDs at a safe point in its
//! dialogue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::mailbox::{Mbx, Registry, Watcher};
use super::model::{Modseq, Uid};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The mailbox now holds this many messages.
    Exists(u32),
    /// The message at `msn` (at emission time) is gone.
    Expunge { msn: u32, uid: Uid },
}

pub struct Session {
    mailbox: Mbx,
    uids: Vec<Uid>,
    pending: VecDeque<SessionEvent>,
    last_seen_modseq: Modseq,
    stream_annotations: bool,
    advanced_uidnext: Option<u32>,
    watcher_token: Option<u64>,
}

pub type SessionRef = Rc<RefCell<Session>>;

impl Session {
    pub fn new(mailbox: Mbx) -> SessionRef {
        Rc::new(RefCell::new(Session {
            mailbox,
            uids: Vec::new(),
            pending: VecDeque::new(),
            last_seen_modseq: Modseq::MIN,
            stream_annotations: false,
            advanced_uidnext: None,
            watcher_token: None,
        }))
    }

    /// Subscribes the session to its mailbox's uidnext advances.
    pub fn attach(session: &SessionRef, registry: &mut Registry) {
        let mailbox = session.borrow().mailbox;
        let token =
            registry.add_watcher(mailbox, Rc::clone(session) as _);
        session.borrow_mut().watcher_token = Some(token);
    }

    /// Unsubscribes; called when the client goes away.
    pub fn close(&mut self, registry: &mut Registry) {
        if let Some(token) = self.watcher_token.take() {
            registry.remove_watcher(self.mailbox, token);
        }
    }

    pub fn mailbox(&self) -> Mbx {
        self.mailbox
    }

    pub fn count(&self) -> u32 {
        self.uids.len() as u32
    }

    /// The message sequence number of `uid`, 1-based.
    pub fn msn(&self, uid: Uid) -> Option<u32> {
        self.uids
            .binary_search(&uid)
            .ok()
            .map(|ix| ix as u32 + 1)
    }

    /// The UID at sequence number `msn`.
    pub fn uid(&self, msn: u32) -> Option<Uid> {
        if 0 == msn {
            return None;
        }
        self.uids.get(msn as usize - 1).copied()
    }

    pub fn uids(&self) -> &[Uid] {
        &self.uids
    }

    pub fn last_seen_modseq(&self) -> Modseq {
        self.last_seen_modseq
    }

    pub fn set_last_seen_modseq(&mut self, modseq: Modseq) {
        self.last_seen_modseq = modseq;
    }

    pub fn stream_annotations(&self) -> bool {
        self.stream_annotations
    }

    pub fn set_stream_annotations(&mut self, stream: bool) {
        self.stream_annotations = stream;
    }

    /// Whether a uidnext advance arrived since the last `update`.
    pub fn needs_update(&self) -> bool {
        self.advanced_uidnext.is_some()
    }

    /// Replaces the visible UID set, queueing the deltas the client must
    /// hear about.
    ///
    /// Expunges are emitted in ascending UID order with the sequence
    /// numbers valid at emission time, so an EXPUNGE for UID `u` never
    /// follows an event for a message with a UID above `u`. A trailing
    /// EXISTS is queued when the count changed.
    pub fn update(&mut self, now_visible: &[Uid]) {
        self.advanced_uidnext = None;

        let old_count = self.uids.len();
        let mut new_it = now_visible.iter().peekable();
        let mut msn = 0u32;

        for &uid in &self.uids {
            while new_it.peek().map_or(false, |&&n| n < uid) {
                new_it.next();
            }
            if new_it.peek().map_or(false, |&&n| n == uid) {
                msn += 1;
                new_it.next();
            } else {
                // Gone; its sequence number at this instant is one past
                // the survivors counted so far.
                self.pending.push_back(SessionEvent::Expunge {
                    msn: msn + 1,
                    uid,
                });
            }
        }

        self.uids = now_visible.to_vec();
        self.uids.sort_unstable();
        self.uids.dedup();

        if self.uids.len() != old_count
            || self
                .pending
                .iter()
                .any(|e| matches!(e, SessionEvent::Expunge { .. }))
        {
            self.pending
                .push_back(SessionEvent::Exists(self.uids.len() as u32));
        }
    }

    /// The next queued event, in emission order.
    pub fn next_event(&mut self) -> Option<SessionEvent> {
        self.pending.pop_front()
    }
}

impl Watcher for Session {
    fn uidnext_changed(&mut self, _mailbox: Mbx, uidnext: u32) {
        self.advanced_uidnext = Some(uidnext);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn uids(raw: &[u32]) -> Vec<Uid> {
        raw.iter().map(|&u| Uid::u(u)).collect()
    }

    #[test]
    fn msn_bijection() {
        let s = Session::new(0);
        s.borrow_mut().update(&uids(&[2, 5, 9]));
        // Initial population queues an EXISTS.
        assert_eq!(
            Some(SessionEvent::Exists(3)),
            s.borrow_mut().next_event()
        );

        let s = s.borrow();
        assert_eq!(3, s.count());
        assert_eq!(Some(1), s.msn(Uid::u(2)));
        assert_eq!(Some(2), s.msn(Uid::u(5)));
        assert_eq!(Some(3), s.msn(Uid::u(9)));
        assert_eq!(None, s.msn(Uid::u(4)));

        assert_eq!(Some(Uid::u(2)), s.uid(1));
        assert_eq!(Some(Uid::u(9)), s.uid(3));
        assert_eq!(None, s.uid(0));
        assert_eq!(None, s.uid(4));
    }

    #[test]
    fn expunge_ordering() {
        let s = Session::new(0);
        s.borrow_mut().update(&uids(&[1, 2, 3, 4, 5]));
        let _ = s.borrow_mut().next_event();

        // 2 and 4 vanish; 6 appears.
        s.borrow_mut().update(&uids(&[1, 3, 5, 6]));

        let mut events = Vec::new();
        while let Some(e) = s.borrow_mut().next_event() {
            events.push(e);
        }

        // Ascending UID order; the msn of 4 already accounts for 2 being
        // gone.
        assert_eq!(
            vec![
                SessionEvent::Expunge { msn: 2, uid: Uid::u(2) },
                SessionEvent::Expunge { msn: 3, uid: Uid::u(4) },
                SessionEvent::Exists(4),
            ],
            events
        );

        // An expunge for UID u never follows an event whose UID exceeds
        // u.
        let mut max_seen = 0;
        for e in &events {
            if let SessionEvent::Expunge { uid, .. } = e {
                assert!(u32::from(*uid) >= max_seen);
                max_seen = (*uid).into();
            }
        }
    }

    #[test]
    fn no_changes_queue_nothing() {
        let s = Session::new(0);
        s.borrow_mut().update(&uids(&[1, 2]));
        let _ = s.borrow_mut().next_event();

        s.borrow_mut().update(&uids(&[1, 2]));
        assert_eq!(None, s.borrow_mut().next_event());
    }

    #[test]
    fn modseq_and_annotation_state() {
        let s = Session::new(0);
        let mut s = s.borrow_mut();
        assert_eq!(Modseq::MIN, s.last_seen_modseq());
        s.set_last_seen_modseq(Modseq(42));
        assert_eq!(Modseq(42), s.last_seen_modseq());

        assert!(!s.stream_annotations());
        s.set_stream_annotations(true);
        assert!(s.stream_annotations());
    }
}
