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

//! The mailbox registry: an in-memory tree mirroring the `mailboxes`
//! table.
//!
//! Every persisted mailbox's ancestor chain is materialised, synthesising
//! `Synthetic` interior nodes where no database row exists. Nodes refer to
//! each other by index into the registry's arena; nothing here holds a
//! raw back-pointer. The registry also owns the per-mailbox fetcher cache
//! and the uid-keyed message cache shared by all of a mailbox's sessions,
//! plus the watcher list notified when `uidnext` advances.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use chrono::prelude::*;
use log::debug;

use crate::db::query::Query;
use crate::db::transaction::Transaction;
use crate::db::Connection;
use crate::support::error::Error;
use crate::support::mailbox_paths::{canonical, parse_mailbox_path};

use super::fetcher::FetcherRef;
use super::message::{Message, MessageRef};
use super::model::{MailboxId, Uid, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxType {
    /// In-memory only, connecting the tree.
    Synthetic,
    Ordinary,
    Deleted,
    View,
}

/// Index of a node in the registry arena.
pub type Mbx = usize;

/// Callback registered against a mailbox, invoked when `uidnext`
/// advances.
pub trait Watcher {
    fn uidnext_changed(&mut self, mailbox: Mbx, uidnext: u32);
}

pub type WatcherRef = Rc<RefCell<dyn Watcher>>;

pub struct MailboxNode {
    name: String,
    mtype: MailboxType,
    id: Option<MailboxId>,
    uidvalidity: u32,
    uidnext: u32,
    owner: Option<UserId>,
    parent: Option<Mbx>,
    children: Vec<Mbx>,
    watchers: Vec<(u64, WatcherRef)>,
    fetchers: HashMap<super::fetcher::FetchType, FetcherRef>,
    messages: BTreeMap<u32, MessageRef>,
}

impl MailboxNode {
    fn new(name: String, parent: Option<Mbx>) -> Self {
        MailboxNode {
            name,
            mtype: MailboxType::Synthetic,
            id: None,
            uidvalidity: 0,
            uidnext: 0,
            owner: None,
            parent,
            children: Vec::new(),
            watchers: Vec::new(),
            fetchers: HashMap::new(),
            messages: BTreeMap::new(),
        }
    }
}

pub struct Registry {
    nodes: Vec<MailboxNode>,
    by_id: HashMap<i64, Mbx>,
    next_watcher_token: u64,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            nodes: vec![MailboxNode::new("/".to_owned(), None)],
            by_id: HashMap::new(),
            next_watcher_token: 1,
        }
    }

    /// Builds the tree from the `mailboxes` table.
    pub fn setup(cxn: &mut Connection) -> Result<Registry, Error> {
        let mut r = Registry::new();
        r.refresh(cxn, None)?;
        Ok(r)
    }

    /// Reloads every row, or just the named mailbox.
    pub fn refresh(
        &mut self,
        cxn: &mut Connection,
        name: Option<&str>,
    ) -> Result<(), Error> {
        let q = match name {
            None => Query::new(
                "select m.`id`, m.`name`, m.`owner`, m.`uidnext`, \
                 m.`uidvalidity`, m.`deleted`, v.`source` as `view_source` \
                 from `mailboxes` m \
                 left join `views` v on (m.`id` = v.`view`)",
            ),
            Some(name) => {
                let q = Query::new(
                    "select m.`id`, m.`name`, m.`owner`, m.`uidnext`, \
                     m.`uidvalidity`, m.`deleted`, \
                     v.`source` as `view_source` \
                     from `mailboxes` m \
                     left join `views` v on (m.`id` = v.`view`) \
                     where m.`name` = $1",
                );
                q.borrow_mut().bind(name);
                q
            },
        };

        cxn.run(&mut q.borrow_mut());
        if let Some(e) = q.borrow().error() {
            return Err(Error::QueryFailed(e.to_owned()));
        }

        let mut q = q.borrow_mut();
        while let Some(row) = q.next_row() {
            let name = row.get_string("name");
            let m = match self.obtain(&name, true) {
                Some(m) => m,
                None => continue,
            };

            let node = &mut self.nodes[m];
            node.name = name;
            let id = row.get_i64("id");
            node.id = Some(MailboxId(id));
            node.mtype = if row.get_bool("deleted") {
                MailboxType::Deleted
            } else if !row.is_null("view_source") {
                MailboxType::View
            } else {
                MailboxType::Ordinary
            };
            node.uidvalidity = row.get_u32("uidvalidity");
            node.owner = if row.is_null("owner") {
                None
            } else {
                Some(UserId(row.get_i64("owner")))
            };
            self.by_id.insert(id, m);
            self.set_uidnext(m, row.get_u32("uidnext"));
        }

        Ok(())
    }

    pub fn root(&self) -> Mbx {
        0
    }

    /// Obtains the node for `path`, creating `Synthetic` interior nodes as
    /// necessary when `create` is set.
    pub fn obtain(&mut self, path: &str, create: bool) -> Option<Mbx> {
        let path = canonical(path)?;
        if "/" == path {
            return Some(self.root());
        }

        let mut current = self.root();
        let mut walked = String::new();
        for segment in parse_mailbox_path(&path) {
            walked.push('/');
            walked.push_str(segment);

            let found = self.nodes[current]
                .children
                .iter()
                .copied()
                .find(|&c| {
                    last_segment(&self.nodes[c].name)
                        .eq_ignore_ascii_case(segment)
                });

            current = match found {
                Some(c) => c,
                None => {
                    if !create {
                        return None;
                    }
                    let ix = self.nodes.len();
                    self.nodes.push(MailboxNode::new(
                        walked.clone(),
                        Some(current),
                    ));
                    self.nodes[current].children.push(ix);
                    ix
                },
            };
        }

        Some(current)
    }

    /// Finds the persisted mailbox at `path`. Synthetic nodes are never
    /// returned; deleted ones only when `deleted` is set.
    pub fn find(&self, path: &str, deleted: bool) -> Option<Mbx> {
        let path = canonical(path)?;
        let mut current = self.root();
        if "/" != path {
            for segment in parse_mailbox_path(&path) {
                current = self.nodes[current]
                    .children
                    .iter()
                    .copied()
                    .find(|&c| {
                        last_segment(&self.nodes[c].name)
                            .eq_ignore_ascii_case(segment)
                    })?;
            }
        }

        match self.nodes[current].mtype {
            MailboxType::Synthetic => None,
            MailboxType::Deleted if !deleted => None,
            _ => Some(current),
        }
    }

    pub fn find_id(&self, id: MailboxId) -> Option<Mbx> {
        self.by_id.get(&id.0).copied()
    }

    /// The closest existing ancestor usable as a parent for `path`.
    pub fn closest_parent(&self, path: &str) -> Option<Mbx> {
        let path = canonical(path)?;
        let mut current = self.root();
        let mut good = self.root();

        for segment in parse_mailbox_path(&path) {
            let next = self.nodes[current].children.iter().copied().find(
                |&c| {
                    last_segment(&self.nodes[c].name)
                        .eq_ignore_ascii_case(segment)
                },
            );
            match next {
                Some(c) if self.nodes[c].name != path => {
                    let n = &self.nodes[c];
                    if MailboxType::Deleted != n.mtype
                        && (MailboxType::Synthetic != n.mtype
                            || is_home(&n.name))
                    {
                        good = c;
                    }
                    current = c;
                },
                _ => break,
            }
        }

        Some(good)
    }

    pub fn name(&self, m: Mbx) -> &str {
        &self.nodes[m].name
    }

    pub fn mailbox_type(&self, m: Mbx) -> MailboxType {
        self.nodes[m].mtype
    }

    pub fn synthetic(&self, m: Mbx) -> bool {
        MailboxType::Synthetic == self.nodes[m].mtype
    }

    pub fn deleted(&self, m: Mbx) -> bool {
        MailboxType::Deleted == self.nodes[m].mtype
    }

    pub fn view(&self, m: Mbx) -> bool {
        MailboxType::View == self.nodes[m].mtype
    }

    pub fn id(&self, m: Mbx) -> Option<MailboxId> {
        self.nodes[m].id
    }

    pub fn uidvalidity(&self, m: Mbx) -> u32 {
        self.nodes[m].uidvalidity
    }

    pub fn uidnext(&self, m: Mbx) -> u32 {
        self.nodes[m].uidnext
    }

    pub fn owner(&self, m: Mbx) -> Option<UserId> {
        self.nodes[m].owner
    }

    pub fn parent(&self, m: Mbx) -> Option<Mbx> {
        self.nodes[m].parent
    }

    pub fn children(&self, m: Mbx) -> &[Mbx] {
        &self.nodes[m].children
    }

    /// Whether `m` has at least one real, existing descendant.
    pub fn has_children(&self, m: Mbx) -> bool {
        self.nodes[m].children.iter().any(|&c| {
            let n = &self.nodes[c];
            (MailboxType::Deleted != n.mtype
                && MailboxType::Synthetic != n.mtype)
                || self.has_children(c)
        })
    }

    /// Advances `uidnext` and notifies the watchers.
    ///
    /// This is the only mutator of `uidnext`; callers are the row reloads
    /// driven by the advance events. The value never decreases.
    pub fn set_uidnext(&mut self, m: Mbx, uidnext: u32) {
        if uidnext <= self.nodes[m].uidnext {
            return;
        }
        self.nodes[m].uidnext = uidnext;

        let watchers: Vec<WatcherRef> = self.nodes[m]
            .watchers
            .iter()
            .map(|(_, w)| Rc::clone(w))
            .collect();
        for w in watchers {
            w.borrow_mut().uidnext_changed(m, uidnext);
        }
    }

    pub fn add_watcher(&mut self, m: Mbx, w: WatcherRef) -> u64 {
        let token = self.next_watcher_token;
        self.next_watcher_token += 1;
        self.nodes[m].watchers.push((token, w));
        token
    }

    pub fn remove_watcher(&mut self, m: Mbx, token: u64) {
        self.nodes[m].watchers.retain(|(t, _)| *t != token);
    }

    #[cfg(test)]
    pub fn watcher_count(&self, m: Mbx) -> usize {
        self.nodes[m].watchers.len()
    }

    /// The message with `uid` in this mailbox, creating the in-memory
    /// object on demand. Synthetic and deleted mailboxes hold no
    /// messages.
    pub fn message(
        &mut self,
        m: Mbx,
        uid: Uid,
        create: bool,
    ) -> Option<MessageRef> {
        match self.nodes[m].mtype {
            MailboxType::Synthetic | MailboxType::Deleted => return None,
            _ => (),
        }

        let uid_raw: u32 = uid.into();
        if let Some(existing) = self.nodes[m].messages.get(&uid_raw) {
            return Some(Rc::clone(existing));
        }
        if !create {
            return None;
        }

        let mut msg = Message::new();
        msg.set_uid(uid);
        let msg = msg.shared();
        self.nodes[m].messages.insert(uid_raw, Rc::clone(&msg));
        Some(msg)
    }

    /// Forgets the cached message objects. Interacts poorly with fetchers
    /// that are still running, so the sweep skips mailboxes with one.
    pub fn clear_messages(&mut self, m: Mbx) {
        self.nodes[m].messages.clear();
    }

    /// One fetcher per data class per mailbox, shared by every session on
    /// the mailbox.
    pub fn fetcher(
        &mut self,
        m: Mbx,
        class: super::fetcher::FetchType,
        make: impl FnOnce() -> FetcherRef,
    ) -> FetcherRef {
        Rc::clone(
            self.nodes[m]
                .fetchers
                .entry(class)
                .or_insert_with(make),
        )
    }

    /// Makes the mailbox forget the fetcher for `class`; the next fetch
    /// creates a fresh one.
    pub fn forget_fetcher(
        &mut self,
        m: Mbx,
        class: super::fetcher::FetchType,
    ) {
        self.nodes[m].fetchers.remove(&class);
    }

    /// Event-loop sweep hook: drops completed fetchers and the message
    /// caches of mailboxes with no live fetcher.
    pub fn sweep(&mut self) {
        for node in &mut self.nodes {
            node.fetchers.retain(|_, f| !f.borrow().done());
            if node.fetchers.is_empty() && !node.messages.is_empty() {
                debug!("sweeping {} cached messages", node.messages.len());
                node.messages.clear();
            }
        }
    }

    /// Enqueues the statements that create this mailbox: an un-delete of
    /// the existing row, or a fresh insert with `uidnext=1,
    /// uidvalidity=1`. Returns false if the mailbox already exists.
    ///
    /// The caller owns the transaction and must `refresh` after it
    /// commits.
    pub fn enqueue_create(
        &self,
        t: &mut Transaction,
        m: Mbx,
        owner: Option<UserId>,
    ) -> bool {
        let node = &self.nodes[m];

        match node.mtype {
            MailboxType::Deleted => {
                let q = Query::new(
                    "update `mailboxes` set `deleted` = 0, `owner` = $2 \
                     where `id` = $1",
                );
                q.borrow_mut()
                    .bind(node.id.expect("deleted mailbox without id"))
                    .bind(owner.map(|u| u.0));
                t.enqueue(&q);
                true
            },
            MailboxType::Synthetic => {
                let q = Query::new(
                    "insert into `mailboxes` \
                     (`name`, `owner`, `uidnext`, `uidvalidity`, \
                      `nextmodseq`, `deleted`) \
                     values ($1, $2, 1, 1, 1, 0)",
                );
                q.borrow_mut()
                    .bind(node.name.as_str())
                    .bind(owner.map(|u| u.0));
                t.enqueue(&q);
                true
            },
            _ => false,
        }
    }

    /// Enqueues the statements that delete this mailbox: the row is
    /// marked deleted (preserving `uidvalidity` and the UID series), its
    /// messages move to `deleted_messages`, and permissions and views are
    /// purged. Returns false for synthetic or already-deleted mailboxes.
    pub fn enqueue_remove(&self, t: &mut Transaction, m: Mbx) -> bool {
        let node = &self.nodes[m];
        let id = match (node.mtype, node.id) {
            (MailboxType::Synthetic, _) | (MailboxType::Deleted, _) => {
                return false
            },
            (_, Some(id)) => id,
            (_, None) => return false,
        };

        let q = Query::new(
            "update `mailboxes` set `deleted` = 1, `owner` = null \
             where `id` = $1",
        );
        q.borrow_mut().bind(id);
        t.enqueue(&q);

        let q = Query::new(
            "insert into `deleted_messages` \
             (`mailbox`, `uid`, `message`, `deleted_by`, `deleted_at`, \
              `reason`) \
             select `mailbox`, `uid`, `message`, null, $2, \
                    'mailbox deleted' \
             from `mailbox_messages` where `mailbox` = $1",
        );
        q.borrow_mut().bind(id).bind(Utc::now().timestamp());
        t.enqueue(&q);

        let q =
            Query::new("delete from `mailbox_messages` where `mailbox` = $1");
        q.borrow_mut().bind(id);
        t.enqueue(&q);

        let q =
            Query::new("delete from `permissions` where `mailbox` = $1");
        q.borrow_mut().bind(id);
        t.enqueue(&q);

        let q = Query::new(
            "delete from `views` where `source` = $1 or `view` = $1",
        );
        q.borrow_mut().bind(id);
        t.enqueue(&q);

        true
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

fn last_segment(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// A user's home directory, e.g. `/users/ams`.
fn is_home(name: &str) -> bool {
    name.starts_with("/users/") && !name["/users/".len()..].contains('/')
}

#[cfg(test)]
mod test {
    use super::super::intern;
    use super::*;

    fn seeded() -> (Connection, Registry) {
        let _lock = intern::test_lock();
        let mut cxn = Connection::open_in_memory().unwrap();
        {
            let mut t = cxn.transaction().unwrap();
            for name in ["/users/alice/inbox", "/users/bob/inbox"] {
                let q = Query::new(
                    "insert into `mailboxes` (`name`) values ($1)",
                );
                q.borrow_mut().bind(name);
                t.enqueue(&q);
            }
            t.commit().unwrap();
        }
        let r = Registry::setup(&mut cxn).unwrap();
        (cxn, r)
    }

    #[test]
    fn tree_synthesis() {
        let (_cxn, mut r) = seeded();

        // The interior nodes exist but only in memory.
        let users = r.obtain("/users", false).unwrap();
        assert!(r.synthetic(users));
        assert_eq!(2, r.children(users).len());

        // A synthetic node is not a persisted mailbox.
        assert_eq!(None, r.find("/users", false));
        assert_eq!(None, r.find("/users", true));

        let alice = r.find("/users/alice/inbox", false).unwrap();
        assert_eq!(MailboxType::Ordinary, r.mailbox_type(alice));
        assert_eq!("/users/alice/inbox", r.name(alice));
        assert_eq!(1, r.uidnext(alice));
        assert_eq!(1, r.uidvalidity(alice));
        assert!(r.id(alice).is_some());

        // Lookup is case-insensitive per segment.
        assert_eq!(
            Some(alice),
            r.find("/Users/Alice/INBOX", false)
        );

        // The ancestor chain is connected to the root.
        let parent = r.parent(alice).unwrap();
        assert_eq!("/users/alice", r.name(parent));
        assert_eq!(users, r.parent(parent).unwrap());
        assert_eq!(r.root(), r.parent(users).unwrap());
    }

    #[test]
    fn find_by_id() {
        let (_cxn, r) = seeded();
        let alice = r.find("/users/alice/inbox", false).unwrap();
        let id = r.id(alice).unwrap();
        assert_eq!(Some(alice), r.find_id(id));
        assert_eq!(None, r.find_id(MailboxId(999_999)));
    }

    #[test]
    fn closest_parent_walk() {
        let (_cxn, r) = seeded();
        let alice = r.find("/users/alice/inbox", false).unwrap();

        // /users/alice is synthetic but a home directory, so it counts.
        let p = r.closest_parent("/users/alice/inbox/archive").unwrap();
        assert_eq!("/users/alice/inbox", r.name(p));
        let _ = alice;

        let p = r.closest_parent("/users/carol/anything").unwrap();
        assert_eq!(r.root(), p);
    }

    #[test]
    fn uidnext_is_monotonic_and_notifies() {
        use std::cell::RefCell;

        struct Recorder {
            seen: Vec<u32>,
        }
        impl Watcher for Recorder {
            fn uidnext_changed(&mut self, _m: Mbx, uidnext: u32) {
                self.seen.push(uidnext);
            }
        }

        let (_cxn, mut r) = seeded();
        let alice = r.find("/users/alice/inbox", false).unwrap();

        let rec = Rc::new(RefCell::new(Recorder { seen: Vec::new() }));
        let token = r.add_watcher(alice, rec.clone());

        r.set_uidnext(alice, 5);
        r.set_uidnext(alice, 3); // never decreases
        r.set_uidnext(alice, 5); // no-op
        r.set_uidnext(alice, 9);
        assert_eq!(9, r.uidnext(alice));
        assert_eq!(vec![5, 9], rec.borrow().seen);

        r.remove_watcher(alice, token);
        r.set_uidnext(alice, 12);
        assert_eq!(vec![5, 9], rec.borrow().seen);
        assert_eq!(0, r.watcher_count(alice));
    }

    #[test]
    fn message_cache_is_shared() {
        let (_cxn, mut r) = seeded();
        let alice = r.find("/users/alice/inbox", false).unwrap();

        let m1 = r.message(alice, Uid::u(4), true).unwrap();
        let m2 = r.message(alice, Uid::u(4), true).unwrap();
        assert!(Rc::ptr_eq(&m1, &m2));
        assert!(r.message(alice, Uid::u(5), false).is_none());

        let users = r.obtain("/users", false).unwrap();
        assert!(r.message(users, Uid::u(1), true).is_none());

        r.clear_messages(alice);
        assert!(r.message(alice, Uid::u(4), false).is_none());
    }

    #[test]
    fn create_and_remove_round_trip() {
        let (mut cxn, mut r) = seeded();

        let m = r.obtain("/users/alice/todo", true).unwrap();
        assert!(r.synthetic(m));

        {
            let mut t = cxn.transaction().unwrap();
            assert!(r.enqueue_create(&mut t, m, Some(UserId(42))));
            t.commit().unwrap();
        }
        r.refresh(&mut cxn, Some("/users/alice/todo")).unwrap();

        let m = r.find("/users/alice/todo", false).unwrap();
        assert_eq!(MailboxType::Ordinary, r.mailbox_type(m));
        assert_eq!(1, r.uidnext(m));
        let first_validity = r.uidvalidity(m);

        // Creating an existing mailbox enqueues nothing.
        {
            let mut t = cxn.transaction().unwrap();
            assert!(!r.enqueue_create(&mut t, m, None));
            t.rollback().unwrap();
        }

        // Removal marks it deleted but preserves the uid series.
        {
            let mut t = cxn.transaction().unwrap();
            assert!(r.enqueue_remove(&mut t, m));
            t.commit().unwrap();
        }
        r.refresh(&mut cxn, Some("/users/alice/todo")).unwrap();
        assert_eq!(None, r.find("/users/alice/todo", false));
        let m = r.find("/users/alice/todo", true).unwrap();
        assert!(r.deleted(m));

        // Re-creation resumes the same uidvalidity.
        {
            let mut t = cxn.transaction().unwrap();
            assert!(r.enqueue_create(&mut t, m, None));
            t.commit().unwrap();
        }
        r.refresh(&mut cxn, Some("/users/alice/todo")).unwrap();
        let m = r.find("/users/alice/todo", false).unwrap();
        assert_eq!(first_validity, r.uidvalidity(m));
    }

    #[test]
    fn fetcher_cache_is_shared_per_class() {
        use super::super::fetcher::{FetchType, Fetcher};

        let (_cxn, mut r) = seeded();
        let alice = r.find("/users/alice/inbox", false).unwrap();
        let id = r.id(alice).unwrap();

        let f1 =
            r.fetcher(alice, FetchType::Flags, || Fetcher::new(id).shared());
        let f2 =
            r.fetcher(alice, FetchType::Flags, || Fetcher::new(id).shared());
        assert!(Rc::ptr_eq(&f1, &f2));

        let f3 =
            r.fetcher(alice, FetchType::Body, || Fetcher::new(id).shared());
        assert!(!Rc::ptr_eq(&f1, &f3));

        r.forget_fetcher(alice, FetchType::Flags);
        let f4 =
            r.fetcher(alice, FetchType::Flags, || Fetcher::new(id).shared());
        assert!(!Rc::ptr_eq(&f1, &f4));
    }

    #[test]
    fn views_are_views() {
        let (mut cxn, _r) = seeded();
        {
            let mut t = cxn.transaction().unwrap();
            let q = Query::new(
                "insert into `mailboxes` (`name`) values ('/views/recent')",
            );
            t.enqueue(&q);
            let q = Query::new(
                "insert into `views` (`view`, `source`) \
                 select m.`id`, s.`id` from `mailboxes` m, `mailboxes` s \
                 where m.`name` = '/views/recent' \
                   and s.`name` = '/users/alice/inbox'",
            );
            t.enqueue(&q);
            t.commit().unwrap();
        }

        let mut r = Registry::new();
        r.refresh(&mut cxn, None).unwrap();
        let v = r.find("/views/recent", false).unwrap();
        assert!(r.view(v));
        assert_eq!(MailboxType::View, r.mailbox_type(v));

        let inbox = r.find("/users/alice/inbox", false).unwrap();
        assert!(!r.view(inbox));
    }

    #[test]
    fn has_children_skips_synthetic_and_deleted() {
        let (mut cxn, mut r) = seeded();
        let users = r.obtain("/users", false).unwrap();
        assert!(r.has_children(users));

        // Delete both inboxes; /users no longer has real children.
        for name in ["/users/alice/inbox", "/users/bob/inbox"] {
            let m = r.find(name, false).unwrap();
            let mut t = cxn.transaction().unwrap();
            r.enqueue_remove(&mut t, m);
            t.commit().unwrap();
        }
        r.refresh(&mut cxn, None).unwrap();
        assert!(!r.has_children(users));
    }
}
