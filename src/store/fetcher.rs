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

//! The fetcher: batched reconstruction of messages from the store.
//!
//! A fetcher serves one mailbox and a working set of messages, retrieving
//! any subset of the data classes. A small job (single class, or few
//! expected rows) runs one query per class against the selector directly;
//! anything larger first scans for `(uid, message id)` pairs and then
//! works through the set in batches sized to land near thirty seconds
//! each. One decoder per class applies rows to the matching messages,
//! looked up by database id through a fixed-size bucket table or by
//! advancing over the batch in UID order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::prelude::*;
use log::debug;

use crate::db::query::{Query, QueryRef, Row};
use crate::db::Connection;
use crate::mime::field::{FieldType, HeaderField};
use crate::mime::header::Header;

use super::intern::InternKind;
use super::message::{Annotation, Message, MessageRef};
use super::model::{MailboxId, MessageId, Modseq, UidSet, UserId};
use super::selector::Selector;

/// The data classes a fetcher can retrieve. Requesting `Body` implies
/// `PartNumbers`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FetchType {
    Flags,
    Annotations,
    Addresses,
    OtherHeader,
    Body,
    Trivia,
    PartNumbers,
}

static ALL_TYPES: [FetchType; 7] = [
    FetchType::Flags,
    FetchType::Annotations,
    FetchType::Addresses,
    FetchType::OtherHeader,
    FetchType::Body,
    FetchType::Trivia,
    FetchType::PartNumbers,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    NotStarted,
    Fetching,
    Done,
}

const BATCH_HASH_SIZE: usize = 1800;
const MAX_BATCH_SIZE: usize = 32768;

/// Shared handle to a fetcher; the mailbox cache and every session using
/// it hold one.
pub type FetcherRef = Rc<RefCell<Fetcher>>;

#[derive(Default)]
struct DecoderSlot {
    active: bool,
    query: Option<QueryRef>,
    find_by_id: bool,
    find_by_uid: bool,
}

pub struct Fetcher {
    mailbox: Option<MailboxId>,
    messages: VecDeque<MessageRef>,
    messages_remaining: usize,
    selector: Option<Selector>,
    state: State,
    slots: [DecoderSlot; 7],

    batch: Vec<Vec<MessageRef>>,
    batch_order: Vec<MessageRef>,
    batch_ids: String,
    batch_size: usize,
    max_batch_size: usize,
    unique_database_ids: bool,
    last_batch_started: i64,
}

impl Fetcher {
    /// A fetcher for `messages` (UID-keyed) in `mailbox`.
    pub fn new(mailbox: MailboxId) -> Fetcher {
        Fetcher {
            mailbox: Some(mailbox),
            messages: VecDeque::new(),
            messages_remaining: 0,
            selector: None,
            state: State::NotStarted,
            slots: Default::default(),

            batch: Vec::new(),
            batch_order: Vec::new(),
            batch_ids: String::new(),
            batch_size: 0,
            max_batch_size: MAX_BATCH_SIZE,
            unique_database_ids: true,
            last_batch_started: 0,
        }
    }

    /// A fetcher for one message addressed by database id. Such a fetcher
    /// can retrieve bodies, headers and addresses, but not the
    /// mailbox-keyed classes.
    pub fn for_message(message: MessageRef) -> Fetcher {
        let mut f = Fetcher {
            mailbox: None,
            ..Fetcher::new(MailboxId(0))
        };
        f.messages.push_back(message);
        f
    }

    pub fn shared(self) -> FetcherRef {
        Rc::new(RefCell::new(self))
    }

    /// Adds messages to the working set. The set stays sorted by UID for
    /// the uid-advance decoders.
    pub fn add_messages(
        &mut self,
        messages: impl IntoIterator<Item = MessageRef>,
    ) {
        self.messages.extend(messages);
        self.messages
            .make_contiguous()
            .sort_by_key(|m| m.borrow().uid());
    }

    pub fn set_selector(&mut self, selector: Selector) {
        self.selector = Some(selector);
    }

    fn slot(&self, t: FetchType) -> &DecoderSlot {
        &self.slots[t as usize]
    }

    fn slot_mut(&mut self, t: FetchType) -> &mut DecoderSlot {
        &mut self.slots[t as usize]
    }

    /// Instructs this fetcher to fetch data of type `t`.
    pub fn fetch(&mut self, t: FetchType) {
        self.slot_mut(t).active = true;
        if FetchType::Body == t {
            self.slot_mut(FetchType::PartNumbers).active = true;
        }
    }

    /// Whether this fetcher will fetch (or is fetching) type `t`.
    pub fn fetching(&self, t: FetchType) -> bool {
        self.slot(t).active
    }

    pub fn done(&self) -> bool {
        State::Done == self.state
    }

    fn active_types(&self) -> Vec<FetchType> {
        ALL_TYPES
            .iter()
            .copied()
            .filter(|&t| self.slot(t).active)
            .collect()
    }

    /// Runs the fetch to completion against `cxn`.
    pub fn execute(&mut self, cxn: &mut Connection) {
        if State::NotStarted == self.state {
            self.start(cxn);
        }
        while State::Fetching == self.state {
            self.run_batch(cxn);
        }
    }

    /// Classifies the job and either runs it as one query per class or
    /// prepares batched fetching.
    fn start(&mut self, cxn: &mut Connection) {
        let types = self.active_types();
        let n = types
            .iter()
            .filter(|&&t| {
                FetchType::PartNumbers != t
                    || !self.fetching(FetchType::Body)
            })
            .count();
        if 0 == n {
            self.state = State::Done;
            return;
        }

        debug!(
            "fetching {:?} for {} messages",
            types,
            self.messages.len()
        );

        if 1 == self.messages.len()
            && self.messages[0].borrow().database_id().is_some()
            && self.mailbox.is_none()
        {
            // Fetching one message by id, not UID; just do it.
            self.batch_size = 1;
            self.messages_remaining = 1;
            self.state = State::Fetching;
            return;
        }

        let mut set = UidSet::new();
        for m in &self.messages {
            if let Some(uid) = m.borrow().uid() {
                set.add(uid);
            }
        }
        let expected = set.len();

        // Use the extra scan query only when its savings pay for the
        // overhead.
        let simple = 1 == n
            || (set.is_range() && expected * n < 2000)
            || expected * n < 1000;

        if self.selector.is_none() {
            self.selector = Some(Selector::from_uid_set(set));
        }

        if simple {
            self.run_small_job(cxn);
            return;
        }

        self.batch_size = 1024;
        if self.fetching(FetchType::Body) {
            self.batch_size /= 2;
        }
        if self.fetching(FetchType::OtherHeader) {
            self.batch_size = self.batch_size * 2 / 3;
        }
        if self.fetching(FetchType::Addresses) {
            self.batch_size = self.batch_size * 3 / 4;
        }

        self.find_messages(cxn);
    }

    /// The pre-scan: resolve `(uid, message id[, modseq])` for the whole
    /// working set through the selector.
    fn find_messages(&mut self, cxn: &mut Connection) {
        let mailbox = match self.mailbox {
            Some(m) => m,
            None => {
                self.state = State::Done;
                return;
            },
        };

        let mut wanted = vec!["message", "uid"];
        let want_trivia = self.fetching(FetchType::Trivia);
        if want_trivia {
            wanted.push("modseq");
        }

        let q = self.selector.as_ref().expect("selector").query(
            None,
            mailbox,
            false,
            &wanted,
            true,
        );
        cxn.run(&mut q.borrow_mut());

        let mut mit = 0;
        let mut q = q.borrow_mut();
        while let Some(row) = q.next_row() {
            self.messages_remaining += 1;
            let uid = row.get_u32("uid");
            while mit < self.messages.len()
                && self.messages[mit]
                    .borrow()
                    .uid()
                    .map_or(true, |u| u32::from(u) < uid)
            {
                mit += 1;
            }
            if mit < self.messages.len() {
                let mut m = self.messages[mit].borrow_mut();
                m.set_database_id(MessageId(row.get_i64("message")));
                if want_trivia {
                    m.set_modseq(Modseq(row.get_i64("modseq") as u64));
                }
            }
        }

        self.state = State::Fetching;
    }

    /// One batch: size it, bucket it, query it, decode it, close it.
    fn run_batch(&mut self, cxn: &mut Connection) {
        self.prepare_batch();

        for t in self.active_types() {
            if let Some(q) = self.make_batched_query(t) {
                cxn.run(&mut q.borrow_mut());
                self.slot_mut(t).query = Some(QueryRef::clone(&q));
                self.feed(t);
            }
        }

        // The batch is complete; every message in it now has its
        // requested classes.
        let batch_order = std::mem::take(&mut self.batch_order);
        let types = self.active_types();
        for m in &batch_order {
            let mut m = m.borrow_mut();
            for &t in &types {
                t.set_done(&mut m);
            }
        }
        self.batch.clear();

        if self.messages.is_empty() {
            self.state = State::Done;
        }
    }

    /// Adjusts the batch size to target roughly thirty seconds per batch
    /// and fills the bucket table for the next batch.
    fn prepare_batch(&mut self) {
        let now = Utc::now().timestamp();
        if 0 != self.last_batch_started {
            let elapsed = now - self.last_batch_started;
            let next = next_batch_size(
                self.batch_size,
                elapsed,
                self.max_batch_size,
            );
            debug!(
                "batch took {}s for {} messages, adjusting to {}",
                elapsed, self.batch_size, next
            );
            self.batch_size = next;
        }
        self.last_batch_started = now;

        // Absorb a nearly-complete tail into this batch rather than
        // leaving a tiny one.
        if self.messages_remaining <= self.batch_size * 5 / 4 {
            self.batch_size = self.messages_remaining.max(1);
        }

        self.unique_database_ids = true;
        self.batch.clear();
        self.batch.resize(BATCH_HASH_SIZE, Vec::new());
        self.batch_order.clear();
        self.batch_ids.clear();

        let mut n = 0;
        while n < self.batch_size {
            let m = match self.messages.pop_front() {
                Some(m) => m,
                None => break,
            };
            let id = m
                .borrow()
                .database_id()
                .map(|MessageId(id)| id)
                .unwrap_or(0);
            let b = (id as usize) % BATCH_HASH_SIZE;

            let duplicate = self.batch[b]
                .iter()
                .any(|o| o.borrow().database_id() == m.borrow().database_id());
            if duplicate {
                self.unique_database_ids = false;
            } else {
                if !self.batch_ids.is_empty() {
                    self.batch_ids.push(',');
                }
                self.batch_ids.push_str(&id.to_string());
                n += 1;
            }

            self.batch[b].push(Rc::clone(&m));
            self.batch_order.push(m);
            self.messages_remaining =
                self.messages_remaining.saturating_sub(1);
        }

        self.batch_order
            .sort_by_key(|m| m.borrow().uid());
    }

    /// The UIDs of the current batch.
    fn find_uids(&self) -> UidSet {
        let mut set = UidSet::new();
        for m in &self.batch_order {
            if let Some(uid) = m.borrow().uid() {
                set.add(uid);
            }
        }
        set
    }

    fn make_batched_query(&self, t: FetchType) -> Option<QueryRef> {
        match t {
            FetchType::Flags => {
                let mailbox = self.mailbox?;
                let uids = self.find_uids();
                let q = Query::new(format!(
                    "select mailbox, uid, flag from flags \
                     where mailbox=$1 and {} \
                     order by mailbox, uid, flag",
                    uids.where_clause("uid")
                ));
                q.borrow_mut().bind(mailbox);
                Some(q)
            },

            FetchType::Annotations => {
                let mailbox = self.mailbox?;
                let uids = self.find_uids();
                let q = Query::new(format!(
                    "select a.mailbox, a.uid, a.owner, a.value, \
                     an.name, an.id \
                     from annotations a \
                     join annotation_names an on (a.name=an.id) \
                     where a.mailbox=$1 and {} \
                     order by a.mailbox, a.uid",
                    uids.where_clause("a.uid")
                ));
                q.borrow_mut().bind(mailbox);
                Some(q)
            },

            FetchType::PartNumbers => {
                // Body handles this as a side effect.
                if self.fetching(FetchType::Body) {
                    return None;
                }
                Some(Query::new(format!(
                    "select message, part, bytes, lines \
                     from part_numbers where message in ({})",
                    self.batch_ids
                )))
            },

            FetchType::Addresses => Some(Query::new(format!(
                "select af.message, \
                 af.part, af.position, af.field, af.number, \
                 a.name, a.localpart, a.domain \
                 from address_fields af \
                 join addresses a on (af.address=a.id) \
                 where af.message in ({}) \
                 order by af.message, af.part, af.field, af.number",
                self.batch_ids
            ))),

            FetchType::OtherHeader => Some(Query::new(format!(
                "select hf.message, hf.part, hf.position, \
                 fn.name, hf.value from header_fields hf \
                 join field_names fn on (hf.field=fn.id) \
                 where hf.message in ({}) \
                 order by hf.message, hf.part, hf.position",
                self.batch_ids
            ))),

            FetchType::Body => Some(Query::new(format!(
                "select pn.message, pn.part, bp.text, bp.data, \
                 bp.bytes as rawbytes, pn.bytes, pn.lines \
                 from part_numbers pn \
                 left join bodyparts bp on (pn.bodypart=bp.id) \
                 where bp.id is not null and pn.message in ({})",
                self.batch_ids
            ))),

            FetchType::Trivia => Some(Query::new(format!(
                "select id as message, rfc822size, idate \
                 from messages where id in ({})",
                self.batch_ids
            ))),
        }
    }

    /// One query per class, spliced into the selector's rendered query;
    /// used when batching would cost more than it saves.
    fn run_small_job(&mut self, cxn: &mut Connection) {
        let types = self.active_types();
        for t in types {
            if FetchType::PartNumbers == t
                && self.fetching(FetchType::Body)
            {
                continue;
            }
            if let Some(q) = self.make_small_query(t) {
                cxn.run(&mut q.borrow_mut());
                self.slot_mut(t).query = Some(q);
                self.feed(t);
            }
        }

        let types = self.active_types();
        for m in std::mem::take(&mut self.messages) {
            let mut m = m.borrow_mut();
            for &t in &types {
                t.set_done(&mut m);
            }
        }
        self.state = State::Done;
    }

    fn make_small_query(&self, t: FetchType) -> Option<QueryRef> {
        let selector = self.selector.as_ref()?;
        let wanted = ["mailbox", "uid"];

        match t {
            FetchType::Flags => {
                let mailbox = self.mailbox?;
                if let Some(set) = selector.message_set() {
                    // Selecting from a single mailbox based only on UIDs.
                    let q = Query::new(format!(
                        "select mailbox, uid, flag from flags \
                         where mailbox=$1 and {} \
                         order by mailbox, uid, flag",
                        set.where_clause("uid")
                    ));
                    q.borrow_mut().bind(mailbox);
                    return Some(q);
                }
                let q =
                    selector.query(None, mailbox, false, &wanted, false);
                splice(
                    &q,
                    "left join flags f on \
                     (mm.mailbox=f.mailbox and mm.uid=f.uid) ",
                    "f.flag, ",
                    " order by mm.mailbox, mm.uid, f.flag",
                );
                Some(q)
            },

            FetchType::Annotations => {
                let mailbox = self.mailbox?;
                if let Some(set) = selector.message_set() {
                    let q = Query::new(format!(
                        "select a.mailbox, a.uid, a.owner, a.value, \
                         an.name, an.id \
                         from annotations a \
                         join annotation_names an on (a.name=an.id) \
                         where a.mailbox=$1 and {} \
                         order by a.mailbox, a.uid",
                        set.where_clause("a.uid")
                    ));
                    q.borrow_mut().bind(mailbox);
                    return Some(q);
                }
                let q =
                    selector.query(None, mailbox, false, &wanted, false);
                splice(
                    &q,
                    "join annotations a on \
                     (mm.mailbox=a.mailbox and mm.uid=a.uid) \
                     join annotation_names an on (a.name=an.id) ",
                    "a.owner, a.value, an.name, an.id, ",
                    " order by mm.mailbox, mm.uid",
                );
                Some(q)
            },

            FetchType::PartNumbers => {
                let q = selector.query(
                    None,
                    self.mailbox?,
                    false,
                    &wanted,
                    false,
                );
                splice(
                    &q,
                    "join part_numbers pn on (mm.message=pn.message) ",
                    "pn.part, pn.bytes, pn.lines, ",
                    " order by mm.uid, pn.part",
                );
                Some(q)
            },

            FetchType::Addresses => {
                let q = selector.query(
                    None,
                    self.mailbox?,
                    false,
                    &wanted,
                    false,
                );
                splice(
                    &q,
                    "join address_fields af on (mm.message=af.message) \
                     join addresses a on (af.address=a.id) ",
                    "af.part, af.position, af.field, af.number, \
                     a.name, a.localpart, a.domain, ",
                    " order by mm.uid, af.part, af.field, af.number",
                );
                Some(q)
            },

            FetchType::OtherHeader => {
                let q = selector.query(
                    None,
                    self.mailbox?,
                    false,
                    &wanted,
                    false,
                );
                splice(
                    &q,
                    "join header_fields hf on (mm.message=hf.message) \
                     join field_names fn on (hf.field=fn.id) ",
                    "hf.part, hf.position, fn.name, hf.value, ",
                    " order by mm.uid, hf.part, hf.position",
                );
                Some(q)
            },

            FetchType::Body => {
                let q = selector.query(
                    None,
                    self.mailbox?,
                    false,
                    &wanted,
                    false,
                );
                splice(
                    &q,
                    "join part_numbers pn on (mm.message=pn.message) \
                     join bodyparts bp on (pn.bodypart=bp.id) ",
                    "pn.part, bp.text, bp.data, \
                     bp.bytes as rawbytes, pn.bytes, pn.lines, ",
                    " order by mm.uid, pn.part",
                );
                Some(q)
            },

            FetchType::Trivia => {
                let q = selector.query(
                    None,
                    self.mailbox?,
                    false,
                    &["mailbox", "uid", "modseq"],
                    false,
                );
                splice(
                    &q,
                    "join messages m on (mm.message=m.id) ",
                    "m.rfc822size, m.idate, ",
                    " order by mm.uid",
                );
                Some(q)
            },
        }
    }

    /// Drains a completed query into the matching messages.
    fn feed(&mut self, t: FetchType) {
        let q = match self.slot_mut(t).query.take() {
            Some(q) => q,
            None => return,
        };

        let mut slot_by_id = self.slot(t).find_by_id;
        let mut slot_by_uid = self.slot(t).find_by_uid;
        // The uid-advance cursor restarts with every batch; the rows of
        // one query are drained in full here.
        let mut mit = 0;

        // In batched mode the uid-advance list is the current batch; for
        // small jobs it is the whole working set.
        let by_uid_list: Vec<MessageRef> = if self.batch_order.is_empty() {
            self.messages.iter().cloned().collect()
        } else {
            self.batch_order.clone()
        };

        let mut q = q.borrow_mut();
        while let Some(row) = q.next_row() {
            if !slot_by_id && !slot_by_uid {
                if row.has_column("message") {
                    slot_by_id = true;
                } else if row.has_column("uid") {
                    slot_by_uid = true;
                } else {
                    break;
                }
            }

            if slot_by_uid {
                let uid = row.get_u32("uid");
                while mit < by_uid_list.len()
                    && by_uid_list[mit]
                        .borrow()
                        .uid()
                        .map_or(true, |u| u32::from(u) < uid)
                {
                    mit += 1;
                }
                if mit < by_uid_list.len() {
                    let m = &by_uid_list[mit];
                    if m.borrow().uid().map_or(false, |u| {
                        u32::from(u) == uid
                    }) {
                        let mut m = m.borrow_mut();
                        if !t.is_done(&m) {
                            t.decode(&mut m, &row, false);
                        }
                    }
                }
            } else {
                let id = row.get_i64("message");
                let b = (id as usize) % BATCH_HASH_SIZE;
                if let Some(bucket) = self.batch.get(b) {
                    for m in bucket {
                        let matches = m
                            .borrow()
                            .database_id()
                            .map_or(false, |MessageId(mid)| mid == id);
                        if matches {
                            let mut m = m.borrow_mut();
                            if !t.is_done(&m) {
                                t.decode(&mut m, &row, true);
                            }
                            if self.unique_database_ids {
                                break;
                            }
                        }
                    }
                }
            }
        }

        let slot = self.slot_mut(t);
        slot.find_by_id = slot_by_id;
        slot.find_by_uid = slot_by_uid;
    }
}

/// Splices a join, extra projection, and ordering into a rendered
/// selector query; the anchor strings are the same ones the sort planner
/// relies on.
fn splice(q: &QueryRef, join: &str, projection: &str, order: &str) {
    let mut sql = q.borrow().sql().to_owned();
    if let Some(w) = sql.find(" where ") {
        sql.insert_str(w + 1, join);
    }
    sql = sql.replacen(
        "select distinct mm.",
        &format!("select distinct {}mm.", projection),
        1,
    );
    sql.push_str(order);
    q.borrow_mut().set_sql(sql);
}

/// The batch-size controller: scale the previous size toward a thirty
/// second batch, within guard rails.
pub fn next_batch_size(prev: usize, elapsed_secs: i64, max: usize) -> usize {
    let mut next = if 0 == elapsed_secs {
        // Suspiciously fast; grow gently.
        prev * 2
    } else if elapsed_secs < 0 {
        // The clock went backwards; be very, very careful.
        128
    } else {
        prev * 30 / elapsed_secs as usize
    };

    next = next.min(prev * 3);
    next = next.min(prev + 2000);
    next = next.max(128);
    next.min(max)
}

impl FetchType {
    fn decode(self, m: &mut Message, row: &Row, by_id: bool) {
        match self {
            FetchType::Flags => {
                let flag = row.get_u32("flag");
                if InternKind::Flags.name(flag).is_some() {
                    m.add_flag(flag);
                } else {
                    // A flag created since our last reload; it was not
                    // announced on SELECT either, so skip it for now.
                }
            },

            FetchType::Trivia => {
                m.set_rfc822_size(row.get_u32("rfc822size"));
                if row.has_column("idate") {
                    m.set_internal_date(row.get_i64("idate"));
                }
                if !by_id && row.has_column("modseq") {
                    m.set_modseq(Modseq(row.get_i64("modseq") as u64));
                }
            },

            FetchType::Annotations => {
                let id = row.get_u32("id");
                let name = row.get_string("name");
                if InternKind::AnnotationNames.name(id).is_none() {
                    InternKind::AnnotationNames.add(&name, id);
                }

                let owner = if row.is_null("owner") {
                    None
                } else {
                    Some(UserId(row.get_i64("owner")))
                };
                m.replace_annotation(Annotation {
                    name_id: id,
                    entry_name: name,
                    owner,
                    value: row.get_string("value"),
                });
            },

            FetchType::Addresses => {
                let part = row.get_string("part");
                let position = row.get_u32("position");
                let ftype = FieldType::from_number(row.get_u32("field"))
                    .unwrap_or(FieldType::Other);
                let address = crate::mime::rfc5322::Address::new(
                    row.get_string("name"),
                    row.get_string("localpart"),
                    row.get_string("domain"),
                );

                let header = match target_header(m, &part) {
                    Some(h) => h,
                    None => return,
                };
                if header.field_at_position_mut(ftype, position).is_none()
                {
                    header.push_field(HeaderField::new_address(
                        ftype, position,
                    ));
                }
                if let Some(addrs) = header
                    .field_at_position_mut(ftype, position)
                    .and_then(HeaderField::addresses_mut)
                {
                    addrs.push(address);
                }
            },

            FetchType::OtherHeader => {
                let part = row.get_string("part");
                let mut f = HeaderField::assemble(
                    row.get_str("name"),
                    row.get_str("value"),
                );
                f.set_position(row.get_u32("position"));

                if let Some(h) = target_header(m, &part) {
                    h.push_field(f);
                }
            },

            FetchType::Body => {
                FetchType::PartNumbers.decode(m, row, by_id);

                let part = row.get_string("part");
                if part.ends_with(".rfc822") || part.is_empty() {
                    return;
                }
                if let Some(bp) = m.bodypart_mut(&part, true) {
                    if !row.is_null("data") {
                        bp.set_data(row.get_bytes("data").to_vec());
                    } else if !row.is_null("text") {
                        bp.set_text(row.get_string("text"));
                    }
                    if !row.is_null("rawbytes") {
                        bp.set_num_bytes(row.get_u32("rawbytes"));
                    }
                    if !row.is_null("bytes") {
                        bp.set_num_encoded_bytes(row.get_u32("bytes"));
                    }
                    if !row.is_null("lines") {
                        bp.set_num_encoded_lines(row.get_u32("lines"));
                    }
                }
            },

            FetchType::PartNumbers => {
                let part = row.get_string("part");
                if let Some(prefix) = part.strip_suffix(".rfc822") {
                    // The embedded message at x.y.z; allocate it on first
                    // touch.
                    if !prefix.is_empty() {
                        let _ = m.embedded_message_mut(prefix);
                    }
                } else if !part.is_empty() {
                    if let Some(bp) = m.bodypart_mut(&part, true) {
                        if !row.is_null("bytes") {
                            bp.set_num_encoded_bytes(row.get_u32("bytes"));
                        }
                        if !row.is_null("lines") {
                            bp.set_num_encoded_lines(row.get_u32("lines"));
                        }
                    }
                }
            },
        }
    }

    fn is_done(self, m: &Message) -> bool {
        match self {
            FetchType::Flags => m.has_flags(),
            FetchType::Annotations => m.has_annotations(),
            FetchType::Addresses => m.has_addresses(),
            FetchType::OtherHeader => m.has_headers(),
            FetchType::Body => m.has_bodies() && m.has_bytes_and_lines(),
            FetchType::Trivia => m.rfc822_size() > 0,
            FetchType::PartNumbers => m.has_bytes_and_lines(),
        }
    }

    fn set_done(self, m: &mut Message) {
        match self {
            FetchType::Flags => m.set_flags_fetched(),
            FetchType::Annotations => m.set_annotations_fetched(),
            FetchType::Addresses => m.set_addresses_fetched(),
            FetchType::OtherHeader => m.set_headers_fetched(),
            FetchType::Body => {
                m.set_bodies_fetched();
                m.set_bytes_and_lines_fetched();
            },
            FetchType::Trivia => (),
            FetchType::PartNumbers => m.set_bytes_and_lines_fetched(),
        }
    }
}

/// The header a `(part, …)` row applies to: the message header for an
/// empty part, the embedded message's header for `x.y.z.rfc822`, and the
/// part's own header otherwise.
fn target_header<'a>(
    m: &'a mut Message,
    part: &str,
) -> Option<&'a mut Header> {
    if part.is_empty() {
        return Some(m.header_mut());
    }
    if let Some(prefix) = part.strip_suffix(".rfc822") {
        if prefix.is_empty() {
            return None;
        }
        return m.embedded_message_mut(prefix).map(Message::header_mut);
    }
    m.bodypart_mut(part, true).map(|bp| bp.header_mut())
}
