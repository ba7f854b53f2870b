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

//! Interned dictionary names: flags, header-field names, annotation names.
//!
//! These tables frequently hold less than one row per thousand messages,
//! so everything here is optimised for inserting zero, one or at most a
//! few rows. Creation is race-safe: concurrent inserters may all attempt,
//! exactly one succeeds, and the losers observe the winner's id on
//! re-read, with a savepoint keeping the lost race out of the enclosing
//! transaction's fate.

use std::collections::HashMap;
use std::sync::Mutex;

use itertools::Itertools;
use lazy_static::lazy_static;
use log::{error, warn};

use crate::db::query::{Query, QueryRef};
use crate::db::transaction::Transaction;
use crate::db::{signal, Connection};
use crate::support::error::Error;

#[derive(Default)]
struct InternTable {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
}

lazy_static! {
    static ref FLAGS: Mutex<InternTable> = Mutex::new(InternTable::default());
    static ref FIELD_NAMES: Mutex<InternTable> =
        Mutex::new(InternTable::default());
    static ref ANNOTATION_NAMES: Mutex<InternTable> =
        Mutex::new(InternTable::default());
}

// The intern tables are process-wide; tests that reset them must not
// interleave.
#[cfg(test)]
lazy_static! {
    pub(crate) static ref TEST_LOCK: Mutex<()> = Mutex::new(());
}

#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Which dictionary a creator or lookup addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternKind {
    Flags,
    FieldNames,
    AnnotationNames,
}

impl InternKind {
    fn table(self) -> &'static Mutex<InternTable> {
        match self {
            InternKind::Flags => &FLAGS,
            InternKind::FieldNames => &FIELD_NAMES,
            InternKind::AnnotationNames => &ANNOTATION_NAMES,
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            InternKind::Flags => "flag_names",
            InternKind::FieldNames => "field_names",
            InternKind::AnnotationNames => "annotation_names",
        }
    }

    /// The unique constraint whose violation means "lost the race".
    pub fn constraint(self) -> &'static str {
        match self {
            InternKind::Flags => "fn_uname",
            InternKind::FieldNames => "field_names.name",
            InternKind::AnnotationNames => "annotation_names.name",
        }
    }

    /// Flag names compare case-insensitively; the other dictionaries are
    /// exact.
    fn case_insensitive(self) -> bool {
        InternKind::Flags == self
    }

    fn key(self, name: &str) -> String {
        if self.case_insensitive() {
            name.to_lowercase()
        } else {
            name.to_owned()
        }
    }

    /// The id of `name`, or `None` if it is not interned.
    pub fn id(self, name: &str) -> Option<u32> {
        self.table()
            .lock()
            .unwrap()
            .by_name
            .get(&self.key(name))
            .copied()
    }

    /// The name behind `id`, or `None`.
    pub fn name(self, id: u32) -> Option<String> {
        self.table().lock().unwrap().by_id.get(&id).cloned()
    }

    /// Records that `(id, name)` exists.
    pub fn add(self, name: &str, id: u32) {
        let mut t = self.table().lock().unwrap();
        t.by_name.insert(self.key(name), id);
        t.by_id.insert(id, name.to_owned());
    }

    pub fn clear(self) {
        let mut t = self.table().lock().unwrap();
        t.by_name.clear();
        t.by_id.clear();
    }
}

/// Loads all three dictionaries and arranges for them to be dropped when
/// the `obliterated` signal fires (the next load happens on demand).
pub fn setup(cxn: &mut Connection) -> Result<(), Error> {
    for kind in [
        InternKind::Flags,
        InternKind::FieldNames,
        InternKind::AnnotationNames,
    ] {
        load(cxn, kind)?;
    }

    signal::subscribe("obliterated", || {
        InternKind::Flags.clear();
        InternKind::FieldNames.clear();
        InternKind::AnnotationNames.clear();
    });

    Ok(())
}

/// (Re)loads one dictionary from its table.
pub fn load(cxn: &mut Connection, kind: InternKind) -> Result<(), Error> {
    let q = Query::new(format!(
        "select `id`, `name` from `{}`",
        kind.table_name()
    ));
    cxn.run(&mut q.borrow_mut());

    if let Some(e) = q.borrow().error() {
        return Err(Error::QueryFailed(e.to_owned()));
    }

    let mut q = q.borrow_mut();
    while let Some(row) = q.next_row() {
        kind.add(row.get_str("name"), row.get_u32("id"));
    }
    Ok(())
}

/// Race-safe lazy insertion into one dictionary table, within a
/// caller-provided transaction.
///
/// The creator never commits and never leaves an unreleased savepoint;
/// several creators can be batched into one transaction.
pub struct HelperRowCreator {
    kind: InternKind,
    names: Vec<String>,
    done: bool,
    inserted: bool,
    #[cfg(test)]
    pub force_insert_first: bool,
}

pub fn flag_creator(names: Vec<String>) -> HelperRowCreator {
    HelperRowCreator::new(InternKind::Flags, names)
}

pub fn field_name_creator(names: Vec<String>) -> HelperRowCreator {
    HelperRowCreator::new(InternKind::FieldNames, names)
}

pub fn annotation_name_creator(names: Vec<String>) -> HelperRowCreator {
    HelperRowCreator::new(InternKind::AnnotationNames, names)
}

impl HelperRowCreator {
    pub fn new(kind: InternKind, names: Vec<String>) -> Self {
        HelperRowCreator {
            kind,
            names,
            done: false,
            inserted: false,
            #[cfg(test)]
            force_insert_first: false,
        }
    }

    pub fn done(&self) -> bool {
        self.done
    }

    fn missing(&self) -> Vec<String> {
        self.names
            .iter()
            .filter(|n| self.kind.id(n).is_none())
            .unique()
            .cloned()
            .collect()
    }

    /// Runs the whole select/insert/re-select loop against `t`.
    ///
    /// On a unique-constraint failure the insert is rolled back to the
    /// savepoint (some peer inserted concurrently) and the loop retries;
    /// any other failure leaves the transaction poisoned for the caller
    /// to observe.
    pub fn execute(&mut self, t: &mut Transaction) {
        let savepoint = format!("{}_creator", self.kind.table_name());
        let mut have_savepoint = false;
        let mut skip_select = false;
        #[cfg(test)]
        {
            skip_select = self.force_insert_first;
        }

        // With a wire-protocol store peers can slip in between every
        // round; bound the retries all the same so a broken constraint
        // cannot wedge the loop.
        for _ in 0..16 {
            if !skip_select && !self.select(t) {
                break;
            }
            skip_select = false;

            let missing = self.missing();
            if missing.is_empty() {
                break;
            }

            if !have_savepoint {
                let q = Query::new(format!("savepoint {}", savepoint));
                t.enqueue(&q);
                have_savepoint = true;
            }

            let insert = self.make_insert(&missing);
            t.enqueue(&insert);
            t.execute();

            let insert = insert.borrow();
            if !insert.failed() {
                // We inserted, hit no race; re-select to learn the ids.
                self.inserted = true;
                continue;
            }

            let err = insert.error().unwrap_or("");
            if err.contains(self.kind.constraint()) {
                // We lost the race; roll back to the savepoint and look
                // at what the winner inserted.
                let q = Query::new(format!(
                    "rollback to savepoint {}",
                    savepoint
                ));
                t.enqueue(&q);
                t.execute();
            } else {
                // Total failure. The transaction is now in failed state;
                // nothing to do but let the owner see it.
                error!(
                    "{} insert failed: {}",
                    self.kind.table_name(),
                    err
                );
                self.done = true;
                have_savepoint = false;
                break;
            }
        }

        if have_savepoint {
            let q = Query::new(format!("release savepoint {}", savepoint));
            t.enqueue(&q);
            t.execute();
            if self.inserted {
                signal::notify(&format!(
                    "{}_extended",
                    self.kind.table_name()
                ));
            }
        }

        self.done = true;
        t.notify();
    }

    /// Selects ids for the still-uncached names; `false` means nothing was
    /// missing.
    fn select(&self, t: &mut Transaction) -> bool {
        let missing = self.missing();
        if missing.is_empty() {
            return false;
        }

        let column = if self.kind.case_insensitive() {
            "lower(`name`)"
        } else {
            "`name`"
        };
        let placeholders = (1..=missing.len())
            .map(|n| format!("${}", n))
            .join(",");
        let q = Query::new(format!(
            "select `id`, `name` from `{}` where {} in ({})",
            self.kind.table_name(),
            column,
            placeholders
        ));
        for name in &missing {
            if self.kind.case_insensitive() {
                q.borrow_mut().bind(name.to_lowercase());
            } else {
                q.borrow_mut().bind(name.as_str());
            }
        }

        t.enqueue(&q);
        t.execute();

        if q.borrow().failed() {
            warn!(
                "{} select failed: {}",
                self.kind.table_name(),
                q.borrow().error().unwrap_or("")
            );
            return true;
        }

        let mut q = q.borrow_mut();
        while let Some(row) = q.next_row() {
            self.kind.add(row.get_str("name"), row.get_u32("id"));
        }
        true
    }

    fn make_insert(&self, missing: &[String]) -> QueryRef {
        let values = (1..=missing.len())
            .map(|n| format!("(${})", n))
            .join(",");
        let q = Query::new(format!(
            "insert into `{}` (`name`) values {}",
            self.kind.table_name(),
            values
        ));
        for name in missing {
            q.borrow_mut().bind(name.as_str());
        }
        q
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn count(cxn: &mut Connection, kind: InternKind, name: &str) -> i64 {
        let q = Query::new(format!(
            "select count(*) as n from `{}` where lower(`name`) = lower($1)",
            kind.table_name()
        ));
        q.borrow_mut().bind(name);
        cxn.run(&mut q.borrow_mut());
        let row = q.borrow_mut().next_row().unwrap();
        row.get_i64("n")
    }

    #[test]
    fn creator_interns_new_names() {
        let _lock = super::test_lock();
        let mut cxn = Connection::open_in_memory().unwrap();
        InternKind::Flags.clear();

        let mut creator = flag_creator(vec![
            "\\TestSeen1".to_owned(),
            "\\TestDraft1".to_owned(),
        ]);
        let mut t = cxn.transaction().unwrap();
        creator.execute(&mut t);
        assert!(creator.done());
        assert!(!t.failed());
        t.commit().unwrap();

        let seen = InternKind::Flags.id("\\TestSeen1").unwrap();
        assert_eq!(
            Some("\\TestSeen1".to_owned()),
            InternKind::Flags.name(seen)
        );
        // Case-insensitive lookup.
        assert_eq!(Some(seen), InternKind::Flags.id("\\testseen1"));
        assert_eq!(1, count(&mut cxn, InternKind::Flags, "\\TestSeen1"));
    }

    #[test]
    fn creator_is_idempotent() {
        let _lock = super::test_lock();
        let mut cxn = Connection::open_in_memory().unwrap();
        InternKind::Flags.clear();

        for _ in 0..2 {
            let mut creator =
                flag_creator(vec!["\\TestAnswered2".to_owned()]);
            let mut t = cxn.transaction().unwrap();
            creator.execute(&mut t);
            t.commit().unwrap();
        }

        assert_eq!(
            1,
            count(&mut cxn, InternKind::Flags, "\\TestAnswered2")
        );
    }

    #[test]
    fn cached_names_enqueue_nothing() {
        let _lock = super::test_lock();
        let mut cxn = Connection::open_in_memory().unwrap();
        InternKind::Flags.clear();
        InternKind::Flags.add("\\TestCached3", 77);

        let mut creator = flag_creator(vec!["\\TestCached3".to_owned()]);
        let mut t = cxn.transaction().unwrap();
        creator.execute(&mut t);
        assert!(creator.done());
        t.commit().unwrap();

        // Nothing was inserted; the cache already knew the name.
        assert_eq!(0, count(&mut cxn, InternKind::Flags, "\\TestCached3"));
    }

    #[test]
    fn lost_race_is_local_to_the_savepoint() {
        let _lock = super::test_lock();
        // Simulate losing the insert race: the table already has the row
        // but the cache does not, and the creator is forced to insert
        // before selecting. The constraint fires, the creator rolls back
        // to its savepoint, re-reads the winner's id, and the enclosing
        // transaction stays healthy.
        let mut cxn = Connection::open_in_memory().unwrap();
        InternKind::Flags.clear();

        {
            let mut t = cxn.transaction().unwrap();
            let q = Query::new(
                "insert into `flag_names` (`name`) values ('\\TestRace4')",
            );
            t.enqueue(&q);
            t.commit().unwrap();
        }

        let mut creator = flag_creator(vec!["\\TestRace4".to_owned()]);
        creator.force_insert_first = true;

        let mut t = cxn.transaction().unwrap();
        // Unrelated prior work in the same transaction must survive.
        let other = Query::new(
            "insert into `field_names` (`name`) values ('X-Test-Race4')",
        );
        t.enqueue(&other);
        creator.execute(&mut t);

        assert!(creator.done());
        assert!(!t.failed());
        t.commit().unwrap();

        assert!(InternKind::Flags.id("\\TestRace4").is_some());
        assert_eq!(1, count(&mut cxn, InternKind::Flags, "\\TestRace4"));
        assert_eq!(
            1,
            count(&mut cxn, InternKind::FieldNames, "X-Test-Race4")
        );
    }

    #[test]
    fn extended_signal_fires_on_insert() {
        let _lock = super::test_lock();
        use std::sync::atomic::{AtomicUsize, Ordering};
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        signal::subscribe("annotation_names_extended", || {
            FIRED.fetch_add(1, Ordering::SeqCst);
        });

        let mut cxn = Connection::open_in_memory().unwrap();
        InternKind::AnnotationNames.clear();

        let mut creator =
            annotation_name_creator(vec!["/test/comment5".to_owned()]);
        let mut t = cxn.transaction().unwrap();
        creator.execute(&mut t);
        t.commit().unwrap();

        assert!(FIRED.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn obliterated_clears_the_cache() {
        let _lock = super::test_lock();
        let mut cxn = Connection::open_in_memory().unwrap();
        setup(&mut cxn).unwrap();
        InternKind::Flags.add("\\TestOblit6", 123);
        assert!(InternKind::Flags.id("\\TestOblit6").is_some());

        signal::notify("obliterated");
        assert_eq!(None, InternKind::Flags.id("\\TestOblit6"));
    }
}
