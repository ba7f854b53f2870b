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

//! Access to the relational store.
//!
//! The store is an embedded SQLite database; `Query` and `Transaction` keep
//! the enqueue/execute/done discipline the rest of the core is written
//! against, so a wire-protocol database client could be substituted without
//! touching the callers.

pub mod query;
pub mod signal;
pub mod transaction;

use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use chrono::prelude::*;
use log::info;

use self::query::{Query, Row, Value};
use self::transaction::Transaction;
use crate::support::error::Error;

static MIGRATION_V1: &str = include_str!("schema.sql");

/// A connection to the archive database.
pub struct Connection {
    cxn: rusqlite::Connection,
}

impl Connection {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let cxn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::init(cxn)
    }

    /// Opens a transient in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(cxn: rusqlite::Connection) -> Result<Self, Error> {
        cxn.execute("PRAGMA foreign_keys = ON", ())?;
        cxn.busy_timeout(Duration::from_secs(10))?;

        {
            let txn = cxn.unchecked_transaction()?;
            txn.execute(
                "CREATE TABLE IF NOT EXISTS `migration` (\
                   `version` INTEGER NOT NULL PRIMARY KEY, \
                   `applied_at` INTEGER NOT NULL\
                 ) STRICT",
                (),
            )?;

            let current_version: u32 = txn
                .query_row(
                    "SELECT IFNULL(MAX(`version`), 0) FROM `migration`",
                    (),
                    |row| row.get(0),
                )?;

            if current_version < 1 {
                info!("Applying V1 migration to archive DB");
                txn.execute_batch(MIGRATION_V1)?;
                txn.execute(
                    "INSERT INTO `migration` (`version`, `applied_at`) \
                     VALUES (1, ?)",
                    (Utc::now().timestamp(),),
                )?;
            }

            txn.commit()?;
        }

        Ok(Self { cxn })
    }

    /// Executes `q` to completion, buffering its rows.
    ///
    /// Failure is recorded on the query, never surfaced here; the caller
    /// inspects `failed()`/`error()`.
    pub fn run(&mut self, q: &mut Query) {
        match run_statement(&self.cxn, q) {
            Ok(()) => q.set_done(),
            Err(e) => q.set_failed(e.to_string()),
        }
    }

    /// Starts a transaction with the store's write lock held.
    pub fn transaction(&mut self) -> Result<Transaction<'_>, Error> {
        Transaction::begin(self)
    }

    pub(super) fn execute_batch(&self, sql: &str) -> Result<(), Error> {
        self.cxn.execute_batch(sql)?;
        Ok(())
    }

    pub(super) fn run_raw(
        &self,
        q: &mut Query,
    ) -> Result<(), rusqlite::Error> {
        run_statement(&self.cxn, q)
    }
}

fn run_statement(
    cxn: &rusqlite::Connection,
    q: &mut Query,
) -> Result<(), rusqlite::Error> {
    let mut stmt = cxn.prepare(q.sql())?;

    for (i, v) in q.params().iter().enumerate() {
        if let Some(ix) = stmt.parameter_index(&format!("${}", i + 1))? {
            stmt.raw_bind_parameter(ix, v)?;
        }
    }

    let names = Rc::new(
        stmt.column_names()
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<String>>(),
    );
    let ncols = names.len();

    let mut collected = Vec::new();
    {
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(ncols);
            for i in 0..ncols {
                values.push(Value::from_ref(row.get_ref(i)?));
            }
            collected.push(Row::new(Rc::clone(&names), values));
        }
    }

    for row in collected {
        q.push_row(row);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bootstrap_and_query() {
        let mut cxn = Connection::open_in_memory().unwrap();

        let q = Query::new(
            "select `name` from `sqlite_master` \
             where `type` = 'table' and `name` = $1",
        );
        q.borrow_mut().bind("mailboxes");
        cxn.run(&mut q.borrow_mut());

        assert!(q.borrow().done());
        assert!(!q.borrow().failed());
        let row = q.borrow_mut().next_row().unwrap();
        assert_eq!("mailboxes", row.get_str("name"));
    }

    #[test]
    fn placeholders_bind_in_order() {
        let mut cxn = Connection::open_in_memory().unwrap();

        let q = Query::new("select $2 as a, $1 as b");
        q.borrow_mut().bind("first").bind("second");
        cxn.run(&mut q.borrow_mut());

        let row = q.borrow_mut().next_row().unwrap();
        assert_eq!("second", row.get_str("a"));
        assert_eq!("first", row.get_str("b"));
    }

    #[test]
    fn failure_is_recorded_not_raised() {
        let mut cxn = Connection::open_in_memory().unwrap();

        let q = Query::new("select * from `no_such_table`");
        cxn.run(&mut q.borrow_mut());

        assert!(q.borrow().done());
        assert!(q.borrow().failed());
    }
}
