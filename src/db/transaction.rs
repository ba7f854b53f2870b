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

//! Write transactions over the store.
//!
//! A `Transaction` carries a queue of pending `Query` objects. Failure of
//! any statement poisons the transaction unless the statement allows
//! failure; a poisoned transaction refuses everything except
//! `rollback to savepoint`, which restores it (the discipline helper-row
//! creators rely on to survive lost insert races). Dropping an unresolved
//! transaction rolls it back.

use std::collections::VecDeque;

use log::{debug, error};

use super::query::QueryRef;
use super::Connection;
use crate::support::error::Error;

#[derive(Clone, Debug, PartialEq)]
enum TxState {
    Active,
    Failed(String),
    Committed,
    RolledBack,
}

pub struct Transaction<'a> {
    cxn: &'a mut Connection,
    queue: VecDeque<QueryRef>,
    state: TxState,
}

impl<'a> Transaction<'a> {
    pub(super) fn begin(cxn: &'a mut Connection) -> Result<Self, Error> {
        cxn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Transaction {
            cxn,
            queue: VecDeque::new(),
            state: TxState::Active,
        })
    }

    /// Adds `q` to the pending queue without executing anything.
    pub fn enqueue(&mut self, q: &QueryRef) {
        self.queue.push_back(QueryRef::clone(q));
    }

    /// Executes every pending statement in order.
    ///
    /// While the transaction is poisoned, statements complete as failed
    /// without touching the store, except a `rollback to savepoint` which
    /// executes and clears the poisoned state.
    pub fn execute(&mut self) {
        while let Some(q) = self.queue.pop_front() {
            let mut q = q.borrow_mut();

            if let TxState::Failed(ref cause) = self.state {
                if is_savepoint_rollback(q.sql()) {
                    match self.cxn.run_raw(&mut q) {
                        Ok(()) => {
                            q.set_done();
                            self.state = TxState::Active;
                        },
                        Err(e) => q.set_failed(e.to_string()),
                    }
                } else {
                    q.set_failed(format!(
                        "transaction in failed state: {}",
                        cause
                    ));
                }
                continue;
            }

            match self.cxn.run_raw(&mut q) {
                Ok(()) => q.set_done(),
                Err(e) => {
                    let msg = e.to_string();
                    debug!("statement failed: {}: {}", msg, q.sql());
                    q.set_failed(msg.clone());
                    if !q.allows_failure() {
                        self.state = TxState::Failed(msg);
                    }
                },
            }
        }
    }

    /// Hook for owners awaiting query completion; execution is synchronous
    /// here, so this just drains whatever is still queued.
    pub fn notify(&mut self) {
        self.execute();
    }

    pub fn failed(&self) -> bool {
        matches!(self.state, TxState::Failed(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self.state {
            TxState::Failed(ref e) => Some(e),
            _ => None,
        }
    }

    pub fn done(&self) -> bool {
        matches!(self.state, TxState::Committed | TxState::RolledBack)
    }

    /// Executes anything still pending, then commits.
    ///
    /// Committing a poisoned transaction rolls back instead and reports the
    /// original cause.
    pub fn commit(mut self) -> Result<(), Error> {
        self.execute();

        match self.state.clone() {
            TxState::Active => {
                self.cxn.execute_batch("COMMIT")?;
                self.state = TxState::Committed;
                Ok(())
            },
            TxState::Failed(cause) => {
                self.cxn.execute_batch("ROLLBACK")?;
                self.state = TxState::RolledBack;
                Err(Error::TransactionFailed(cause))
            },
            _ => Err(Error::TransactionCompleted),
        }
    }

    pub fn rollback(mut self) -> Result<(), Error> {
        match self.state {
            TxState::Active | TxState::Failed(_) => {
                self.cxn.execute_batch("ROLLBACK")?;
                self.state = TxState::RolledBack;
                Ok(())
            },
            _ => Err(Error::TransactionCompleted),
        }
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if matches!(self.state, TxState::Active | TxState::Failed(_)) {
            if let Err(e) = self.cxn.execute_batch("ROLLBACK") {
                error!("implicit rollback failed: {}", e);
            }
        }
    }
}

fn is_savepoint_rollback(sql: &str) -> bool {
    sql.trim_start()
        .get(..21)
        .map_or(false, |s| s.eq_ignore_ascii_case("rollback to savepoint"))
}

#[cfg(test)]
mod test {
    use super::super::query::Query;
    use super::super::Connection;
    use super::*;

    fn fixture() -> Connection {
        let mut cxn = Connection::open_in_memory().unwrap();
        {
            let mut t = cxn.transaction().unwrap();
            let q = Query::new(
                "insert into `flag_names` (`name`) values ('\\Seen')",
            );
            t.enqueue(&q);
            t.execute();
            t.commit().unwrap();
        }
        cxn
    }

    #[test]
    fn commit_persists() {
        let mut cxn = fixture();

        let q = Query::new("select count(*) as n from `flag_names`");
        cxn.run(&mut q.borrow_mut());
        let row = q.borrow_mut().next_row().unwrap();
        assert_eq!(1, row.get_i64("n"));
    }

    #[test]
    fn drop_rolls_back() {
        let mut cxn = Connection::open_in_memory().unwrap();
        {
            let mut t = cxn.transaction().unwrap();
            let q = Query::new(
                "insert into `flag_names` (`name`) values ('dropped')",
            );
            t.enqueue(&q);
            t.execute();
            // no commit
        }

        let q = Query::new("select count(*) as n from `flag_names`");
        cxn.run(&mut q.borrow_mut());
        assert_eq!(0, q.borrow_mut().next_row().unwrap().get_i64("n"));
    }

    #[test]
    fn failure_poisons_until_savepoint_rollback() {
        let mut cxn = fixture();
        let mut t = cxn.transaction().unwrap();

        let sp = Query::new("savepoint sp1");
        let bad = Query::new(
            "insert into `flag_names` (`name`) values ('\\SEEN')",
        );
        t.enqueue(&sp);
        t.enqueue(&bad);
        t.execute();

        assert!(bad.borrow().failed());
        assert!(bad.borrow().error().unwrap().contains("fn_uname"));
        assert!(t.failed());

        // While poisoned, ordinary statements fail without running.
        let skipped = Query::new(
            "insert into `flag_names` (`name`) values ('other')",
        );
        t.enqueue(&skipped);
        t.execute();
        assert!(skipped.borrow().failed());

        // rollback to savepoint restores the transaction.
        let rb = Query::new("rollback to savepoint sp1");
        let good = Query::new(
            "insert into `flag_names` (`name`) values ('\\Answered')",
        );
        t.enqueue(&rb);
        t.enqueue(&good);
        t.execute();

        assert!(!t.failed());
        assert!(!good.borrow().failed());
        t.commit().unwrap();
    }

    #[test]
    fn allow_failure_does_not_poison() {
        let mut cxn = fixture();
        let mut t = cxn.transaction().unwrap();

        let bad = Query::new(
            "insert into `flag_names` (`name`) values ('\\seen')",
        );
        bad.borrow_mut().set_allow_failure();
        t.enqueue(&bad);
        t.execute();

        assert!(bad.borrow().failed());
        assert!(!t.failed());
        t.commit().unwrap();
    }

    #[test]
    fn commit_of_poisoned_transaction_fails() {
        let mut cxn = fixture();
        let mut t = cxn.transaction().unwrap();

        let bad = Query::new("select * from `nonexistent`");
        t.enqueue(&bad);
        t.execute();

        assert_matches!(Err(Error::TransactionFailed(_)), t.commit());
    }
}
