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

//! The `undelete` command.
//!
//! Searches `deleted_messages` in one mailbox with an ordinary selector
//! and moves the matches back into `mailbox_messages`, allocating fresh
//! UIDs from `uidnext` under the write transaction. With `-n` the whole
//! plan runs and is then rolled back, leaving every row byte-identical.

use std::collections::HashMap;
use std::path::Path;

use crate::db::query::Query;
use crate::db::Connection;
use crate::store::mailbox::Registry;
use crate::store::model::{Uid, UidSet};
use crate::store::selector::{Cond, Selector};
use crate::support::error::Error;

pub struct Request {
    pub dry_run: bool,
    pub verbose: bool,
    pub mailbox: String,
    pub selector_args: Vec<String>,
}

pub struct Report {
    pub lines: Vec<String>,
    pub restored: usize,
}

pub fn run_on_db(db: &Path, request: &Request) -> Result<Report, Error> {
    let mut cxn = Connection::open(db)?;
    let mut registry = Registry::setup(&mut cxn)?;
    run(&mut cxn, &mut registry, request)
}

pub fn run(
    cxn: &mut Connection,
    registry: &mut Registry,
    request: &Request,
) -> Result<Report, Error> {
    let mut selector =
        parse_selector(&request.selector_args)?;
    selector.simplify();

    let mailbox = registry
        .find(&request.mailbox, true)
        .ok_or(Error::NxMailbox)?;
    let mailbox_id = registry.id(mailbox).ok_or(Error::NxMailbox)?;

    let mut lines = Vec::new();

    let mut t = cxn.transaction()?;

    if registry.deleted(mailbox) {
        if !registry.enqueue_create(&mut t, mailbox, None) {
            return Err(Error::NxMailbox);
        }
        lines.push(format!(
            "Note: mailbox {} is recreated. Its ownership and \
             permissions could not be restored.",
            request.mailbox
        ));
    }

    let logins = if request.verbose {
        let q = Query::new("select id, login from users");
        t.enqueue(&q);
        t.execute();
        let mut map = HashMap::new();
        let mut q = q.borrow_mut();
        while let Some(row) = q.next_row() {
            map.insert(row.get_i64("id"), row.get_string("login"));
        }
        Some(map)
    } else {
        None
    };

    let mut wanted = vec!["uid"];
    if request.verbose {
        wanted.push("deleted_by");
        wanted.push("deleted_at");
        wanted.push("reason");
    }
    let find = selector.query(None, mailbox_id, true, &wanted, true);
    t.enqueue(&find);

    // Read under the write transaction; nothing else can advance the
    // counters while we hold it.
    let counters = Query::new(
        "select uidnext, nextmodseq from mailboxes where id = $1",
    );
    counters.borrow_mut().bind(mailbox_id);
    t.enqueue(&counters);
    t.execute();

    if t.failed() {
        let cause = t.error().unwrap_or("").to_owned();
        let _ = t.rollback();
        return Err(Error::TransactionFailed(cause));
    }

    let (uidnext, nextmodseq) = {
        let mut counters = counters.borrow_mut();
        let row = counters.next_row().ok_or(Error::NxMailbox)?;
        (row.get_u32("uidnext"), row.get_i64("nextmodseq"))
    };

    let mut uids = UidSet::new();
    {
        let mut find = find.borrow_mut();
        while let Some(row) = find.next_row() {
            let uid = match Uid::of(row.get_u32("uid")) {
                Some(uid) => uid,
                None => continue,
            };
            uids.add(uid);

            if let Some(ref logins) = logins {
                let login = logins
                    .get(&row.get_i64("deleted_by"))
                    .map(String::as_str)
                    .unwrap_or("(unknown)");
                lines.push(format!(
                    " - Message {} was deleted by {:?} at {}. \
                     Reason: {:?}",
                    uid,
                    login,
                    row.get_i64("deleted_at"),
                    row.get_str("reason"),
                ));
            }
        }
    }

    if uids.is_empty() {
        let _ = t.rollback();
        return Err(Error::BadSelector(
            "no such deleted message (search returned 0 results)"
                .to_owned(),
        ));
    }

    lines.insert(
        0,
        format!(
            "Undeleting {} messages into {}",
            uids.len(),
            request.mailbox
        ),
    );

    // A private UID sequence starting at uidnext.
    let mut next = uidnext;
    for old_uid in uids.iter() {
        let q = Query::new(
            "insert into mailbox_messages (mailbox, uid, message, modseq) \
             select mailbox, $3, message, $4 \
             from deleted_messages where mailbox = $1 and uid = $2",
        );
        q.borrow_mut()
            .bind(mailbox_id)
            .bind(old_uid)
            .bind(next)
            .bind(nextmodseq);
        t.enqueue(&q);
        next += 1;
    }

    let q = Query::new(format!(
        "delete from deleted_messages where mailbox = $1 and {}",
        uids.where_clause("uid")
    ));
    q.borrow_mut().bind(mailbox_id);
    t.enqueue(&q);

    let q = Query::new(
        "update mailboxes set uidnext = $2, nextmodseq = $3 \
         where id = $1",
    );
    q.borrow_mut()
        .bind(mailbox_id)
        .bind(next)
        .bind(nextmodseq + 1);
    t.enqueue(&q);
    t.execute();

    if t.failed() {
        let cause = t.error().unwrap_or("").to_owned();
        let _ = t.rollback();
        return Err(Error::TransactionFailed(cause));
    }

    let restored = uids.len();
    if request.dry_run {
        lines.push(
            "Cancelling undelete due to -n. Rerun without -n to \
             actually undelete."
                .to_owned(),
        );
        t.rollback()?;
    } else {
        t.commit()?;
        registry.refresh(cxn, Some(&request.mailbox))?;
    }

    Ok(Report { lines, restored })
}

/// Parses the command-line search keys into a selector. Keys combine
/// with an implicit AND.
pub fn parse_selector(args: &[String]) -> Result<Selector, Error> {
    let mut it = args.iter().map(String::as_str);
    let mut keys = Vec::new();
    while let Some(first) = next_key(&mut it)? {
        keys.push(first);
    }
    if keys.is_empty() {
        return Err(Error::BadSelector("no search keys".to_owned()));
    }
    Ok(Selector::new(Cond::And(keys)))
}

fn next_key<'a>(
    it: &mut impl Iterator<Item = &'a str>,
) -> Result<Option<Cond>, Error> {
    let word = match it.next() {
        Some(w) => w,
        None => return Ok(None),
    };
    parse_key(word, it).map(Some)
}

fn parse_key<'a>(
    word: &str,
    it: &mut impl Iterator<Item = &'a str>,
) -> Result<Cond, Error> {
    fn arg<'a>(
        it: &mut impl Iterator<Item = &'a str>,
        key: &str,
    ) -> Result<&'a str, Error> {
        it.next().ok_or_else(|| {
            Error::BadSelector(format!("{} needs an argument", key))
        })
    }

    match word.to_ascii_lowercase().as_str() {
        "all" => Ok(Cond::All),
        "uid" => {
            let set = arg(it, "uid")?;
            UidSet::parse_imap(set)
                .map(Cond::Uid)
                .ok_or_else(|| {
                    Error::BadSelector(format!("bad uid set: {}", set))
                })
        },
        "flag" => Ok(Cond::Flag(arg(it, "flag")?.to_owned())),
        "header" => {
            let name = arg(it, "header")?.to_owned();
            let pattern = arg(it, "header")?.to_owned();
            Ok(Cond::HeaderField { name, pattern })
        },
        "body" => Ok(Cond::Body(arg(it, "body")?.to_owned())),
        "larger" => parse_number(arg(it, "larger")?).map(Cond::Larger),
        "smaller" => {
            parse_number(arg(it, "smaller")?).map(Cond::Smaller)
        },
        "modseq" => Ok(Cond::ModseqAtLeast(
            parse_number(arg(it, "modseq")?)? as u64,
        )),
        "not" => {
            let inner = arg(it, "not")?;
            Ok(Cond::Not(Box::new(parse_key(inner, it)?)))
        },
        "or" => {
            let a = arg(it, "or")?;
            let a = parse_key(a, it)?;
            let b = arg(it, "or")?;
            let b = parse_key(b, it)?;
            Ok(Cond::Or(vec![a, b]))
        },
        other => Err(Error::BadSelector(format!(
            "unknown search key: {}",
            other
        ))),
    }
}

fn parse_number(s: &str) -> Result<u32, Error> {
    s.parse().map_err(|_| {
        Error::BadSelector(format!("bad number: {}", s))
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::inject;
    use crate::store::intern::{self, InternKind};
    use crate::store::mailbox::Mbx;
    use crate::store::message::Message;
    use crate::store::model::UserId;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|&s| s.to_owned()).collect()
    }

    #[test]
    fn selector_parsing() {
        let s = parse_selector(&args(&["uid", "1:5,9"])).unwrap();
        assert_eq!(
            &Cond::And(vec![Cond::Uid(
                UidSet::parse_imap("1:5,9").unwrap()
            )]),
            s.root()
        );

        let s = parse_selector(&args(&[
            "flag", "\\Seen", "larger", "100",
        ]))
        .unwrap();
        assert_eq!(
            &Cond::And(vec![
                Cond::Flag("\\Seen".to_owned()),
                Cond::Larger(100),
            ]),
            s.root()
        );

        let s = parse_selector(&args(&[
            "or", "uid", "1", "not", "flag", "x",
        ]))
        .unwrap();
        assert_eq!(
            &Cond::And(vec![Cond::Or(vec![
                Cond::Uid(UidSet::parse_imap("1").unwrap()),
                Cond::Not(Box::new(Cond::Flag("x".to_owned()))),
            ])]),
            s.root()
        );

        assert_matches!(Err(Error::BadSelector(_)), parse_selector(&[]));
        assert_matches!(
            Err(Error::BadSelector(_)),
            parse_selector(&args(&["frobnicate"]))
        );
        assert_matches!(
            Err(Error::BadSelector(_)),
            parse_selector(&args(&["uid"]))
        );
    }

    struct Fixture {
        cxn: Connection,
        registry: Registry,
        mbx: Mbx,
    }

    const RAW: &[u8] = b"From: a@b.c\r\n\
Date: Mon, 01 Jun 2009 12:00:00 +0000\r\n\
Subject: victim\r\n\
\r\n\
body\r\n";

    fn fixture() -> Fixture {
        let mut cxn = Connection::open_in_memory().unwrap();
        {
            let mut t = cxn.transaction().unwrap();
            let q = Query::new(
                "insert into mailboxes (name) values ('/a/b')",
            );
            t.enqueue(&q);
            let q = Query::new(
                "insert into users (id, login) values (1, 'alice')",
            );
            t.enqueue(&q);
            t.commit().unwrap();
        }
        let mut registry = Registry::setup(&mut cxn).unwrap();
        let mbx = registry.find("/a/b", false).unwrap();

        Fixture {
            cxn,
            registry,
            mbx,
        }
    }

    fn snapshot(cxn: &mut Connection, sql: &str) -> Vec<String> {
        let q = Query::new(sql);
        cxn.run(&mut q.borrow_mut());
        let mut out = Vec::new();
        let mut q = q.borrow_mut();
        while let Some(row) = q.next_row() {
            out.push(format!("{:?}", row));
        }
        out
    }

    #[test]
    fn dry_run_changes_nothing() {
        let _lock = intern::test_lock();
        InternKind::Flags.clear();
        InternKind::FieldNames.clear();

        let mut f = fixture();

        // Deliver 42 messages and expunge UID 42.
        let m = Message::parse(RAW);
        for _ in 0..42 {
            inject::inject(
                &mut f.cxn,
                &mut f.registry,
                f.mbx,
                &m,
                &[],
            )
            .unwrap();
        }
        inject::expunge(
            &mut f.cxn,
            &mut f.registry,
            f.mbx,
            &UidSet::just(Uid::u(42)),
            Some(UserId(1)),
            "tidy",
        )
        .unwrap();

        let deleted_before = snapshot(
            &mut f.cxn,
            "select * from deleted_messages order by uid",
        );
        let mailbox_before = snapshot(
            &mut f.cxn,
            "select * from mailboxes order by id",
        );
        let uidnext_before = f.registry.uidnext(f.mbx);

        let report = run(
            &mut f.cxn,
            &mut f.registry,
            &Request {
                dry_run: true,
                verbose: true,
                mailbox: "/a/b".to_owned(),
                selector_args: args(&["uid", "42"]),
            },
        )
        .unwrap();

        assert_eq!(1, report.restored);
        assert!(report.lines[0].contains("Undeleting 1 messages"));
        assert!(report
            .lines
            .iter()
            .any(|l| l.contains("deleted by \"alice\"")));
        assert!(report
            .lines
            .iter()
            .any(|l| l.contains("Cancelling undelete")));

        // Byte-identical state: the dry run rolled everything back.
        assert_eq!(
            deleted_before,
            snapshot(
                &mut f.cxn,
                "select * from deleted_messages order by uid"
            )
        );
        assert_eq!(
            mailbox_before,
            snapshot(&mut f.cxn, "select * from mailboxes order by id")
        );
        assert_eq!(uidnext_before, f.registry.uidnext(f.mbx));

        // And mailbox_messages still lacks UID 42.
        let q = Query::new(
            "select count(*) as n from mailbox_messages where uid = 42",
        );
        f.cxn.run(&mut q.borrow_mut());
        assert_eq!(
            0,
            q.borrow_mut().next_row().unwrap().get_i64("n")
        );
    }

    #[test]
    fn undelete_restores_with_fresh_uids() {
        let _lock = intern::test_lock();
        InternKind::Flags.clear();
        InternKind::FieldNames.clear();

        let mut f = fixture();
        let m = Message::parse(RAW);
        for _ in 0..3 {
            inject::inject(
                &mut f.cxn,
                &mut f.registry,
                f.mbx,
                &m,
                &[],
            )
            .unwrap();
        }
        inject::expunge(
            &mut f.cxn,
            &mut f.registry,
            f.mbx,
            &UidSet::parse_imap("1:2").unwrap(),
            None,
            "",
        )
        .unwrap();

        let report = run(
            &mut f.cxn,
            &mut f.registry,
            &Request {
                dry_run: false,
                verbose: false,
                mailbox: "/a/b".to_owned(),
                selector_args: args(&["all"]),
            },
        )
        .unwrap();
        assert_eq!(2, report.restored);

        // The recovered messages continue the UID series at uidnext.
        let q = Query::new(
            "select uid from mailbox_messages order by uid",
        );
        f.cxn.run(&mut q.borrow_mut());
        let mut uids = Vec::new();
        while let Some(row) = q.borrow_mut().next_row() {
            uids.push(row.get_u32("uid"));
        }
        assert_eq!(vec![3, 4, 5], uids);

        // deleted_messages is empty again and uidnext advanced.
        let q = Query::new(
            "select count(*) as n from deleted_messages",
        );
        f.cxn.run(&mut q.borrow_mut());
        assert_eq!(
            0,
            q.borrow_mut().next_row().unwrap().get_i64("n")
        );
        assert_eq!(6, f.registry.uidnext(f.mbx));
    }

    #[test]
    fn undelete_recreates_deleted_mailbox() {
        let _lock = intern::test_lock();
        InternKind::Flags.clear();
        InternKind::FieldNames.clear();

        let mut f = fixture();
        let m = Message::parse(RAW);
        inject::inject(&mut f.cxn, &mut f.registry, f.mbx, &m, &[])
            .unwrap();
        inject::expunge(
            &mut f.cxn,
            &mut f.registry,
            f.mbx,
            &UidSet::just(Uid::u(1)),
            None,
            "",
        )
        .unwrap();

        // Delete the mailbox itself.
        {
            let mut t = f.cxn.transaction().unwrap();
            assert!(f.registry.enqueue_remove(&mut t, f.mbx));
            t.commit().unwrap();
        }
        f.registry.refresh(&mut f.cxn, None).unwrap();
        assert!(f.registry.find("/a/b", false).is_none());

        let report = run(
            &mut f.cxn,
            &mut f.registry,
            &Request {
                dry_run: false,
                verbose: false,
                mailbox: "/a/b".to_owned(),
                selector_args: args(&["all"]),
            },
        )
        .unwrap();

        assert!(report.lines.iter().any(|l| l.contains("recreated")));
        assert!(f.registry.find("/a/b", false).is_some());
        assert!(report.restored >= 1);
    }
}
