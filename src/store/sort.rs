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

//! The sort planner.
//!
//! A sort is an ordered list of criteria, each with a reverse bit. After
//! the selector renders its query, each criterion splices a join clause
//! after the first ` where `, an expression into the `order by` list, and
//! the same expression into the projection (`select distinct` insists on
//! that). The splice is textual; the anchor strings are pinned by tests
//! here and in the selector.

use crate::db::query::{Query, QueryRef};
use crate::db::Connection;
use crate::mime::field::FieldType;
use crate::support::error::Error;

use super::model::{MailboxId, UserId};
use super::selector::Selector;

#[derive(Clone, Debug, PartialEq)]
pub enum SortCriterion {
    Arrival,
    Cc,
    Date,
    From,
    Size,
    Subject,
    To,
    Annotation { entry: String, private: bool },
}

impl SortCriterion {
    fn kind(&self) -> u32 {
        match *self {
            SortCriterion::Arrival => 0,
            SortCriterion::Cc => 1,
            SortCriterion::Date => 2,
            SortCriterion::From => 3,
            SortCriterion::Size => 4,
            SortCriterion::Subject => 5,
            SortCriterion::To => 6,
            SortCriterion::Annotation { .. } => 7,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SortKey {
    pub criterion: SortCriterion,
    pub reverse: bool,
}

pub struct Sort {
    keys: Vec<SortKey>,
}

impl Sort {
    /// Builds a sort; a criterion type occurring twice keeps only its
    /// first occurrence.
    pub fn new(keys: Vec<SortKey>) -> Self {
        let mut seen = Vec::new();
        let mut out = Vec::new();
        for key in keys {
            let kind = key.criterion.kind();
            if !seen.contains(&kind) {
                seen.push(kind);
                out.push(key);
            }
        }
        Sort { keys: out }
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    /// Whether any key sorts by subject (and thus needs the threads
    /// updated first).
    pub fn wants_subject(&self) -> bool {
        self.keys
            .iter()
            .any(|k| SortCriterion::Subject == k.criterion)
    }

    /// Splices the sort into `q`, which must be the selector's rendered
    /// query. Annotation keys bind their entry name (and the requesting
    /// user, for private entries) through the selector's placeholder
    /// counter.
    pub fn apply(
        &self,
        selector: &Selector,
        q: &QueryRef,
        user: Option<UserId>,
    ) {
        let mut sql = q.borrow().sql().to_owned();

        for key in &self.keys {
            let (join, orderby): (String, &str) = match key.criterion {
                SortCriterion::Arrival => (
                    "join messages sar on (sar.id=mm.message) ".to_owned(),
                    "sar.idate",
                ),
                SortCriterion::Cc => (
                    format!(
                        "left join address_fields sccaf on \
                         (mm.message=sccaf.message and \
                          sccaf.part='' and sccaf.number=0 and \
                          sccaf.field={}) \
                         left join addresses scca on \
                         (sccaf.address=scca.id) ",
                        FieldType::Cc as u32
                    ),
                    "scca.localpart",
                ),
                SortCriterion::Date => (
                    "join date_fields sddf on (mm.message=sddf.message) "
                        .to_owned(),
                    "sddf.value",
                ),
                SortCriterion::From => (
                    format!(
                        "join address_fields sfaf on \
                         (mm.message=sfaf.message and \
                          sfaf.part='' and sfaf.number=0 and \
                          sfaf.field={}) \
                         join addresses sfa on (sfaf.address=sfa.id) ",
                        FieldType::From as u32
                    ),
                    "sfa.localpart",
                ),
                SortCriterion::Size => (
                    "join messages m on (m.id=mm.message) ".to_owned(),
                    "m.rfc822size",
                ),
                SortCriterion::Subject => (
                    "left join thread_members sstm on \
                     (mm.mailbox=sstm.mailbox and mm.uid=sstm.uid) \
                     left join threads sst on (sstm.thread=sst.id) "
                        .to_owned(),
                    "lower(sst.subject)",
                ),
                SortCriterion::To => (
                    format!(
                        "left join address_fields staf on \
                         (mm.message=staf.message and \
                          staf.part='' and staf.number=0 and \
                          staf.field={}) \
                         left join addresses sta on (staf.address=sta.id) ",
                        FieldType::To as u32
                    ),
                    "sta.localpart",
                ),
                SortCriterion::Annotation {
                    ref entry,
                    private,
                } => {
                    let b1 = selector.place_holder();
                    q.borrow_mut().bind(entry.to_lowercase());
                    let owner_cond = if private {
                        let b2 = selector.place_holder();
                        q.borrow_mut()
                            .bind(user.map(|u| u.0).unwrap_or_default());
                        format!("saa.owner=${}", b2)
                    } else {
                        "saa.owner is null".to_owned()
                    };
                    (
                        format!(
                            "left join annotations saa on \
                             (mm.mailbox=saa.mailbox and \
                              mm.uid=saa.uid and {} and saa.name=\
                              (select id from annotation_names \
                               where lower(name)=${})) ",
                            owner_cond, b1
                        ),
                        "saa.value",
                    )
                },
            };

            add_join(&mut sql, &join, orderby, key.reverse);
        }

        q.borrow_mut().set_sql(sql);
    }
}

/// Splices one criterion into the rendered query text.
///
/// Anchors: the join lands after the first ` where `; the expression goes
/// into the `order by` list before the trailing `mm.uid`; the projection
/// gains the expression right after the first `mm.uid`.
fn add_join(t: &mut String, join: &str, orderby: &str, desc: bool) {
    let w = match t.find(" where ") {
        Some(w) => w,
        None => return,
    };
    t.insert_str(w + 1, join);

    let o = match t.find(" order by ") {
        Some(o) => o + " order by ".len(),
        None => return,
    };

    // Insert before the last comma of the order-by list so earlier keys
    // keep precedence; with no comma yet, prepend.
    let tail = &t[o..];
    match tail.rfind(',') {
        Some(c) => {
            let at = o + c;
            let ins = if desc {
                format!(", {} desc", orderby)
            } else {
                format!(", {}", orderby)
            };
            t.insert_str(at, &ins);
        },
        None => {
            let ins = if desc {
                format!("{} desc, ", orderby)
            } else {
                format!("{}, ", orderby)
            };
            t.insert_str(o, &ins);
        },
    }

    // Include the expression in the projection so select distinct accepts
    // the ordering.
    if let Some(s) = t.find("mm.uid") {
        t.insert_str(s + "mm.uid".len(), &format!(", {}", orderby));
    }
}

/// Rebuilds the thread table for `mailbox` from the stored Subject
/// fields. Subject sorting joins against the result; it must run before a
/// subject sort is compiled.
pub fn refresh_threads(
    cxn: &mut Connection,
    mailbox: MailboxId,
) -> Result<(), Error> {
    let q = Query::new(
        "select mm.uid, hf.value from mailbox_messages mm \
         join header_fields hf on (hf.message=mm.message and hf.part='') \
         join field_names fn on (hf.field=fn.id) \
         where mm.mailbox=$1 and fn.name='Subject'",
    );
    q.borrow_mut().bind(mailbox);
    cxn.run(&mut q.borrow_mut());
    if let Some(e) = q.borrow().error() {
        return Err(Error::QueryFailed(e.to_owned()));
    }

    let mut members = Vec::new();
    {
        let mut q = q.borrow_mut();
        while let Some(row) = q.next_row() {
            members
                .push((row.get_u32("uid"), base_subject(row.get_str("value"))));
        }
    }

    let mut t = cxn.transaction()?;
    for (uid, subject) in members {
        let q = Query::new(
            "insert into threads (mailbox, subject) values ($1, $2) \
             on conflict (mailbox, subject) do nothing",
        );
        q.borrow_mut().bind(mailbox).bind(subject.as_str());
        t.enqueue(&q);

        let q = Query::new(
            "insert into thread_members (thread, mailbox, uid) \
             select id, $1, $3 from threads \
             where mailbox=$1 and subject=$2 \
             on conflict (mailbox, uid) do update set thread=excluded.thread",
        );
        q.borrow_mut()
            .bind(mailbox)
            .bind(subject.as_str())
            .bind(uid);
        t.enqueue(&q);
    }
    t.commit()
}

/// The RFC 5256 "base subject": reply/forward markers and trailing
/// `(fwd)` stripped, whitespace collapsed, case preserved.
fn base_subject(subject: &str) -> String {
    let mut s = subject.trim();

    loop {
        let lower = s.to_lowercase();
        let mut stripped = false;
        for prefix in ["re:", "fwd:", "fw:"] {
            if lower.starts_with(prefix) {
                s = s[prefix.len()..].trim_start();
                stripped = true;
                break;
            }
        }
        // Bracketed list tags like "[users]" before a reply marker.
        if !stripped && s.starts_with('[') {
            if let Some(end) = s.find(']') {
                let rest = s[end + 1..].trim_start();
                let rl = rest.to_lowercase();
                if rl.starts_with("re:")
                    || rl.starts_with("fwd:")
                    || rl.starts_with("fw:")
                {
                    s = rest;
                    stripped = true;
                }
            }
        }
        if !stripped {
            break;
        }
    }

    let mut s = s.trim_end().to_owned();
    let slower = s.to_lowercase();
    if slower.ends_with("(fwd)") {
        s.truncate(s.len() - "(fwd)".len());
    }

    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Wires a sorted search end to end: renders the selector, applies the
/// sort, executes, and returns the matching UIDs in sort order.
pub fn sorted_uids(
    cxn: &mut Connection,
    selector: &Selector,
    sort: &Sort,
    mailbox: MailboxId,
    user: Option<UserId>,
) -> Result<Vec<u32>, Error> {
    if sort.wants_subject() {
        refresh_threads(cxn, mailbox)?;
    }

    let q = selector.query(user, mailbox, false, &["mailbox", "uid"], true);
    sort.apply(selector, &q, user);

    cxn.run(&mut q.borrow_mut());
    if let Some(e) = q.borrow().error() {
        return Err(Error::QueryFailed(e.to_owned()));
    }

    let mut out = Vec::new();
    let mut q = q.borrow_mut();
    while let Some(row) = q.next_row() {
        out.push(row.get_u32("uid"));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::super::selector::Cond;
    use super::*;

    fn base_query() -> (Selector, QueryRef) {
        let s = Selector::new(Cond::All);
        let q = s.query(
            None,
            MailboxId(5),
            false,
            &["mailbox", "uid"],
            true,
        );
        (s, q)
    }

    #[test]
    fn splice_anchors_hold() {
        let (s, q) = base_query();
        let sort = Sort::new(vec![SortKey {
            criterion: SortCriterion::Size,
            reverse: false,
        }]);
        sort.apply(&s, &q, None);
        let q = q.borrow();
        let sql = q.sql();

        // Join spliced after the first " where ".
        assert!(sql.contains(
            "mm join messages m on (m.id=mm.message) where "
        ));
        // Ordering spliced before the trailing mm.uid.
        assert!(sql.ends_with(" order by m.rfc822size, mm.uid"));
        // Projection extended after mm.uid so distinct accepts it.
        assert!(sql.contains(
            "select distinct mm.mailbox, mm.uid, m.rfc822size from"
        ));
    }

    #[test]
    fn reverse_and_multiple_keys() {
        let (s, q) = base_query();
        let sort = Sort::new(vec![
            SortKey {
                criterion: SortCriterion::Size,
                reverse: true,
            },
            SortKey {
                criterion: SortCriterion::Arrival,
                reverse: false,
            },
        ]);
        sort.apply(&s, &q, None);
        let q = q.borrow();
        let sql = q.sql();

        // First key sorts first, reverse marked desc, mm.uid last.
        assert!(sql.ends_with(
            " order by m.rfc822size desc, sar.idate, mm.uid"
        ));
    }

    #[test]
    fn duplicate_criteria_collapse() {
        let sort = Sort::new(vec![
            SortKey {
                criterion: SortCriterion::Size,
                reverse: false,
            },
            SortKey {
                criterion: SortCriterion::Size,
                reverse: true,
            },
        ]);
        assert_eq!(1, sort.keys().len());
        assert!(!sort.keys()[0].reverse);
    }

    #[test]
    fn annotation_key_binds_through_selector() {
        let (s, q) = base_query();
        let before = q.borrow().params().len();

        let sort = Sort::new(vec![SortKey {
            criterion: SortCriterion::Annotation {
                entry: "/comment".to_owned(),
                private: true,
            },
            reverse: false,
        }]);
        sort.apply(&s, &q, Some(UserId(42)));

        let q = q.borrow();
        // Entry name and owner id both bound.
        assert_eq!(before + 2, q.params().len());
        let sql = q.sql();
        assert!(sql.contains("saa.owner=$3"));
        assert!(sql.contains("lower(name)=$2"));
        assert!(sql.ends_with(" order by saa.value, mm.uid"));
    }

    #[test]
    fn test_base_subject() {
        assert_eq!("hello", base_subject("hello"));
        assert_eq!("hello", base_subject("Re: hello"));
        assert_eq!("hello", base_subject("RE: FWD: hello"));
        assert_eq!("hello", base_subject("[list] Re: hello"));
        assert_eq!("hello", base_subject("re:hello (fwd)"));
        assert_eq!("a b", base_subject("  a\t b "));
        assert_eq!("[just a tag]", base_subject("[just a tag]"));
    }
}
