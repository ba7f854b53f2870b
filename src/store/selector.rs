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

//! Search selectors and their compilation to SQL.
//!
//! A selector is a boolean expression over message predicates. It compiles
//! to a `select distinct` over `mailbox_messages mm` (or
//! `deleted_messages mm`, for undelete searches); predicates become
//! `exists` subqueries against the satellite tables, so and/or/not compose
//! without join bookkeeping. The selector owns the `$n` placeholder
//! numbering; later consumers (the sort planner) continue it via
//! `place_holder`.

use std::cell::Cell;

use chrono::NaiveDate;
use itertools::Itertools;

use crate::db::query::{Query, QueryRef, Value};

use super::model::{MailboxId, UidSet, UserId};

/// One node of the selector expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Cond {
    /// Matches every message.
    All,
    /// Matches no message.
    Nothing,
    Uid(UidSet),
    /// Flag set membership, by (case-insensitive) flag name.
    Flag(String),
    /// Header-field substring match.
    HeaderField { name: String, pattern: String },
    /// Body text substring match.
    Body(String),
    /// `modseq` at least this value.
    ModseqAtLeast(u64),
    /// `rfc822size` strictly greater.
    Larger(u32),
    /// `rfc822size` strictly smaller.
    Smaller(u32),
    /// Internal date strictly before this day.
    Before(NaiveDate),
    /// Internal date within this day.
    On(NaiveDate),
    /// Internal date on or after this day.
    Since(NaiveDate),
    And(Vec<Cond>),
    Or(Vec<Cond>),
    Not(Box<Cond>),
}

#[derive(Debug)]
pub struct Selector {
    root: Cond,
    placeholders: Cell<u32>,
}

impl Selector {
    pub fn new(root: Cond) -> Self {
        Selector {
            root,
            placeholders: Cell::new(0),
        }
    }

    pub fn from_uid_set(set: UidSet) -> Self {
        Selector::new(Cond::Uid(set))
    }

    pub fn root(&self) -> &Cond {
        &self.root
    }

    /// Applies boolean simplification: double negation, constant folding,
    /// and empty/singleton and-or collapse. Idempotent.
    pub fn simplify(&mut self) {
        self.root = simplify_cond(std::mem::replace(
            &mut self.root,
            Cond::All,
        ));
    }

    /// The UID-set form, if the selector reduces to one.
    pub fn message_set(&self) -> Option<&UidSet> {
        match self.root {
            Cond::Uid(ref set) => Some(set),
            _ => None,
        }
    }

    /// Whether this selects from a single mailbox based only on UIDs.
    pub fn is_uid_only(&self) -> bool {
        self.message_set().is_some()
    }

    /// Allocates the next `$n` placeholder number.
    ///
    /// Consumers that extend the rendered query (the sort planner) use
    /// this so their bindings continue the selector's numbering.
    pub fn place_holder(&self) -> u32 {
        let n = self.placeholders.get() + 1;
        self.placeholders.set(n);
        n
    }

    /// Compiles to a query over the mailbox.
    ///
    /// `wanted` lists the `mm` columns to project; callers extend it to
    /// drive their row decoders. `deleted` selects from
    /// `deleted_messages` instead, for undelete searches. `order` appends
    /// `order by mm.uid`.
    pub fn query(
        &self,
        _user: Option<UserId>,
        mailbox: MailboxId,
        deleted: bool,
        wanted: &[&str],
        order: bool,
    ) -> QueryRef {
        self.placeholders.set(0);
        let mut params: Vec<Value> = Vec::new();

        let mailbox_ph = self.place_holder();
        params.push(mailbox.into());

        let mut sql = format!(
            "select distinct mm.{} from {} mm where mm.mailbox=${}",
            wanted.iter().join(", mm."),
            if deleted {
                "deleted_messages"
            } else {
                "mailbox_messages"
            },
            mailbox_ph
        );

        let cond = self.compile(&self.root, &mut params);
        if "true" != cond {
            sql.push_str(" and ");
            sql.push_str(&cond);
        }

        if order {
            sql.push_str(" order by mm.uid");
        }

        let q = Query::new(sql);
        for p in params {
            q.borrow_mut().bind(p);
        }
        q
    }

    fn compile(&self, cond: &Cond, params: &mut Vec<Value>) -> String {
        match *cond {
            Cond::All => "true".to_owned(),
            Cond::Nothing => "false".to_owned(),

            Cond::Uid(ref set) => set.where_clause("mm.uid"),

            Cond::Flag(ref name) => {
                let ph = self.place_holder();
                params.push(name.as_str().into());
                format!(
                    "exists (select 1 from flags f \
                     join flag_names fn on (f.flag=fn.id) \
                     where f.mailbox=mm.mailbox and f.uid=mm.uid \
                       and lower(fn.name)=lower(${}))",
                    ph
                )
            },

            Cond::HeaderField {
                ref name,
                ref pattern,
            } => {
                let name_ph = self.place_holder();
                params.push(name.as_str().into());
                let pat_ph = self.place_holder();
                params.push(format!("%{}%", like_escape(pattern)).into());
                format!(
                    "exists (select 1 from header_fields hf \
                     join field_names fn on (hf.field=fn.id) \
                     where hf.message=mm.message \
                       and lower(fn.name)=lower(${}) \
                       and hf.value like ${} escape '\\')",
                    name_ph, pat_ph
                )
            },

            Cond::Body(ref text) => {
                let ph = self.place_holder();
                params.push(format!("%{}%", like_escape(text)).into());
                format!(
                    "exists (select 1 from part_numbers pn \
                     join bodyparts bp on (pn.bodypart=bp.id) \
                     where pn.message=mm.message \
                       and bp.text like ${} escape '\\')",
                    ph
                )
            },

            Cond::ModseqAtLeast(n) => {
                let ph = self.place_holder();
                params.push(n.into());
                format!("mm.modseq>=${}", ph)
            },

            Cond::Larger(n) => {
                let ph = self.place_holder();
                params.push(n.into());
                format!(
                    "exists (select 1 from messages m \
                     where m.id=mm.message and m.rfc822size>${})",
                    ph
                )
            },

            Cond::Smaller(n) => {
                let ph = self.place_holder();
                params.push(n.into());
                format!(
                    "exists (select 1 from messages m \
                     where m.id=mm.message and m.rfc822size<${})",
                    ph
                )
            },

            Cond::Before(day) => {
                let ph = self.place_holder();
                params.push(day_start(day).into());
                format!(
                    "exists (select 1 from messages m \
                     where m.id=mm.message and m.idate<${})",
                    ph
                )
            },

            Cond::On(day) => {
                let a = self.place_holder();
                params.push(day_start(day).into());
                let b = self.place_holder();
                params.push(day_end(day).into());
                format!(
                    "exists (select 1 from messages m \
                     where m.id=mm.message \
                       and m.idate>=${} and m.idate<${})",
                    a, b
                )
            },

            Cond::Since(day) => {
                let ph = self.place_holder();
                params.push(day_start(day).into());
                format!(
                    "exists (select 1 from messages m \
                     where m.id=mm.message and m.idate>=${})",
                    ph
                )
            },

            Cond::And(ref subs) => {
                if subs.is_empty() {
                    return "true".to_owned();
                }
                format!(
                    "({})",
                    subs.iter()
                        .map(|s| self.compile(s, params))
                        .join(" and ")
                )
            },

            Cond::Or(ref subs) => {
                if subs.is_empty() {
                    return "false".to_owned();
                }
                format!(
                    "({})",
                    subs.iter()
                        .map(|s| self.compile(s, params))
                        .join(" or ")
                )
            },

            Cond::Not(ref sub) => {
                format!("not ({})", self.compile(sub, params))
            },
        }
    }
}

fn simplify_cond(cond: Cond) -> Cond {
    match cond {
        Cond::And(subs) => {
            let mut out = Vec::new();
            for sub in subs {
                match simplify_cond(sub) {
                    Cond::All => (),
                    Cond::Nothing => return Cond::Nothing,
                    // Flatten nested conjunctions.
                    Cond::And(inner) => out.extend(inner),
                    s => out.push(s),
                }
            }
            match out.len() {
                0 => Cond::All,
                1 => out.into_iter().next().unwrap(),
                _ => Cond::And(out),
            }
        },

        Cond::Or(subs) => {
            let mut out = Vec::new();
            for sub in subs {
                match simplify_cond(sub) {
                    Cond::Nothing => (),
                    Cond::All => return Cond::All,
                    Cond::Or(inner) => out.extend(inner),
                    s => out.push(s),
                }
            }
            match out.len() {
                0 => Cond::Nothing,
                1 => out.into_iter().next().unwrap(),
                _ => Cond::Or(out),
            }
        },

        Cond::Not(sub) => match simplify_cond(*sub) {
            Cond::All => Cond::Nothing,
            Cond::Nothing => Cond::All,
            Cond::Not(inner) => *inner,
            s => Cond::Not(Box::new(s)),
        },

        Cond::Uid(set) if set.is_empty() => Cond::Nothing,

        c => c,
    }
}

fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn day_start(day: NaiveDate) -> i64 {
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

fn day_end(day: NaiveDate) -> i64 {
    day.succ_opt().map(day_start).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::super::model::Uid;
    use super::*;

    fn uid_cond(s: &str) -> Cond {
        Cond::Uid(UidSet::parse_imap(s).unwrap())
    }

    #[test]
    fn simplify_rules() {
        let mut s = Selector::new(Cond::Not(Box::new(Cond::Not(
            Box::new(Cond::Flag("\\Seen".to_owned())),
        ))));
        s.simplify();
        assert_eq!(&Cond::Flag("\\Seen".to_owned()), s.root());

        let mut s = Selector::new(Cond::And(vec![]));
        s.simplify();
        assert_eq!(&Cond::All, s.root());

        let mut s = Selector::new(Cond::Or(vec![]));
        s.simplify();
        assert_eq!(&Cond::Nothing, s.root());

        let mut s = Selector::new(Cond::And(vec![
            Cond::All,
            uid_cond("1:4"),
            Cond::And(vec![Cond::All]),
        ]));
        s.simplify();
        assert_eq!(&uid_cond("1:4"), s.root());

        let mut s = Selector::new(Cond::And(vec![
            uid_cond("1:4"),
            Cond::Nothing,
        ]));
        s.simplify();
        assert_eq!(&Cond::Nothing, s.root());

        let mut s = Selector::new(Cond::Or(vec![
            uid_cond("1:4"),
            Cond::All,
        ]));
        s.simplify();
        assert_eq!(&Cond::All, s.root());

        let mut s = Selector::new(Cond::Not(Box::new(Cond::All)));
        s.simplify();
        assert_eq!(&Cond::Nothing, s.root());
    }

    #[test]
    fn message_set_form() {
        let mut s = Selector::new(Cond::And(vec![uid_cond("3:9")]));
        assert_eq!(None, s.message_set());
        s.simplify();
        assert_eq!("3:9", s.message_set().unwrap().imap_form());
        assert!(s.is_uid_only());
    }

    #[test]
    fn rendered_query_shape() {
        let s = Selector::new(Cond::And(vec![
            Cond::Flag("\\Deleted".to_owned()),
            uid_cond("1:100"),
        ]));
        let q = s.query(
            None,
            MailboxId(7),
            false,
            &["mailbox", "uid"],
            true,
        );
        let q = q.borrow();
        let sql = q.sql();

        // Anchors the sort planner and the fetcher splice against.
        assert!(sql.starts_with("select distinct mm.mailbox, mm.uid"));
        assert!(sql.contains(" where "));
        assert!(sql.contains("mm.uid"));
        assert!(sql.ends_with(" order by mm.uid"));
        assert!(sql.contains("from mailbox_messages mm"));
        assert!(sql.contains("mm.mailbox=$1"));
        // The flag predicate binds $2.
        assert_eq!(2, q.params().len());
        assert_eq!(&Value::Text("\\Deleted".to_owned()), &q.params()[1]);
    }

    #[test]
    fn deleted_queries_use_deleted_messages() {
        let s = Selector::from_uid_set(UidSet::just(Uid::u(42)));
        let q = s.query(None, MailboxId(3), true, &["uid"], true);
        assert!(q
            .borrow()
            .sql()
            .contains("from deleted_messages mm"));
        assert!(q.borrow().sql().contains("mm.uid=42"));
    }

    #[test]
    fn placeholder_numbering_continues() {
        let s = Selector::new(Cond::Flag("x".to_owned()));
        let q = s.query(None, MailboxId(1), false, &["uid"], false);
        assert_eq!(2, q.borrow().params().len());
        // A later consumer picks up at $3.
        assert_eq!(3, s.place_holder());
        assert_eq!(4, s.place_holder());
    }

    fn arb_cond() -> impl Strategy<Value = Cond> {
        let leaf = prop_oneof![
            Just(Cond::All),
            Just(Cond::Nothing),
            Just(Cond::Flag("\\Seen".to_owned())),
            Just(uid_cond("1:5")),
            Just(Cond::Larger(100)),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4)
                    .prop_map(Cond::And),
                prop::collection::vec(inner.clone(), 0..4)
                    .prop_map(Cond::Or),
                inner.prop_map(|c| Cond::Not(Box::new(c))),
            ]
        })
    }

    proptest! {
        #[test]
        fn simplify_is_idempotent(c in arb_cond()) {
            let mut once = Selector::new(c);
            once.simplify();
            let mut twice = Selector::new(once.root().clone());
            twice.simplify();
            prop_assert_eq!(once.root(), twice.root());
        }
    }
}
