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

//! Identifier newtypes and UID sets.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;

use crate::db::query::Value;

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1, increase monotonically, and are never reused. The
/// maximum stops one short of `u32::MAX`: a mailbox that reaches the end
/// of the series refuses further assignment rather than wrapping.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub NonZeroU32);

impl Uid {
    pub const MIN: Self = match NonZeroU32::new(1) {
        Some(n) => Uid(n),
        None => unreachable!(),
    };
    pub const MAX: Self = match NonZeroU32::new(u32::MAX - 1) {
        Some(n) => Uid(n),
        None => unreachable!(),
    };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid).filter(|&u| u <= Uid::MAX)
    }

    pub fn next(self) -> Option<Self> {
        if Uid::MAX == self {
            None
        } else {
            Uid::of(self.0.get() + 1)
        }
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

impl From<Uid> for u32 {
    fn from(u: Uid) -> u32 {
        u.0.get()
    }
}

impl From<Uid> for Value {
    fn from(u: Uid) -> Value {
        Value::Int(u.0.get() as i64)
    }
}

/// The per-mailbox change counter.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Modseq(pub u64);

impl Modseq {
    pub const MIN: Self = Modseq(1);

    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Modseq)
    }
}

impl From<Modseq> for Value {
    fn from(m: Modseq) -> Value {
        Value::Int(m.0 as i64)
    }
}

/// Database id of a `mailboxes` row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MailboxId(pub i64);

impl From<MailboxId> for Value {
    fn from(id: MailboxId) -> Value {
        Value::Int(id.0)
    }
}

/// Database id of a `messages` row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub i64);

impl From<MessageId> for Value {
    fn from(id: MessageId) -> Value {
        Value::Int(id.0)
    }
}

/// Database id of a `users` row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(pub i64);

impl From<UserId> for Value {
    fn from(id: UserId) -> Value {
        Value::Int(id.0)
    }
}

/// A set of UIDs, maintained as a minimal sorted set of inclusive ranges.
///
/// No information about the original fragmentation or ordering is kept,
/// and there is no removal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UidSet {
    parts: BTreeMap<u32, u32>,
}

impl UidSet {
    pub fn new() -> Self {
        UidSet::default()
    }

    pub fn just(uid: Uid) -> Self {
        let mut s = UidSet::new();
        s.add(uid);
        s
    }

    pub fn range(start: Uid, end: Uid) -> Self {
        let mut s = UidSet::new();
        s.insert_range(start, end);
        s
    }

    pub fn add(&mut self, uid: Uid) {
        self.insert_raw(uid.into(), uid.into());
    }

    pub fn insert_range(&mut self, start: Uid, end: Uid) {
        assert!(end >= start);
        self.insert_raw(start.into(), end.into());
    }

    fn insert_raw(&mut self, mut start: u32, mut end: u32) {
        // Merge with any range that overlaps or abuts.
        loop {
            let overlapping = self
                .parts
                .range(..=end.saturating_add(1))
                .rev()
                .next()
                .filter(|&(_, &e)| e.saturating_add(1) >= start)
                .map(|(&s, &e)| (s, e));

            match overlapping {
                Some((s, e)) => {
                    self.parts.remove(&s);
                    start = start.min(s);
                    end = end.max(e);
                },
                None => break,
            }
        }
        self.parts.insert(start, end);
    }

    pub fn contains(&self, uid: Uid) -> bool {
        let uid: u32 = uid.into();
        self.parts
            .range(..=uid)
            .rev()
            .next()
            .map_or(false, |(_, &e)| e >= uid)
    }

    pub fn len(&self) -> usize {
        self.parts
            .iter()
            .map(|(&s, &e)| (e - s) as usize + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Whether the set is one contiguous range.
    pub fn is_range(&self) -> bool {
        self.parts.len() <= 1
    }

    pub fn smallest(&self) -> Option<Uid> {
        self.parts.keys().next().and_then(|&s| Uid::of(s))
    }

    pub fn largest(&self) -> Option<Uid> {
        self.parts.values().next_back().and_then(|&e| Uid::of(e))
    }

    pub fn iter(&self) -> impl Iterator<Item = Uid> + '_ {
        self.parts
            .iter()
            .flat_map(|(&s, &e)| (s..=e).filter_map(Uid::of))
    }

    /// An SQL condition selecting this set's UIDs in column `col`.
    pub fn where_clause(&self, col: &str) -> String {
        if self.parts.is_empty() {
            return "false".to_owned();
        }

        let terms: Vec<String> = self
            .parts
            .iter()
            .map(|(&s, &e)| {
                if s == e {
                    format!("{}={}", col, s)
                } else {
                    format!("({}>={} and {}<={})", col, s, col, e)
                }
            })
            .collect();

        if 1 == terms.len() {
            terms.into_iter().next().unwrap()
        } else {
            format!("({})", terms.join(" or "))
        }
    }

    /// The IMAP wire form, `1:5,9`.
    pub fn imap_form(&self) -> String {
        self.parts
            .iter()
            .map(|(&s, &e)| {
                if s == e {
                    s.to_string()
                } else {
                    format!("{}:{}", s, e)
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parses the IMAP wire form.
    pub fn parse_imap(s: &str) -> Option<Self> {
        let mut set = UidSet::new();
        for chunk in s.split(',') {
            let chunk = chunk.trim();
            if chunk.is_empty() {
                return None;
            }
            match chunk.find(':') {
                Some(colon) => {
                    let a: u32 = chunk[..colon].parse().ok()?;
                    let b: u32 = chunk[colon + 1..].parse().ok()?;
                    let (a, b) = (a.min(b), a.max(b));
                    set.insert_range(Uid::of(a)?, Uid::of(b)?);
                },
                None => {
                    set.add(Uid::of(chunk.parse().ok()?)?);
                },
            }
        }
        Some(set)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uid_bounds() {
        assert_eq!(None, Uid::of(0));
        assert_eq!(None, Uid::of(u32::MAX));
        assert!(Uid::of(u32::MAX - 1).is_some());
        assert_eq!(None, Uid::MAX.next());
        assert_eq!(Some(Uid::u(2)), Uid::MIN.next());
    }

    #[test]
    fn uid_set_merging() {
        let mut s = UidSet::new();
        s.add(Uid::u(5));
        s.add(Uid::u(7));
        s.add(Uid::u(6));
        assert!(s.is_range());
        assert_eq!(3, s.len());
        assert!(s.contains(Uid::u(6)));
        assert!(!s.contains(Uid::u(8)));
        assert_eq!("5:7", s.imap_form());

        s.add(Uid::u(10));
        assert!(!s.is_range());
        assert_eq!("5:7,10", s.imap_form());
        assert_eq!(4, s.len());

        s.insert_range(Uid::u(8), Uid::u(9));
        assert_eq!("5:10", s.imap_form());
    }

    #[test]
    fn uid_set_where_clause() {
        assert_eq!("false", UidSet::new().where_clause("mm.uid"));
        assert_eq!(
            "mm.uid=42",
            UidSet::just(Uid::u(42)).where_clause("mm.uid")
        );
        assert_eq!(
            "(mm.uid>=1 and mm.uid<=5)",
            UidSet::range(Uid::u(1), Uid::u(5)).where_clause("mm.uid")
        );

        let mut s = UidSet::range(Uid::u(1), Uid::u(5));
        s.add(Uid::u(9));
        assert_eq!(
            "((mm.uid>=1 and mm.uid<=5) or mm.uid=9)",
            s.where_clause("mm.uid")
        );
    }

    #[test]
    fn imap_form_round_trip() {
        let s = UidSet::parse_imap("1:5,9,20:22").unwrap();
        assert_eq!("1:5,9,20:22", s.imap_form());
        assert_eq!(None, UidSet::parse_imap(""));
        assert_eq!(None, UidSet::parse_imap("x"));
        assert_eq!(None, UidSet::parse_imap("0"));
        // Reversed ranges normalise.
        assert_eq!(
            "3:7",
            UidSet::parse_imap("7:3").unwrap().imap_form()
        );
    }

    #[test]
    fn smallest_largest_iter() {
        let s = UidSet::parse_imap("4,2,8:9").unwrap();
        assert_eq!(Some(Uid::u(2)), s.smallest());
        assert_eq!(Some(Uid::u(9)), s.largest());
        assert_eq!(
            vec![Uid::u(2), Uid::u(4), Uid::u(8), Uid::u(9)],
            s.iter().collect::<Vec<_>>()
        );
    }
}
