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

//! RFC 5322 structured-field grammar: addresses, date-times, message ids.
//!
//! Includes the "obsolete" syntax throughout, since archived mail is
//! exactly where the obsolete syntax lives on, and the RFC 6532 revision
//! admitting all non-ASCII bytes. Parsers run over `CompleteByteSlice` so
//! end-of-input never reads as an incomplete parse.

use std::str;

use chrono::prelude::*;
use nom::types::CompleteByteSlice;
use nom::*;

/// One parsed mailbox: display name (possibly empty), localpart, domain.
///
/// Groups are flattened to their member mailboxes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub localpart: String,
    pub domain: String,
}

impl Address {
    pub fn new(
        name: impl Into<String>,
        localpart: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Address {
            name: name.into(),
            localpart: localpart.into(),
            domain: domain.into(),
        }
    }

    /// The wire form, `name <localpart@domain>` or bare `localpart@domain`.
    pub fn to_wire(&self) -> String {
        if self.name.is_empty() {
            format!("{}@{}", self.localpart, self.domain)
        } else {
            format!("{} <{}@{}>", self.name, self.localpart, self.domain)
        }
    }
}

fn lossy(i: CompleteByteSlice) -> String {
    String::from_utf8_lossy(i.0).into_owned()
}

fn is_ascii_digit_byte(b: u8) -> bool {
    (b'0'..=b'9').contains(&b)
}

fn is_atext_byte(ch: u8) -> bool {
    (ch >= b'A' && ch <= b'Z')
        || (ch >= b'a' && ch <= b'z')
        || (ch >= b'0' && ch <= b'9')
        || ch == b'!'
        || (ch >= b'#' && ch <= b'\'')
        || ch == b'*'
        || ch == b'+'
        || ch == b'-'
        || ch == b'/'
        || ch == b'='
        || ch == b'?'
        || ch == b'^'
        || ch == b'_'
        || ch == b'`'
        || (ch >= b'{' && ch <= b'~')
        || ch >= 0x80
}

// Quoted pair, 8-bit clean per the obsolete syntax.
named!(quoted_pair<CompleteByteSlice, CompleteByteSlice>,
    preceded!(char!('\\'), take!(1))
);

// Folding white space; unfolding reduces it all to one space.
named!(fws<CompleteByteSlice, CompleteByteSlice>,
    map!(is_a!(" \t\r\n"), |_| CompleteByteSlice(b" "))
);

named!(ctext<CompleteByteSlice, CompleteByteSlice>,
    is_not!("()\\ \t\r\n")
);

// Comment content; comments are recursive.
named!(ccontent<CompleteByteSlice, ()>,
    alt!(
        map!(ctext, |_| ())
            | map!(quoted_pair, |_| ())
            | map!(fws, |_| ())
            | comment
    )
);

named!(comment<CompleteByteSlice, ()>,
    delimited!(char!('('), map!(many0_count!(ccontent), |_| ()), char!(')'))
);

named!(cfws<CompleteByteSlice, ()>,
    map!(many0_count!(alt!(map!(fws, |_| ()) | comment)), |_| ())
);

named!(atext<CompleteByteSlice, CompleteByteSlice>,
    take_while1!(is_atext_byte)
);

named!(atom<CompleteByteSlice, CompleteByteSlice>,
    delimited!(opt!(cfws), atext, opt!(cfws))
);

named!(qtext<CompleteByteSlice, CompleteByteSlice>,
    is_not!(" \t\r\n\\\"")
);

named!(qcontent<CompleteByteSlice, CompleteByteSlice>,
    alt!(qtext | quoted_pair | fws)
);

named!(quoted_string<CompleteByteSlice, String>,
    delimited!(
        pair!(opt!(cfws), char!('"')),
        fold_many0!(qcontent, String::new(), |mut acc: String, item: CompleteByteSlice| {
            acc.push_str(&String::from_utf8_lossy(item.0));
            acc
        }),
        pair!(char!('"'), opt!(cfws))
    )
);

named!(word<CompleteByteSlice, String>,
    alt!(map!(atom, lossy) | quoted_string)
);

// The unquoted '.' many agents put into display names (obs-phrase).
named!(obs_dot<CompleteByteSlice, String>,
    terminated!(map!(char!('.'), |_| ".".to_owned()), opt!(cfws))
);

named!(phrase<CompleteByteSlice, Vec<String>>,
    map!(pair!(word, many0!(alt!(word | obs_dot))), |(head, mut tail)| {
        tail.insert(0, head);
        tail
    })
);

named!(local_part<CompleteByteSlice, String>,
    map!(separated_nonempty_list!(char!('.'), word), |parts| {
        parts.join(".")
    })
);

named!(obs_domain<CompleteByteSlice, String>,
    map!(
        separated_nonempty_list!(char!('.'), map!(atom, lossy)),
        |parts| parts.join(".")
    )
);

named!(dtext<CompleteByteSlice, CompleteByteSlice>,
    is_not!("[]\\ \t\r\n")
);

named!(dcontent<CompleteByteSlice, CompleteByteSlice>,
    alt!(dtext | quoted_pair | fws)
);

named!(domain_literal<CompleteByteSlice, String>,
    map!(
        delimited!(
            pair!(opt!(cfws), char!('[')),
            fold_many0!(dcontent, "[".to_owned(), |mut acc: String, item: CompleteByteSlice| {
                acc.push_str(&String::from_utf8_lossy(item.0));
                acc
            }),
            pair!(char!(']'), opt!(cfws))
        ),
        |mut s| {
            s.push(']');
            s
        }
    )
);

named!(domain<CompleteByteSlice, String>,
    alt!(obs_domain | domain_literal)
);

named!(addr_spec<CompleteByteSlice, (String, String)>,
    pair!(local_part, preceded!(char!('@'), domain))
);

// Obsolete routing information; parsed and discarded. The separator must
// consume at least one byte or the repetition would stall.
named!(obs_route_sep<CompleteByteSlice, ()>,
    map!(is_a!(", \t\r\n"), |_| ())
);

named!(obs_domain_list<CompleteByteSlice, ()>,
    map!(
        tuple!(
            char!('@'),
            domain,
            many0_count!(tuple!(
                opt!(obs_route_sep),
                char!('@'),
                domain
            )),
            char!(':')
        ),
        |_| ()
    )
);

named!(angle_addr<CompleteByteSlice, (String, String)>,
    delimited!(
        tuple!(opt!(cfws), char!('<'), opt!(obs_domain_list)),
        addr_spec,
        pair!(char!('>'), opt!(cfws))
    )
);

named!(mailbox<CompleteByteSlice, Address>,
    map!(
        alt!(
            pair!(opt!(phrase), angle_addr)
                | map!(addr_spec, |a| (None, a))
        ),
        |(name, (localpart, domain))| Address {
            name: name.map(|w| w.join(" ")).unwrap_or_default(),
            localpart,
            domain,
        }
    )
);

// Obsolete list syntax allows runs of commas.
named!(list_delim<CompleteByteSlice, ()>,
    map!(
        many1_count!(tuple!(opt!(cfws), char!(','), opt!(cfws))),
        |_| ()
    )
);

named!(mailbox_list<CompleteByteSlice, Vec<Address>>,
    delimited!(
        opt!(list_delim),
        separated_nonempty_list!(list_delim, mailbox),
        opt!(list_delim)
    )
);

named!(group<CompleteByteSlice, Vec<Address>>,
    map!(
        pair!(
            terminated!(phrase, char!(':')),
            terminated!(
                opt!(mailbox_list),
                tuple!(opt!(cfws), char!(';'), opt!(cfws))
            )
        ),
        |(_, boxes)| boxes.unwrap_or_default()
    )
);

named!(address<CompleteByteSlice, Vec<Address>>,
    alt!(map!(mailbox, |m| vec![m]) | group)
);

named!(address_list<CompleteByteSlice, Vec<Address>>,
    map!(
        delimited!(
            opt!(list_delim),
            separated_nonempty_list!(list_delim, address),
            opt!(list_delim)
        ),
        |groups| groups.into_iter().flatten().collect()
    )
);

// RFC 5322 3.3 date/time, obsolete forms included. The obsolete forms
// allow CFWS between every term, so it is written in throughout.

named!(year<CompleteByteSlice, i32>,
    map!(take_while_m_n!(2, 4, is_ascii_digit_byte), |s: CompleteByteSlice| {
        let mut y: i32 = str::from_utf8(s.0).unwrap().parse().unwrap();
        // Y2K workarounds per RFC 5322 4.3.
        if s.0.len() == 2 && y < 50 {
            y += 2000;
        } else if s.0.len() < 4 {
            y += 1900;
        }
        y
    })
);

named!(month<CompleteByteSlice, u32>,
    alt!(
        map!(tag_no_case!("jan"), |_| 1)
            | map!(tag_no_case!("feb"), |_| 2)
            | map!(tag_no_case!("mar"), |_| 3)
            | map!(tag_no_case!("apr"), |_| 4)
            | map!(tag_no_case!("may"), |_| 5)
            | map!(tag_no_case!("jun"), |_| 6)
            | map!(tag_no_case!("jul"), |_| 7)
            | map!(tag_no_case!("aug"), |_| 8)
            | map!(tag_no_case!("sep"), |_| 9)
            | map!(tag_no_case!("oct"), |_| 10)
            | map!(tag_no_case!("nov"), |_| 11)
            | map!(tag_no_case!("dec"), |_| 12)
    )
);

named!(day<CompleteByteSlice, u32>,
    map!(take_while_m_n!(1, 2, is_ascii_digit_byte), |s: CompleteByteSlice| {
        str::from_utf8(s.0).unwrap().parse().unwrap()
    })
);

named!(date<CompleteByteSlice, (i32, u32, u32)>,
    map!(
        tuple!(
            terminated!(day, opt!(cfws)),
            terminated!(month, opt!(cfws)),
            terminated!(year, opt!(cfws))
        ),
        |(d, m, y)| (y, m, d)
    )
);

named!(two_digit<CompleteByteSlice, u32>,
    map!(take_while_m_n!(2, 2, is_ascii_digit_byte), |s: CompleteByteSlice| {
        str::from_utf8(s.0).unwrap().parse().unwrap()
    })
);

named!(time_of_day<CompleteByteSlice, (u32, u32, u32)>,
    map!(
        tuple!(
            terminated!(two_digit, tuple!(opt!(cfws), char!(':'), opt!(cfws))),
            two_digit,
            map!(
                opt!(preceded!(
                    tuple!(opt!(cfws), char!(':'), opt!(cfws)),
                    two_digit
                )),
                |s| s.unwrap_or(0)
            )
        ),
        |(h, m, s)| (h, m, s)
    )
);

named!(numeric_zone<CompleteByteSlice, i32>,
    map!(
        pair!(
            alt!(char!('+') | char!('-')),
            take_while_m_n!(4, 4, is_ascii_digit_byte)
        ),
        |(sign, s): (char, CompleteByteSlice)| {
            let n: i32 = str::from_utf8(s.0).unwrap().parse().unwrap();
            let secs = (n / 100 * 60 + n % 100) * 60;
            if '-' == sign {
                -secs
            } else {
                secs
            }
        }
    )
);

named!(zone<CompleteByteSlice, i32>,
    alt!(
        numeric_zone
            | map!(alt!(tag_no_case!("ut") | tag_no_case!("gmt")), |_| 0)
            | map!(tag_no_case!("edt"), |_| -4 * 3600)
            | map!(
                alt!(tag_no_case!("est") | tag_no_case!("cdt")),
                |_| -5 * 3600
            )
            | map!(
                alt!(tag_no_case!("cst") | tag_no_case!("mdt")),
                |_| -6 * 3600
            )
            | map!(
                alt!(tag_no_case!("mst") | tag_no_case!("pdt")),
                |_| -7 * 3600
            )
            | map!(tag_no_case!("pst"), |_| -8 * 3600)
            // Military and unknown zones must be treated as +0000.
            | map!(atext, |_| 0)
    )
);

named!(date_time<CompleteByteSlice, Option<DateTime<FixedOffset>>>,
    map!(
        tuple!(
            // Day of week is optional and unchecked.
            opt!(tuple!(opt!(cfws), atext, opt!(cfws), char!(','))),
            opt!(cfws),
            date,
            time_of_day,
            map!(opt!(preceded!(opt!(cfws), zone)), |z| z.unwrap_or(0)),
            opt!(cfws)
        ),
        |(_, _, (y, mo, d), (h, mi, s), zone, _)| -> Option<DateTime<FixedOffset>> {
            let offset = FixedOffset::east_opt(zone)?;
            let naive = NaiveDate::from_ymd_opt(y, mo, d)?
                .and_hms_opt(h, mi, s.min(59))?;
            offset.from_local_datetime(&naive).single()
        }
    )
);

named!(msg_id<CompleteByteSlice, String>,
    map!(
        delimited!(
            tuple!(opt!(cfws), char!('<')),
            is_not!("<> \t\r\n"),
            pair!(char!('>'), opt!(cfws))
        ),
        lossy
    )
);

fn only_blank(rest: &[u8]) -> bool {
    rest.iter().all(|&b| b" \t\r\n".contains(&b))
}

/// Parses a complete address list (To, Cc, From, ...); `None` if the field
/// does not parse in its entirety.
pub fn parse_address_list(raw: &[u8]) -> Option<Vec<Address>> {
    match address_list(CompleteByteSlice(raw)) {
        Ok((rest, addrs)) if only_blank(rest.0) => Some(addrs),
        _ => None,
    }
}

/// Parses a single mailbox (Sender, Return-Path).
pub fn parse_mailbox(raw: &[u8]) -> Option<Address> {
    match mailbox(CompleteByteSlice(raw)) {
        Ok((rest, m)) if only_blank(rest.0) => Some(m),
        _ => None,
    }
}

/// Parses an RFC 5322 date-time.
pub fn parse_date_time(raw: &[u8]) -> Option<DateTime<FixedOffset>> {
    match date_time(CompleteByteSlice(raw)) {
        Ok((rest, dt)) if only_blank(rest.0) => dt,
        _ => None,
    }
}

/// Parses one `<id-left@id-right>` message id, returning its inner text.
pub fn parse_msg_id(raw: &[u8]) -> Option<String> {
    match msg_id(CompleteByteSlice(raw)) {
        Ok((rest, id)) if only_blank(rest.0) => Some(id),
        _ => None,
    }
}

/// Parses a References-style run of message ids.
pub fn parse_msg_id_list(raw: &[u8]) -> Option<Vec<String>> {
    match many1!(CompleteByteSlice(raw), msg_id) {
        Ok((rest, ids)) if only_blank(rest.0) => Some(ids),
        _ => None,
    }
}
