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

//! An ordered collection of header fields.
//!
//! A header knows which mode it is in (RFC 5322 message header or MIME
//! part header), can check the cardinality rules for that mode, repair the
//! common damage seen in real mail, and drop fields that only restate
//! defaults.

use chrono::prelude::*;

use super::field::{FieldType, HeaderField};
use super::rfc5322::Address;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Rfc2822,
    Mime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultType {
    TextPlain,
    MessageRfc822,
}

struct Condition {
    t: FieldType,
    min: u32,
    max: u32,
    m: Mode,
}

static CONDITIONS: &[Condition] = &[
    Condition { t: FieldType::Sender, min: 0, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::ReplyTo, min: 0, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::To, min: 0, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::Cc, min: 0, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::Bcc, min: 0, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::MessageId, min: 0, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::References, min: 0, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::Subject, min: 0, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::From, min: 1, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::Date, min: 1, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::MimeVersion, min: 0, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::MimeVersion, min: 0, max: 0, m: Mode::Mime },
    Condition { t: FieldType::ContentType, min: 0, max: 1, m: Mode::Rfc2822 },
    Condition { t: FieldType::ContentType, min: 0, max: 1, m: Mode::Mime },
    Condition {
        t: FieldType::ContentTransferEncoding,
        min: 0,
        max: 1,
        m: Mode::Rfc2822,
    },
    Condition {
        t: FieldType::ContentTransferEncoding,
        min: 0,
        max: 1,
        m: Mode::Mime,
    },
    Condition { t: FieldType::ReturnPath, min: 0, max: 1, m: Mode::Rfc2822 },
];

/// What a header can see of the parts enclosing it, for repair.
#[derive(Clone, Debug, Default)]
pub struct Enclosing {
    pub date: Option<DateTime<FixedOffset>>,
    pub from: Vec<Address>,
}

#[derive(Clone, Debug)]
pub struct Header {
    mode: Mode,
    default_type: DefaultType,
    fields: Vec<HeaderField>,
}

impl Default for Header {
    fn default() -> Self {
        Header::new(Mode::Mime)
    }
}

impl Header {
    pub fn new(mode: Mode) -> Self {
        Header {
            mode,
            default_type: DefaultType::TextPlain,
            fields: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn default_type(&self) -> DefaultType {
        self.default_type
    }

    pub fn set_default_type(&mut self, t: DefaultType) {
        self.default_type = t;
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Appends `hf`.
    ///
    /// A To/Cc/Bcc/Reply-To/From field whose type is already present has
    /// its addresses merged into the existing field instead; a variety of
    /// buggy senders emit the field twice.
    pub fn add(&mut self, hf: HeaderField) {
        let t = hf.ftype();
        if matches!(
            t,
            FieldType::To
                | FieldType::Cc
                | FieldType::Bcc
                | FieldType::ReplyTo
                | FieldType::From
        ) {
            if let Some(new_addrs) =
                hf.addresses().map(<[Address]>::to_vec)
            {
                if let Some(first) = self
                    .fields
                    .iter_mut()
                    .find(|f| f.ftype() == t && f.addresses().is_some())
                {
                    let existing = first.addresses_mut().unwrap();
                    for a in new_addrs {
                        let dup = existing.iter().any(|e| {
                            e.localpart == a.localpart
                                && e.domain.eq_ignore_ascii_case(&a.domain)
                        });
                        if !dup {
                            existing.push(a);
                        }
                    }
                    return;
                }
            }
        }
        self.fields.push(hf);
    }

    /// Parses and appends a `name: value` pair.
    pub fn add_raw(&mut self, name: &str, value: &str) {
        self.add(HeaderField::create(name, value.as_bytes()));
    }

    /// Appends `hf` verbatim, without the address-merge applied by `add`.
    /// Reconstruction from storage uses this; the stored positions already
    /// encode the original field layout.
    pub fn push_field(&mut self, hf: HeaderField) {
        self.fields.push(hf);
    }

    /// The field of type `t` recorded at `position`, if any.
    pub fn field_at_position_mut(
        &mut self,
        t: FieldType,
        position: u32,
    ) -> Option<&mut HeaderField> {
        self.fields
            .iter_mut()
            .find(|f| f.ftype() == t && f.position() == position)
    }

    /// Restores storage order after piecemeal reconstruction.
    pub fn sort_fields_by_position(&mut self) {
        self.fields.sort_by_key(HeaderField::position);
    }

    pub fn remove_field(&mut self, t: FieldType) {
        self.fields.retain(|f| f.ftype() != t);
    }

    /// The `n`th field of type `t` (0-based).
    pub fn field(&self, t: FieldType, n: usize) -> Option<&HeaderField> {
        self.fields.iter().filter(|f| f.ftype() == t).nth(n)
    }

    pub fn field_mut(
        &mut self,
        t: FieldType,
        n: usize,
    ) -> Option<&mut HeaderField> {
        self.fields.iter_mut().filter(|f| f.ftype() == t).nth(n)
    }

    pub fn count(&self, t: FieldType) -> usize {
        self.fields.iter().filter(|f| f.ftype() == t).count()
    }

    pub fn date(&self) -> Option<DateTime<FixedOffset>> {
        self.field(FieldType::Date, 0).and_then(HeaderField::date)
    }

    pub fn subject(&self) -> Option<String> {
        self.field(FieldType::Subject, 0).map(|f| f.data())
    }

    pub fn message_id(&self) -> Option<String> {
        self.field(FieldType::MessageId, 0)
            .and_then(|f| f.message_ids())
            .and_then(|ids| ids.first().cloned())
    }

    pub fn addresses(&self, t: FieldType) -> Option<&[Address]> {
        let a = self.field(t, 0)?.addresses()?;
        if a.is_empty() {
            None
        } else {
            Some(a)
        }
    }

    pub fn content_type(&self) -> Option<&super::field::ContentType> {
        self.field(FieldType::ContentType, 0)
            .and_then(HeaderField::content_type)
    }

    pub fn content_transfer_encoding(
        &self,
    ) -> Option<super::content_encoding::TransferEncoding> {
        self.field(FieldType::ContentTransferEncoding, 0)
            .and_then(HeaderField::transfer_encoding)
    }

    /// The first error in this header, or `None` if it is valid: every
    /// field individually valid, and the cardinality rules for the mode
    /// satisfied.
    pub fn error(&self) -> Option<String> {
        for f in &self.fields {
            if let Some(e) = f.error() {
                return Some(format!("{}: {}", f.name(), e));
            }
        }

        for c in CONDITIONS {
            if c.m != self.mode {
                continue;
            }
            let n = self.count(c.t) as u32;
            let name = c.t.canonical_name().unwrap_or("?");
            if n > c.max {
                return Some(format!(
                    "{} {} fields seen, at most {} may be present",
                    n, name, c.max
                ));
            }
            if n < c.min {
                return Some(format!(
                    "{} {} fields seen, at least {} must be present",
                    n, name, c.min
                ));
            }
        }

        // If From contains more than one address, Sender should contain
        // one. Not enforced; it rejects more ham than spam.
        None
    }

    pub fn valid(&self) -> bool {
        self.error().is_none()
    }

    /// Repairs a few harmless and common problems. `enclosing` describes
    /// the parts this header is nested in, nearest first; `now` supplies
    /// the last-resort Date.
    pub fn repair(
        &mut self,
        enclosing: &[Enclosing],
        now: DateTime<FixedOffset>,
    ) {
        if self.valid() && self.fields.iter().all(HeaderField::parsed) {
            return;
        }

        // Remove exact duplicates of any field that may occur only once.
        // (Observed for Date, Subject, Mime-Version, C-T-E, C-T.)
        for c in CONDITIONS {
            if c.m != self.mode || self.count(c.t) as u32 <= c.max {
                continue;
            }
            let first_data =
                self.field(c.t, 0).map(|f| f.data()).unwrap_or_default();
            let mut seen = 0;
            let t = c.t;
            self.fields.retain(|f| {
                if f.ftype() != t {
                    return true;
                }
                seen += 1;
                1 == seen || f.data() != first_data
            });
        }

        // Retain only the first valid Date, Return-Path, Message-Id and
        // References; qmail and friends double them up.
        for &t in &[
            FieldType::Date,
            FieldType::ReturnPath,
            FieldType::MessageId,
            FieldType::References,
        ] {
            if self.count(t) <= 1 {
                continue;
            }
            if let Some(first_valid) = self
                .fields
                .iter()
                .position(|f| f.ftype() == t && f.valid())
            {
                let mut ix = 0;
                self.fields.retain(|f| {
                    let keep = f.ftype() != t || ix == first_valid;
                    ix += 1;
                    keep
                });
            }
        }

        // Missing Date: the oldest parsable Received, else the nearest
        // enclosing Date, else the wall clock.
        if 0 == self.count(FieldType::Date) && Mode::Rfc2822 == self.mode {
            let mut date = None;
            for f in &self.fields {
                if FieldType::Received == f.ftype() {
                    if let Some(d) = super::field::received_date(&f.data())
                    {
                        date = Some(d);
                    }
                }
            }
            if date.is_none() {
                date = enclosing.iter().find_map(|e| e.date);
            }
            let date = date.unwrap_or(now);
            self.add_raw(
                "Date",
                &date.format("%a, %d %b %Y %H:%M:%S %z").to_string(),
            );
        }

        // Missing From: Return-Path or Sender on this header, else the
        // enclosing parts' candidates.
        if 0 == self.count(FieldType::From) && Mode::Rfc2822 == self.mode {
            let own = self
                .addresses(FieldType::ReturnPath)
                .or_else(|| self.addresses(FieldType::Sender))
                .map(<[Address]>::to_vec);
            let from = own.or_else(|| {
                enclosing
                    .iter()
                    .find(|e| !e.from.is_empty())
                    .map(|e| e.from.clone())
            });
            if let Some(from) = from {
                self.add_raw("From", &from[0].to_wire());
            }
        }

        // Several Content-Types that agree except that exactly one carries
        // parameters: keep the one with parameters.
        if self.count(FieldType::ContentType) > 1 {
            for f in &mut self.fields {
                if let Some(ct) = f.content_type_mut() {
                    if ct
                        .parameter("charset")
                        .map_or(false, |c| c.eq_ignore_ascii_case("us-ascii"))
                    {
                        ct.remove_parameter("charset");
                    }
                }
            }

            let cts: Vec<(usize, bool)> = self
                .fields
                .iter()
                .enumerate()
                .filter_map(|(ix, f)| {
                    f.content_type().map(|ct| (ix, !ct.params.is_empty()))
                })
                .collect();
            let agree = self
                .fields
                .iter()
                .filter_map(HeaderField::content_type)
                .all(|ct| {
                    let first = self.content_type().unwrap();
                    ct.typ == first.typ && ct.subtype == first.subtype
                });
            let with_params: Vec<usize> = cts
                .iter()
                .filter(|&&(_, p)| p)
                .map(|&(ix, _)| ix)
                .collect();
            if agree && 1 == with_params.len() {
                let keep = with_params[0];
                let mut ix = 0;
                self.fields.retain(|f| {
                    let is_ct = FieldType::ContentType == f.ftype();
                    let keep_this = !is_ct || ix == keep;
                    ix += 1;
                    keep_this
                });
            }
        }

        // Drop Received fields at and after the first unparsable one.
        let mut bad_received = false;
        self.fields.retain(|f| {
            if FieldType::Received == f.ftype() {
                if !f.parsed() {
                    bad_received = true;
                }
                !bad_received
            } else {
                true
            }
        });

        // Fields that can be dropped without changing the meaning of the
        // rest of the message: drop them when invalid.
        self.fields.retain(|f| {
            !matches!(
                f.ftype(),
                FieldType::ContentLocation
                    | FieldType::ContentId
                    | FieldType::MessageId
            ) || f.valid()
        });
    }

    /// Removes fields that only restate defaults.
    pub fn simplify(&mut self) {
        if self
            .field(FieldType::ContentDescription, 0)
            .map_or(false, |f| f.data().is_empty())
        {
            self.remove_field(FieldType::ContentDescription);
        }

        if let Some(super::content_encoding::TransferEncoding::Binary) =
            self.content_transfer_encoding()
        {
            self.remove_field(FieldType::ContentTransferEncoding);
        }

        let drop_disposition = {
            let text_part = self
                .content_type()
                .map_or(true, |ct| ct.is_type("text"));
            self.field(FieldType::ContentDisposition, 0)
                .and_then(HeaderField::disposition)
                .map_or(false, |cd| {
                    Mode::Rfc2822 == self.mode
                        && text_part
                        && "inline" == cd.disposition
                        && cd.params.is_empty()
                })
        };
        if drop_disposition {
            self.remove_field(FieldType::ContentDisposition);
        }

        let have_other_mime = self
            .field(FieldType::ContentTransferEncoding, 0)
            .is_some()
            || self.field(FieldType::ContentDisposition, 0).is_some()
            || self.field(FieldType::ContentDescription, 0).is_some();
        let drop_ct = self.content_type().map_or(false, |ct| {
            ct.params.is_empty()
                && !have_other_mime
                && DefaultType::TextPlain == self.default_type
                && ct.is_type("text")
                && ct.is_subtype("plain")
        });
        if drop_ct {
            self.remove_field(FieldType::ContentType);
        } else if self.content_type().is_none()
            && DefaultType::MessageRfc822 == self.default_type
        {
            self.add_raw("Content-Type", "message/rfc822");
        }

        if Mode::Mime == self.mode {
            self.remove_field(FieldType::MimeVersion);
        } else {
            let any_mime = self.fields.iter().any(|f| {
                f.ftype().is_mime_field()
            });
            if any_mime {
                if self.field(FieldType::MimeVersion, 0).is_none() {
                    self.add_raw("Mime-Version", "1.0");
                }
            } else {
                self.remove_field(FieldType::MimeVersion);
            }
        }

        if self
            .field(FieldType::MessageId, 0)
            .map_or(false, |f| f.data().is_empty())
        {
            self.remove_field(FieldType::MessageId);
        }

        if same_addresses(
            self.addresses(FieldType::From),
            self.addresses(FieldType::ReplyTo),
        ) {
            self.remove_field(FieldType::ReplyTo);
        }
        if same_addresses(
            self.addresses(FieldType::From),
            self.addresses(FieldType::Sender),
        ) {
            self.remove_field(FieldType::Sender);
        }

        for &t in &[
            FieldType::Sender,
            FieldType::ReturnPath,
            FieldType::To,
            FieldType::Cc,
            FieldType::Bcc,
            FieldType::ReplyTo,
        ] {
            let empty = self
                .field(t, 0)
                .map_or(false, |f| {
                    f.addresses().map_or(false, <[Address]>::is_empty)
                });
            if empty {
                self.remove_field(t);
            }
        }
    }

    /// The canonical wire representation, fields in order.
    pub fn as_text(&self) -> String {
        let mut out = String::new();
        for f in &self.fields {
            out.push_str(f.name());
            out.push_str(": ");
            out.push_str(&f.value());
            out.push_str("\r\n");
        }
        out
    }
}

fn same_addresses(a: Option<&[Address]>, b: Option<&[Address]>) -> bool {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    if a.len() != b.len() {
        return false;
    }
    b.iter().all(|x| {
        a.iter().any(|y| {
            x.localpart == y.localpart
                && x.domain.eq_ignore_ascii_case(&y.domain)
        })
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn rfc2822() -> Header {
        Header::new(Mode::Rfc2822)
    }

    fn now() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2009, 6, 1, 12, 0, 0)
            .unwrap()
    }

    #[test]
    fn cardinality_rules() {
        let mut h = rfc2822();
        assert!(!h.valid()); // no From, no Date

        h.add_raw("From", "a@b.c");
        h.add_raw("Date", "Mon, 1 Jun 2009 12:00:00 +0000");
        assert!(h.valid(), "{:?}", h.error());

        h.add_raw("Subject", "one");
        h.add_raw("Subject", "two");
        assert!(!h.valid());
        assert!(h.error().unwrap().contains("Subject"));
    }

    #[test]
    fn mime_mode_rules() {
        let mut h = Header::new(Mode::Mime);
        assert!(h.valid()); // no From/Date required

        h.add_raw("Mime-Version", "1.0");
        assert!(!h.valid()); // not allowed in part headers
    }

    #[test]
    fn address_merge_on_duplicate_to() {
        let mut h = rfc2822();
        h.add_raw("To", "a@x.org");
        h.add_raw("To", "b@y.org, a@x.org");

        assert_eq!(1, h.count(FieldType::To));
        let addrs = h.addresses(FieldType::To).unwrap();
        assert_eq!(2, addrs.len());
    }

    #[test]
    fn repair_duplicate_date_and_missing_from() {
        // Scenario: two Date headers with the same value, no From, but a
        // Sender. One Date is kept and From is synthesised from Sender.
        let mut h = rfc2822();
        h.add_raw("Date", "Mon, 1 Jun 2009 10:00:00 +0000");
        h.add_raw("Date", "Mon, 1 Jun 2009 10:00:00 +0000");
        h.add_raw("Sender", "sender@x");
        assert!(!h.valid());

        h.repair(&[], now());

        assert_eq!(1, h.count(FieldType::Date));
        assert_eq!(1, h.count(FieldType::From));
        assert_eq!(
            "sender",
            h.addresses(FieldType::From).unwrap()[0].localpart
        );
        assert!(h.valid(), "{:?}", h.error());
    }

    #[test]
    fn repair_date_from_received() {
        let mut h = rfc2822();
        h.add_raw("From", "a@b.c");
        h.add_raw(
            "Received",
            "from new.example by mx.example; \
             Tue, 2 Jun 2009 08:00:00 +0000",
        );
        h.add_raw(
            "Received",
            "from old.example by relay.example; \
             Mon, 1 Jun 2009 08:00:00 +0000",
        );

        h.repair(&[], now());

        // The oldest Received supplies the date.
        assert_eq!(
            "Mon, 01 Jun 2009 08:00:00 +0000",
            h.field(FieldType::Date, 0).unwrap().data()
        );
    }

    #[test]
    fn repair_date_from_enclosing_part() {
        let mut h = rfc2822();
        h.add_raw("From", "a@b.c");

        let parent = Enclosing {
            date: Some(
                FixedOffset::east_opt(0)
                    .unwrap()
                    .with_ymd_and_hms(2001, 2, 3, 4, 5, 6)
                    .unwrap(),
            ),
            from: Vec::new(),
        };
        h.repair(&[parent], now());

        assert!(h
            .field(FieldType::Date, 0)
            .unwrap()
            .data()
            .contains("2001"));
    }

    #[test]
    fn repair_drops_bad_received_tail() {
        let mut h = rfc2822();
        h.add_raw("From", "a@b.c");
        h.add_raw("Date", "Mon, 1 Jun 2009 12:00:00 +0000");
        h.add_raw(
            "Received",
            "from ok.example by mx; Mon, 1 Jun 2009 11:00:00 +0000",
        );
        h.add_raw("Received", "from broken.example by mx; garbage");
        h.add_raw(
            "Received",
            "from older.example by mx; Mon, 1 Jun 2009 09:00:00 +0000",
        );
        h.add_raw("Subject", "x");
        h.add_raw("Subject", "y"); // force repair to actually run

        h.repair(&[], now());

        assert_eq!(1, h.count(FieldType::Received));
    }

    #[test]
    fn simplify_drops_redundancies() {
        let mut h = rfc2822();
        h.add_raw("From", "a@b.c");
        h.add_raw("Date", "Mon, 1 Jun 2009 12:00:00 +0000");
        h.add_raw("Reply-To", "a@b.c");
        h.add_raw("Sender", "a@b.c");
        h.add_raw("Content-Type", "text/plain");
        h.add_raw("Mime-Version", "1.0");
        h.add_raw("Content-Description", "");

        h.simplify();

        assert_eq!(0, h.count(FieldType::ReplyTo));
        assert_eq!(0, h.count(FieldType::Sender));
        assert_eq!(0, h.count(FieldType::ContentType));
        assert_eq!(0, h.count(FieldType::MimeVersion));
        assert_eq!(0, h.count(FieldType::ContentDescription));
        assert_eq!(1, h.count(FieldType::From));
    }

    #[test]
    fn simplify_synthesises_rfc822_default(){
        let mut h = Header::new(Mode::Mime);
        h.set_default_type(DefaultType::MessageRfc822);
        h.simplify();
        assert_eq!(
            "message/rfc822",
            h.content_type().unwrap().render()
        );
    }

    #[test]
    fn as_text_round_trip() {
        let mut h = rfc2822();
        h.add_raw("From", "Alice <alice@example.com>");
        h.add_raw("Date", "Mon, 1 Jun 2009 12:00:00 +0000");
        h.add_raw("Subject", "hello");

        let text = h.as_text();
        assert!(text.starts_with("From: Alice <alice@example.com>\r\n"));
        assert!(text.ends_with("Subject: hello\r\n"));
    }
}
