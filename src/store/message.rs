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

//! The message object.
//!
//! A message is owned by a mailbox (keyed by UID) and/or known by its
//! database id. It is filled in piecemeal by fetchers; the per-class
//! fetched-state flags are monotonic, so a consumer that once observed
//! `has_headers` can rely on the headers staying put for the lifetime of
//! the object.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use chrono::prelude::*;

use crate::mime::bodypart::{
    append_multipart, parse_bodypart, parse_header_block, Bodypart,
};
use crate::mime::header::{Enclosing, Header, Mode};

use super::model::{MessageId, Modseq, Uid, UserId};

/// Shared handle to a message being filled in.
///
/// The fetch pipeline and the owning mailbox both hold handles; everything
/// runs on the loop thread.
pub type MessageRef = Rc<RefCell<Message>>;

#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub name_id: u32,
    pub entry_name: String,
    pub owner: Option<UserId>,
    pub value: String,
}

#[derive(Clone, Debug)]
pub struct Message {
    uid: Option<Uid>,
    database_id: Option<MessageId>,
    header: Header,
    parts: Vec<Bodypart>,
    flags: BTreeSet<u32>,
    annotations: Vec<Annotation>,
    rfc822_size: u32,
    internal_date: i64,
    modseq: Modseq,
    error: Option<String>,

    has_headers: bool,
    has_addresses: bool,
    has_flags: bool,
    has_bodies: bool,
    has_bytes_and_lines: bool,
    has_annotations: bool,
}

impl Default for Message {
    fn default() -> Self {
        Message::new()
    }
}

impl Message {
    pub fn new() -> Self {
        Message {
            uid: None,
            database_id: None,
            header: Header::new(Mode::Rfc2822),
            parts: Vec::new(),
            flags: BTreeSet::new(),
            annotations: Vec::new(),
            rfc822_size: 0,
            internal_date: 0,
            modseq: Modseq::MIN,
            error: None,

            has_headers: false,
            has_addresses: false,
            has_flags: false,
            has_bodies: false,
            has_bytes_and_lines: false,
            has_annotations: false,
        }
    }

    pub fn shared(self) -> MessageRef {
        Rc::new(RefCell::new(self))
    }

    /// Parses a complete RFC 5322 message.
    pub fn parse(raw: &[u8]) -> Message {
        let mut error = None;
        let mut m = Message::parse_enclosed(raw, &[], &mut error);
        m.error = error;
        m
    }

    /// Parses a message nested inside the parts described by `enclosing`
    /// (nearest first), which supply fallback Date and From during header
    /// repair.
    pub fn parse_enclosed(
        raw: &[u8],
        enclosing: &[Enclosing],
        error: &mut Option<String>,
    ) -> Message {
        let (mut header, body_start) =
            parse_header_block(raw, Mode::Rfc2822);

        let now = Utc::now()
            .with_timezone(&FixedOffset::east_opt(0).expect("UTC offset"));
        header.repair(enclosing, now);

        let bp = parse_bodypart(&raw[body_start..], header, enclosing, error);

        let mut m = Message::new();
        m.rfc822_size = raw.len() as u32;

        let is_multipart = bp
            .header()
            .content_type()
            .map_or(false, |ct| ct.is_type("multipart"));

        if is_multipart {
            let mut bp = bp;
            m.parts = std::mem::take(bp.children_mut());
            m.header = std::mem::take(bp.header_mut());
        } else {
            let mut bp = bp;
            m.header = std::mem::replace(
                bp.header_mut(),
                Header::new(Mode::Mime),
            );
            bp.set_number(1);
            m.parts = vec![bp];
        }

        m.has_headers = true;
        m.has_addresses = true;
        m.has_bodies = true;
        m.has_bytes_and_lines = true;
        m
    }

    /// The canonical wire representation.
    pub fn as_text(&self) -> String {
        let mut out = self.header.as_text();
        out.push_str("\r\n");

        let is_multipart = self
            .header
            .content_type()
            .map_or(false, |ct| ct.is_type("multipart"));

        if is_multipart {
            let boundary = self
                .header
                .content_type()
                .and_then(|ct| ct.parameter("boundary"))
                .unwrap_or("")
                .to_owned();
            out.push_str(&append_multipart(&boundary, &self.parts));
        } else if let Some(p0) = self.parts.first() {
            let mut root = p0.clone();
            root.set_header(self.header.clone());
            out.push_str(&root.body_text());
        }

        out
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn set_header(&mut self, header: Header) {
        self.header = header;
    }

    pub fn parts(&self) -> &[Bodypart] {
        &self.parts
    }

    pub fn parts_mut(&mut self) -> &mut Vec<Bodypart> {
        &mut self.parts
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn uid(&self) -> Option<Uid> {
        self.uid
    }

    pub fn set_uid(&mut self, uid: Uid) {
        self.uid = Some(uid);
    }

    pub fn database_id(&self) -> Option<MessageId> {
        self.database_id
    }

    pub fn set_database_id(&mut self, id: MessageId) {
        self.database_id = Some(id);
    }

    pub fn rfc822_size(&self) -> u32 {
        self.rfc822_size
    }

    pub fn set_rfc822_size(&mut self, size: u32) {
        self.rfc822_size = size;
    }

    pub fn internal_date(&self) -> i64 {
        self.internal_date
    }

    pub fn set_internal_date(&mut self, idate: i64) {
        self.internal_date = idate;
    }

    pub fn modseq(&self) -> Modseq {
        self.modseq
    }

    pub fn set_modseq(&mut self, modseq: Modseq) {
        self.modseq = modseq;
    }

    pub fn flags(&self) -> &BTreeSet<u32> {
        &self.flags
    }

    pub fn add_flag(&mut self, flag_id: u32) {
        self.flags.insert(flag_id);
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Adds `a`, replacing any previous annotation with the same entry
    /// name and owner.
    pub fn replace_annotation(&mut self, a: Annotation) {
        self.annotations
            .retain(|x| x.name_id != a.name_id || x.owner != a.owner);
        self.annotations.push(a);
    }

    /// Finds the bodypart at the dotted `part` number, materialising
    /// interior parts on demand when `create` is set.
    ///
    /// Part numbers are 1-based; `""` is not a part.
    pub fn bodypart_mut(
        &mut self,
        part: &str,
        create: bool,
    ) -> Option<&mut Bodypart> {
        let mut segments = Vec::new();
        for seg in part.split('.') {
            let n: usize = seg.parse().ok()?;
            if 0 == n {
                return None;
            }
            segments.push(n);
        }
        if segments.is_empty() {
            return None;
        }

        let first = segments.remove(0);
        if self.parts.len() < first {
            if !create {
                return None;
            }
            for n in self.parts.len()..first {
                self.parts.push(Bodypart::new(n as u32 + 1));
            }
        }
        let mut current = &mut self.parts[first - 1];

        for seg in segments {
            let children = current.children_mut();
            if children.len() < seg {
                if !create {
                    return None;
                }
                for n in children.len()..seg {
                    children.push(Bodypart::new(n as u32 + 1));
                }
            }
            current = &mut current.children_mut()[seg - 1];
        }

        Some(current)
    }

    /// Lazily allocates the embedded message of the part at `part`; used
    /// when decoding `x.y.z.rfc822` rows.
    pub fn embedded_message_mut(
        &mut self,
        part: &str,
    ) -> Option<&mut Message> {
        let bp = self.bodypart_mut(part, true)?;
        if bp.message().is_none() {
            bp.set_message(Message::new());
        }
        bp.message_mut()
    }

    pub fn has_headers(&self) -> bool {
        self.has_headers
    }

    pub fn set_headers_fetched(&mut self) {
        self.has_headers = true;
    }

    pub fn has_addresses(&self) -> bool {
        self.has_addresses
    }

    pub fn set_addresses_fetched(&mut self) {
        self.has_addresses = true;
    }

    pub fn has_flags(&self) -> bool {
        self.has_flags
    }

    pub fn set_flags_fetched(&mut self) {
        self.has_flags = true;
    }

    pub fn has_bodies(&self) -> bool {
        self.has_bodies
    }

    pub fn set_bodies_fetched(&mut self) {
        self.has_bodies = true;
    }

    pub fn has_bytes_and_lines(&self) -> bool {
        self.has_bytes_and_lines
    }

    pub fn set_bytes_and_lines_fetched(&mut self) {
        self.has_bytes_and_lines = true;
    }

    pub fn has_annotations(&self) -> bool {
        self.has_annotations
    }

    pub fn set_annotations_fetched(&mut self) {
        self.has_annotations = true;
    }
}

/// Shapes two part trees for comparison: content types and child counts,
/// recursively.
#[cfg(test)]
pub fn tree_shape(m: &Message) -> Vec<(String, usize)> {
    fn walk(out: &mut Vec<(String, usize)>, parts: &[Bodypart]) {
        for p in parts {
            let ct = p
                .content_type()
                .map(|ct| format!("{}/{}", ct.typ, ct.subtype))
                .unwrap_or_else(|| "text/plain".to_owned());
            out.push((ct, p.children().len()));
            walk(out, p.children());
        }
    }
    let mut out = Vec::new();
    walk(&mut out, m.parts());
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mime::content_encoding;

    const THREE_PART: &[u8] = b"From: sender@example.com\r\n\
Date: Mon, 01 Jun 2009 12:00:00 +0000\r\n\
Subject: three parts\r\n\
Mime-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=outer42\r\n\
\r\n\
--outer42\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
caf\xc3\xa9 body\r\n\
--outer42\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>h\xc3\xa9llo</p>\r\n\
--outer42\r\n\
Content-Type: application/octet-stream\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
AAECAwQF/v8=\r\n\
--outer42--\r\n";

    #[test]
    fn three_part_parse() {
        let m = Message::parse(THREE_PART);
        assert_eq!(3, m.parts().len());

        assert_eq!("café body", m.parts()[0].text().trim_end());
        assert_eq!("<p>héllo</p>", m.parts()[1].text().trim_end());
        assert_eq!(
            &[0u8, 1, 2, 3, 4, 5, 0xfe, 0xff][..],
            m.parts()[2].data()
        );

        // The HTML part had no charset; one is synthesised.
        assert_eq!(
            Some("utf-8"),
            m.parts()[1]
                .content_type()
                .unwrap()
                .parameter("charset")
        );
    }

    #[test]
    fn three_part_round_trip() {
        let m = Message::parse(THREE_PART);
        let text = m.as_text();
        let m2 = Message::parse(text.as_bytes());

        assert_eq!(tree_shape(&m), tree_shape(&m2));
        assert_eq!(
            m.parts()[0].text(),
            m2.parts()[0].text()
        );
        assert_eq!(m.parts()[1].text(), m2.parts()[1].text());
        assert_eq!(m.parts()[2].data(), m2.parts()[2].data());

        // Re-assembly reaches a fixed point.
        assert_eq!(text, m2.as_text());
    }

    #[test]
    fn empty_and_degenerate_messages() {
        let empty = Message::parse(b"");
        assert_eq!(1, empty.parts().len());
        assert_eq!("", empty.parts()[0].text());

        let crlf_only = Message::parse(b"\r\n");
        assert_eq!("", crlf_only.parts()[0].text());

        let headers_only =
            Message::parse(b"Subject: nothing else\r\n\r\n");
        assert_eq!(
            "nothing else",
            headers_only.header().subject().unwrap()
        );
        assert_eq!("", headers_only.parts()[0].text());
    }

    #[test]
    fn boundary_inside_nested_part_is_ignored() {
        // The inner part contains the outer boundary string, but never at
        // the start of a line, so it is body text.
        let raw = b"From: a@b.c\r\n\
Date: Mon, 01 Jun 2009 12:00:00 +0000\r\n\
Content-Type: multipart/mixed; boundary=xyz\r\n\
\r\n\
--xyz\r\n\
\r\n\
this line mentions --xyz without being a boundary\r\n\
--xyz--\r\n";
        let m = Message::parse(raw);
        assert_eq!(1, m.parts().len());
        assert!(m.parts()[0].text().contains("mentions --xyz"));
    }

    #[test]
    fn nested_rfc822_splices_children() {
        let raw = b"From: outer@x.org\r\n\
Date: Mon, 01 Jun 2009 12:00:00 +0000\r\n\
Content-Type: message/rfc822\r\n\
\r\n\
From: inner@y.org\r\n\
Date: Tue, 02 Jun 2009 12:00:00 +0000\r\n\
Subject: inner\r\n\
\r\n\
inner body\r\n";
        let m = Message::parse(raw);
        assert_eq!(1, m.parts().len());
        let sub = m.parts()[0].message().unwrap();
        assert_eq!("inner", sub.header().subject().unwrap());
        assert_eq!("inner body\r\n", sub.parts()[0].text());
        // The sub-message's children are spliced under the bodypart.
        assert_eq!(1, m.parts()[0].children().len());
    }

    #[test]
    fn bodypart_navigation() {
        let mut m = Message::parse(THREE_PART);
        assert!(m.bodypart_mut("1", false).is_some());
        assert!(m.bodypart_mut("3", false).is_some());
        assert!(m.bodypart_mut("4", false).is_none());
        assert!(m.bodypart_mut("2.1", false).is_none());
        assert!(m.bodypart_mut("0", true).is_none());
        assert!(m.bodypart_mut("x", true).is_none());

        // Creation materialises interior parts.
        assert!(m.bodypart_mut("2.1.3", true).is_some());
        assert_eq!(1, m.bodypart_mut("2", false).unwrap().children().len());
        assert_eq!(
            3,
            m.bodypart_mut("2.1", false).unwrap().children().len()
        );
    }

    #[test]
    fn fetched_state_is_monotonic() {
        let mut m = Message::new();
        assert!(!m.has_flags());
        m.set_flags_fetched();
        assert!(m.has_flags());
        // There is no way to clear it again; the setters are the whole
        // mutation surface.
        m.set_flags_fetched();
        assert!(m.has_flags());
    }

    #[test]
    fn annotations_replace_by_name_and_owner() {
        let mut m = Message::new();
        m.replace_annotation(Annotation {
            name_id: 1,
            entry_name: "/comment".to_owned(),
            owner: None,
            value: "one".to_owned(),
        });
        m.replace_annotation(Annotation {
            name_id: 1,
            entry_name: "/comment".to_owned(),
            owner: Some(UserId(9)),
            value: "mine".to_owned(),
        });
        m.replace_annotation(Annotation {
            name_id: 1,
            entry_name: "/comment".to_owned(),
            owner: None,
            value: "two".to_owned(),
        });

        assert_eq!(2, m.annotations().len());
        assert!(m
            .annotations()
            .iter()
            .any(|a| a.owner.is_none() && "two" == a.value));
    }

    #[test]
    fn base64_part_survives_reassembly() {
        let m = Message::parse(THREE_PART);
        let text = m.as_text();
        // The binary part is re-emitted in 72-column base64.
        let expected = String::from_utf8_lossy(
            &content_encoding::base64_encode_wrapped(
                &[0u8, 1, 2, 3, 4, 5, 0xfe, 0xff],
                72,
            ),
        )
        .into_owned();
        assert!(text.contains(expected.trim_end()));
    }
}
