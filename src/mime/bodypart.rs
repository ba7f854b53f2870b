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

//! MIME body parts: the recursive decomposition of a message body and its
//! reassembly.
//!
//! Parsing is robust rather than strict: it accepts wildly malformed input
//! and carries on, recording only the first conversion error. The
//! representation is bit-stable in the sense that parse, assemble and
//! parse again reach a fixed point.

use crate::store::message::Message;

use super::codec::Codec;
use super::content_encoding::{
    self, encoded_line_count, needs_qp, TransferEncoding,
};
use super::field::{FieldType, HeaderField};
use super::header::{DefaultType, Enclosing, Header, Mode};

/// One node in the MIME tree.
#[derive(Clone, Debug, Default)]
pub struct Bodypart {
    /// Position under the parent, 1-based.
    number: u32,
    header: Header,
    /// The octet-exact payload after content-transfer-decoding. For text
    /// parts this is the canonical text under the part's charset.
    data: Vec<u8>,
    /// The canonical Unicode form, for parts that have one.
    text: Option<String>,
    children: Vec<Bodypart>,
    /// The embedded message, for message/rfc822 parts.
    message: Option<Box<Message>>,
    num_bytes: u32,
    num_encoded_bytes: u32,
    num_encoded_lines: u32,
}

impl Bodypart {
    pub fn new(number: u32) -> Self {
        Bodypart {
            number,
            ..Bodypart::default()
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn set_number(&mut self, number: u32) {
        self.number = number;
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

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn has_text(&self) -> bool {
        self.text.is_some()
    }

    /// The canonical Unicode text. For parts loaded from storage the text
    /// may live in `data` only.
    pub fn text(&self) -> String {
        match self.text {
            Some(ref t) => t.clone(),
            None => String::from_utf8_lossy(&self.data).into_owned(),
        }
    }

    pub fn set_text(&mut self, text: String) {
        self.text = Some(text);
    }

    pub fn children(&self) -> &[Bodypart] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<Bodypart> {
        &mut self.children
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_deref()
    }

    pub fn message_mut(&mut self) -> Option<&mut Message> {
        self.message.as_deref_mut()
    }

    pub fn set_message(&mut self, m: Message) {
        self.message = Some(Box::new(m));
    }

    pub fn num_bytes(&self) -> u32 {
        self.num_bytes
    }

    pub fn set_num_bytes(&mut self, n: u32) {
        self.num_bytes = n;
    }

    pub fn num_encoded_bytes(&self) -> u32 {
        self.num_encoded_bytes
    }

    pub fn set_num_encoded_bytes(&mut self, n: u32) {
        self.num_encoded_bytes = n;
    }

    pub fn num_encoded_lines(&self) -> u32 {
        self.num_encoded_lines
    }

    pub fn set_num_encoded_lines(&mut self, n: u32) {
        self.num_encoded_lines = n;
    }

    pub fn content_type(&self) -> Option<&super::field::ContentType> {
        self.header.content_type()
    }

    /// The body of this part in wire form, excluding its header.
    pub fn body_text(&self) -> String {
        let ct = self.header.content_type();

        if let Some(ref m) = self.message {
            return m.as_text();
        }

        if !self.children.is_empty() {
            let boundary = ct
                .and_then(|ct| ct.parameter("boundary"))
                .unwrap_or("")
                .to_owned();
            return append_multipart(&boundary, &self.children);
        }

        if ct.map_or(true, |ct| ct.is_type("text")) {
            let mut codec = ct
                .and_then(|ct| ct.parameter("charset"))
                .and_then(Codec::by_name)
                .unwrap_or_else(Codec::ascii);
            let raw = codec.from_unicode(&self.text());
            let cte = self
                .header
                .content_transfer_encoding()
                .unwrap_or_default();
            String::from_utf8_lossy(&content_encoding::encode(&raw, cte))
                .into_owned()
        } else {
            String::from_utf8_lossy(&content_encoding::base64_encode_wrapped(
                &self.data, 72,
            ))
            .into_owned()
        }
    }

    /// The part in wire form: header, blank line, body.
    pub fn as_text(&self) -> String {
        let mut out = self.header.as_text();
        out.push_str("\r\n");
        out.push_str(&self.body_text());
        out
    }
}

pub fn append_multipart(boundary: &str, children: &[Bodypart]) -> String {
    let mut out = String::new();
    for child in children {
        out.push_str("--");
        out.push_str(boundary);
        out.push_str("\r\n");
        out.push_str(&child.as_text());
        if !out.ends_with('\n') {
            out.push_str("\r\n");
        }
    }
    out.push_str("--");
    out.push_str(boundary);
    out.push_str("--\r\n");
    out
}

/// Parses a header block at the top of `raw`, in the given mode.
///
/// Returns the header and the offset of the first body byte (past the
/// blank line). Unparsable lines end the header.
pub fn parse_header_block(raw: &[u8], mode: Mode) -> (Header, usize) {
    let mut header = Header::new(mode);
    let mut pos = 0;
    let mut field_start: Option<usize> = None;
    let mut field_end = 0;

    let mut flush =
        |header: &mut Header, start: Option<usize>, end: usize| {
            let start = match start {
                Some(s) => s,
                None => return,
            };
            let logical = &raw[start..end];
            if let Some(colon) =
                memchr::memchr(b':', logical)
            {
                let name = String::from_utf8_lossy(&logical[..colon]);
                let name = name.trim();
                if !name.is_empty()
                    && name.bytes().all(|b| (33..=126).contains(&b))
                {
                    header.add(HeaderField::create(
                        name,
                        &logical[colon + 1..],
                    ));
                }
            }
        };

    while pos < raw.len() {
        let line_end = memchr::memchr(b'\n', &raw[pos..])
            .map(|ix| pos + ix + 1)
            .unwrap_or(raw.len());
        let line = &raw[pos..line_end];
        let stripped = strip_crlf(line);

        if stripped.is_empty() {
            // Blank line: end of header.
            flush(&mut header, field_start.take(), field_end);
            return (header, line_end);
        }

        if line.starts_with(b" ") || line.starts_with(b"\t") {
            // Continuation of the current field.
            if field_start.is_some() {
                field_end = line_end;
            }
        } else {
            flush(&mut header, field_start.take(), field_end);
            field_start = Some(pos);
            field_end = line_end;
        }

        pos = line_end;
    }

    flush(&mut header, field_start.take(), field_end);
    (header, raw.len())
}

fn strip_crlf(line: &[u8]) -> &[u8] {
    let mut line = line;
    while let Some((&last, rest)) = line.split_last() {
        if b'\r' == last || b'\n' == last {
            line = rest;
        } else {
            break;
        }
    }
    line
}

fn is_line_start(raw: &[u8], i: usize) -> bool {
    0 == i || b'\r' == raw[i - 1] || b'\n' == raw[i - 1]
}

/// Splits `raw` into bodyparts wherever the boundary `divider` occurs,
/// parsing each region recursively. `divider` carries no hyphens;
/// `digest` selects the message/rfc822 default for the children.
pub fn parse_multipart(
    raw: &[u8],
    divider: &str,
    digest: bool,
    enclosing: &[Enclosing],
    error: &mut Option<String>,
) -> Vec<Bodypart> {
    let divider = divider.as_bytes();
    let mut children = Vec::new();
    let mut i = 0;
    let mut start: Option<usize> = None;
    let mut last = false;
    let mut pn = 1;

    while !last && i < raw.len() {
        if raw[i] == b'-'
            && raw.len() > i + 1
            && raw[i + 1] == b'-'
            && is_line_start(raw, i)
            && raw[i + 2..].starts_with(divider)
        {
            let mut j = i + 2 + divider.len();
            let mut l = false;
            if raw[j..].starts_with(b"--") {
                j += 2;
                l = true;
            }
            while j < raw.len() && (b' ' == raw[j] || b'\t' == raw[j]) {
                j += 1;
            }
            // The line must end here (EOF counts as a line ending) for
            // this to be a boundary.
            let at_eol =
                j >= raw.len() || b'\r' == raw[j] || b'\n' == raw[j];
            if at_eol {
                if j < raw.len() && b'\r' == raw[j] {
                    j += 1;
                }
                if j < raw.len() && b'\n' == raw[j] {
                    j += 1;
                }

                if let Some(s) = start {
                    // Strip the [CR]LF that belongs to the boundary.
                    let mut region_end = i;
                    if region_end > s && b'\n' == raw[region_end - 1] {
                        region_end -= 1;
                        if region_end > s && b'\r' == raw[region_end - 1] {
                            region_end -= 1;
                        }
                    }

                    let region = &raw[s..region_end];
                    let (mut h, body_start) =
                        parse_header_block(region, Mode::Mime);
                    if h.content_type().is_none() {
                        if digest {
                            h.set_default_type(DefaultType::MessageRfc822);
                            h.add_raw("Content-Type", "message/rfc822");
                        } else {
                            h.add_raw("Content-Type", "text/plain");
                        }
                    }

                    let mut bp = parse_bodypart(
                        &region[body_start..],
                        h,
                        enclosing,
                        error,
                    );
                    bp.set_number(pn);
                    pn += 1;
                    children.push(bp);
                }

                last = l;
                start = Some(j);
                i = j;
                continue;
            }
        }

        // Skip to the start of the next line.
        while i < raw.len() && b'\r' != raw[i] && b'\n' != raw[i] {
            i += 1;
        }
        while i < raw.len() && (b'\r' == raw[i] || b'\n' == raw[i]) {
            i += 1;
        }
    }

    children
}

/// Parses one bodypart whose header is `h`.
///
/// The charset parameter is absorbed into the decoded text (and
/// re-synthesised from the best codec for it); the transfer encoding is
/// adjusted to match what the canonical text actually needs.
pub fn parse_bodypart(
    raw: &[u8],
    mut h: Header,
    enclosing: &[Enclosing],
    error: &mut Option<String>,
) -> Bodypart {
    let mut raw = raw;
    if raw.starts_with(b"\r\n") {
        raw = &raw[2..];
    } else if raw.starts_with(b"\n") {
        raw = &raw[1..];
    }

    let cte = h.content_transfer_encoding().unwrap_or_default();
    let mut body = content_encoding::decode(raw, cte);

    let mut bp = Bodypart::new(1);

    let is_text = h.content_type().map_or(true, |ct| ct.is_type("text"));
    let has_ct = h.field(FieldType::ContentType, 0).is_some();
    let (typ, subtype) = h
        .content_type()
        .map(|ct| (ct.typ.clone(), ct.subtype.clone()))
        .unwrap_or_else(|| ("text".to_owned(), "plain".to_owned()));

    if is_text {
        let declared = h
            .content_type()
            .and_then(|ct| ct.parameter("charset"))
            .map(str::to_owned);
        let mut codec = match declared {
            Some(ref cs) => Codec::by_name(cs).unwrap_or_else(Codec::ascii),
            None => Codec::ascii(),
        };
        if let Some(ct) = h
            .field_mut(FieldType::ContentType, 0)
            .and_then(HeaderField::content_type_mut)
        {
            ct.remove_parameter("charset");
        }

        let mut text = codec.to_unicode(&body);
        if !codec.valid() && declared.is_none() {
            // No charset was declared; try the modern default before
            // giving up.
            let mut utf8 = Codec::utf8();
            let t = utf8.to_unicode(&body);
            if utf8.valid() {
                text = t;
            } else {
                text = Codec::latin1().to_unicode(&body);
            }
        } else if !codec.valid() && error.is_none() {
            *error = Some(format!(
                "error converting body from {} to Unicode",
                codec.name()
            ));
        }

        // Is there a better codec for this data?
        let mut best = Codec::by_string(&text);
        if has_ct && "us-ascii" != best.name() {
            if let Some(ct) = h
                .field_mut(FieldType::ContentType, 0)
                .and_then(HeaderField::content_type_mut)
            {
                ct.set_parameter("charset", best.name());
            }
        }

        let canonical = if has_ct {
            best.from_unicode(&text)
        } else {
            Codec::ascii().from_unicode(&text)
        };
        let qp = needs_qp(&canonical);

        let have_cte =
            h.field(FieldType::ContentTransferEncoding, 0).is_some();
        if have_cte {
            if !qp {
                h.remove_field(FieldType::ContentTransferEncoding);
            } else if let Some(f) =
                h.field_mut(FieldType::ContentTransferEncoding, 0)
            {
                f.set_transfer_encoding(TransferEncoding::QuotedPrintable);
            }
        } else if qp {
            h.add_raw("Content-Transfer-Encoding", "quoted-printable");
        }
        h.simplify();

        bp.text = Some(text);
        body = canonical;
    } else {
        if "multipart" != typ && "message" != typ {
            if let Some(f) =
                h.field_mut(FieldType::ContentTransferEncoding, 0)
            {
                f.set_transfer_encoding(TransferEncoding::Base64);
            } else {
                h.add_raw("Content-Transfer-Encoding", "base64");
            }
            h.simplify();
        }
    }

    bp.num_bytes = body.len() as u32;
    let encoded = content_encoding::encode(
        &body,
        h.content_transfer_encoding().unwrap_or_default(),
    );
    bp.num_encoded_bytes = encoded.len() as u32;
    if bp.text.is_some() {
        bp.num_encoded_lines = encoded_line_count(&encoded);
    }

    if "multipart" == typ {
        let boundary = h
            .content_type()
            .and_then(|ct| ct.parameter("boundary"))
            .unwrap_or("")
            .to_owned();
        let digest = "digest" == subtype;
        let mut inner = enclosing.to_vec();
        inner.insert(0, enclosing_view(&h));
        bp.children =
            parse_multipart(raw, &boundary, digest, &inner, error);
        bp.data = body;
    } else if "message" == typ && "rfc822" == subtype {
        let mut inner = enclosing.to_vec();
        inner.insert(0, enclosing_view(&h));
        let m = Message::parse_enclosed(raw, &inner, error);
        bp.children = m.parts().to_vec();
        bp.message = Some(Box::new(m));
        bp.data = body;
    } else if bp.text.is_none() {
        bp.data = body;
    } else {
        bp.data = body;
    }

    bp.header = h;
    bp
}

/// What a nested header may inherit from `h` during repair.
pub fn enclosing_view(h: &Header) -> Enclosing {
    let from = h
        .addresses(FieldType::From)
        .or_else(|| h.addresses(FieldType::ReturnPath))
        .or_else(|| h.addresses(FieldType::Sender))
        .map(<[_]>::to_vec)
        .unwrap_or_default();
    Enclosing {
        date: h.date(),
        from,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_header_block_basics() {
        let raw = b"Subject: hello\r\nX-Long: one\r\n two\r\n\r\nbody";
        let (h, off) = parse_header_block(raw, Mode::Rfc2822);
        assert_eq!(b"body", &raw[off..]);
        assert_eq!("hello", h.subject().unwrap());
        assert_eq!(
            "one two",
            h.field(FieldType::Other, 0).unwrap().data()
        );
    }

    #[test]
    fn parse_header_block_without_body() {
        let raw = b"Subject: only\r\n";
        let (h, off) = parse_header_block(raw, Mode::Rfc2822);
        assert_eq!(raw.len(), off);
        assert_eq!("only", h.subject().unwrap());
    }

    #[test]
    fn boundary_detection_requires_line_start() {
        let raw = b"prefix --bound inside a line\r\n\
                    --bound\r\n\
                    Content-Type: text/plain\r\n\r\n\
                    first part\r\n\
                    --bound--\r\n";
        let parts =
            parse_multipart(raw, "bound", false, &[], &mut None);
        assert_eq!(1, parts.len());
        assert_eq!("first part", parts[0].text().trim_end());
    }

    #[test]
    fn closing_boundary_at_eof() {
        let raw = b"--b\r\n\r\nonly\r\n--b--";
        let parts = parse_multipart(raw, "b", false, &[], &mut None);
        assert_eq!(1, parts.len());
    }

    #[test]
    fn digest_default_is_rfc822() {
        let raw = b"--d\r\n\r\n\
                    From: a@b.c\r\n\
                    Date: Mon, 01 Jun 2009 12:00:00 +0000\r\n\r\n\
                    inner body\r\n\
                    --d--\r\n";
        let parts = parse_multipart(raw, "d", true, &[], &mut None);
        assert_eq!(1, parts.len());
        let ct = parts[0].content_type().unwrap();
        assert!(ct.is_type("message"));
        assert!(ct.is_subtype("rfc822"));
        assert!(parts[0].message().is_some());
    }

    #[test]
    fn text_part_charset_synthesis() {
        // No declared charset, UTF-8 content: the parse picks utf-8 and
        // records it on the content-type.
        let h = parse_header_block(
            b"Content-Type: text/html\r\n\r\n",
            Mode::Mime,
        )
        .0;
        let bp = parse_bodypart(
            "<p>caf\u{e9}</p>".as_bytes(),
            h,
            &[],
            &mut None,
        );
        assert_eq!("<p>café</p>", bp.text());
        assert_eq!(
            Some("utf-8"),
            bp.content_type().unwrap().parameter("charset")
        );
        // 8-bit canonical text requires quoted-printable.
        assert_eq!(
            Some(TransferEncoding::QuotedPrintable),
            bp.header().content_transfer_encoding()
        );
    }

    #[test]
    fn ascii_text_drops_charset() {
        let h = parse_header_block(
            b"Content-Type: text/plain; charset=utf-8\r\n\r\n",
            Mode::Mime,
        )
        .0;
        let bp = parse_bodypart(b"plain ascii\r\n", h, &[], &mut None);
        assert_eq!("plain ascii\r\n", bp.text());
        // us-ascii needs no charset parameter, and text/plain with no
        // parameters simplifies away entirely.
        assert!(bp.content_type().is_none());
    }

    #[test]
    fn binary_part_forces_base64() {
        let h = parse_header_block(
            b"Content-Type: application/octet-stream\r\n\r\n",
            Mode::Mime,
        )
        .0;
        let payload = [0u8, 1, 2, 3, 254, 255];
        let encoded =
            content_encoding::base64_encode_wrapped(&payload, 72);
        let mut with_cte_header = Vec::new();
        with_cte_header.extend_from_slice(&encoded);

        let mut h2 = h;
        h2.add_raw("Content-Transfer-Encoding", "base64");
        let bp = parse_bodypart(&with_cte_header, h2, &[], &mut None);

        assert_eq!(&payload[..], bp.data());
        assert_eq!(payload.len() as u32, bp.num_bytes());
        assert_eq!(
            Some(TransferEncoding::Base64),
            bp.header().content_transfer_encoding()
        );
        assert!(bp.num_encoded_bytes() >= bp.num_bytes());
    }

    #[test]
    fn byte_and_line_accounting() {
        let h = parse_header_block(b"\r\n", Mode::Mime).0;
        let bp = parse_bodypart(b"one\r\ntwo\r\n", h, &[], &mut None);
        assert_eq!(10, bp.num_bytes());
        assert_eq!(10, bp.num_encoded_bytes());
        assert_eq!(2, bp.num_encoded_lines());
    }
}
