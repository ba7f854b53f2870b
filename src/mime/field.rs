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

//! Individual header fields.
//!
//! Each field has two faces: `data()` is the database form (unfolded,
//! UTF-8, RFC 2047 decoded), `value()` is the wire form (folded, encoded
//! where needed). `create` parses the wire form, `assemble` the database
//! form; each face is reconstructible from the other. A field that fails
//! to parse keeps its raw content, records `error`, and stays identifiable
//! by name and type.

use chrono::prelude::*;

use super::content_encoding::TransferEncoding;
use super::encoded_word::{encode_unstructured, ew_decode_unstructured};
use super::rfc5322::{
    parse_address_list, parse_date_time, parse_mailbox, parse_msg_id,
    parse_msg_id_list, Address,
};

/// The closed field-type enumeration.
///
/// The numeric values are stable: the `address_fields.field` column stores
/// them, so they must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldType {
    Other = 0,
    From = 1,
    ResentFrom = 2,
    Sender = 3,
    ResentSender = 4,
    ReturnPath = 5,
    ReplyTo = 6,
    To = 7,
    Cc = 8,
    Bcc = 9,
    ResentTo = 10,
    ResentCc = 11,
    ResentBcc = 12,
    MessageId = 13,
    ResentMessageId = 14,
    InReplyTo = 15,
    References = 16,
    Date = 17,
    OrigDate = 18,
    ResentDate = 19,
    Subject = 20,
    Comments = 21,
    Keywords = 22,
    ContentType = 23,
    ContentTransferEncoding = 24,
    ContentDisposition = 25,
    ContentDescription = 26,
    ContentLanguage = 27,
    ContentLocation = 28,
    ContentBase = 29,
    ContentMd5 = 30,
    ContentId = 31,
    MimeVersion = 32,
    Received = 33,
}

static FIELD_NAMES: &[(&str, FieldType)] = &[
    ("From", FieldType::From),
    ("Resent-From", FieldType::ResentFrom),
    ("Sender", FieldType::Sender),
    ("Resent-Sender", FieldType::ResentSender),
    ("Return-Path", FieldType::ReturnPath),
    ("Reply-To", FieldType::ReplyTo),
    ("To", FieldType::To),
    ("Cc", FieldType::Cc),
    ("Bcc", FieldType::Bcc),
    ("Resent-To", FieldType::ResentTo),
    ("Resent-Cc", FieldType::ResentCc),
    ("Resent-Bcc", FieldType::ResentBcc),
    ("Message-Id", FieldType::MessageId),
    ("Resent-Message-Id", FieldType::ResentMessageId),
    ("In-Reply-To", FieldType::InReplyTo),
    ("References", FieldType::References),
    ("Date", FieldType::Date),
    ("Orig-Date", FieldType::OrigDate),
    ("Resent-Date", FieldType::ResentDate),
    ("Subject", FieldType::Subject),
    ("Comments", FieldType::Comments),
    ("Keywords", FieldType::Keywords),
    ("Content-Type", FieldType::ContentType),
    ("Content-Transfer-Encoding", FieldType::ContentTransferEncoding),
    ("Content-Disposition", FieldType::ContentDisposition),
    ("Content-Description", FieldType::ContentDescription),
    ("Content-Language", FieldType::ContentLanguage),
    ("Content-Location", FieldType::ContentLocation),
    ("Content-Base", FieldType::ContentBase),
    ("Content-Md5", FieldType::ContentMd5),
    ("Content-Id", FieldType::ContentId),
    ("Mime-Version", FieldType::MimeVersion),
    ("Received", FieldType::Received),
];

impl FieldType {
    pub fn from_name(name: &str) -> FieldType {
        FIELD_NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, t)| t)
            .unwrap_or(FieldType::Other)
    }

    pub fn from_number(n: u32) -> Option<FieldType> {
        FIELD_NAMES
            .iter()
            .map(|&(_, t)| t)
            .find(|&t| t as u32 == n)
    }

    /// The canonical (header-cased) name, or `None` for `Other`.
    pub fn canonical_name(self) -> Option<&'static str> {
        FIELD_NAMES
            .iter()
            .find(|&&(_, t)| t == self)
            .map(|&(n, _)| n)
    }

    pub fn is_address_field(self) -> bool {
        matches!(
            self,
            FieldType::From
                | FieldType::ResentFrom
                | FieldType::Sender
                | FieldType::ResentSender
                | FieldType::ReturnPath
                | FieldType::ReplyTo
                | FieldType::To
                | FieldType::Cc
                | FieldType::Bcc
                | FieldType::ResentTo
                | FieldType::ResentCc
                | FieldType::ResentBcc
        )
    }

    pub fn is_date_field(self) -> bool {
        matches!(
            self,
            FieldType::Date | FieldType::OrigDate | FieldType::ResentDate
        )
    }

    pub fn is_mime_field(self) -> bool {
        matches!(
            self,
            FieldType::ContentType
                | FieldType::ContentTransferEncoding
                | FieldType::ContentDisposition
                | FieldType::ContentDescription
                | FieldType::ContentLanguage
                | FieldType::ContentLocation
                | FieldType::ContentBase
                | FieldType::ContentMd5
                | FieldType::ContentId
        )
    }
}

/// Header-cases `name`: each hyphen-separated run gets a leading capital.
pub fn header_cased(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_start = true;
    for c in name.chars() {
        if at_start {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        at_start = '-' == c;
    }
    out
}

/// A parsed Content-Type or Content-Disposition parameter list.
fn parse_parameters(s: &str) -> Option<Vec<(String, String)>> {
    let mut params = Vec::new();
    for chunk in split_unquoted(s, ';') {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        let eq = chunk.find('=')?;
        let attr = chunk[..eq].trim().to_ascii_lowercase();
        let mut val = chunk[eq + 1..].trim();
        if attr.is_empty() {
            return None;
        }
        let value = if val.starts_with('"') {
            val = &val[1..];
            let mut out = String::new();
            let mut escaped = false;
            let mut closed = false;
            for c in val.chars() {
                if escaped {
                    out.push(c);
                    escaped = false;
                } else if '\\' == c {
                    escaped = true;
                } else if '"' == c {
                    closed = true;
                    break;
                } else {
                    out.push(c);
                }
            }
            if !closed {
                return None;
            }
            out
        } else {
            val.to_owned()
        };
        params.push((attr, value));
    }
    Some(params)
}

/// Splits on `sep`, ignoring separators inside double quotes.
fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (ix, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if '\\' == c && quoted {
            escaped = true;
        } else if '"' == c {
            quoted = !quoted;
        } else if c == sep && !quoted {
            out.push(&s[start..ix]);
            start = ix + sep.len_utf8();
        }
    }
    out.push(&s[start..]);
    out
}

fn format_parameters(out: &mut String, params: &[(String, String)]) {
    for (attr, value) in params {
        out.push_str("; ");
        out.push_str(attr);
        out.push('=');
        let plain = !value.is_empty()
            && value.bytes().all(|b| {
                b.is_ascii_alphanumeric() || b"-_.+".contains(&b)
            });
        if plain {
            out.push_str(value);
        } else {
            out.push('"');
            for c in value.chars() {
                if '"' == c || '\\' == c {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentType {
    pub typ: String,
    pub subtype: String,
    pub params: Vec<(String, String)>,
}

impl ContentType {
    pub fn new(typ: &str, subtype: &str) -> Self {
        ContentType {
            typ: typ.to_owned(),
            subtype: subtype.to_owned(),
            params: Vec::new(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut chunks = split_unquoted(s, ';');
        let ts = chunks.remove(0).trim();
        let slash = ts.find('/')?;
        let typ = ts[..slash].trim().to_ascii_lowercase();
        let subtype = ts[slash + 1..].trim().to_ascii_lowercase();
        if typ.is_empty()
            || subtype.is_empty()
            || typ.contains(' ')
            || subtype.contains(' ')
        {
            return None;
        }

        let params = parse_parameters(&chunks.join(";"))?;
        Some(ContentType {
            typ,
            subtype,
            params,
        })
    }

    pub fn is_type(&self, t: &str) -> bool {
        self.typ.eq_ignore_ascii_case(t)
    }

    pub fn is_subtype(&self, t: &str) -> bool {
        self.subtype.eq_ignore_ascii_case(t)
    }

    pub fn parameter(&self, attr: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(a, _)| a.eq_ignore_ascii_case(attr))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_parameter(&mut self, attr: &str, value: &str) {
        self.remove_parameter(attr);
        self.params
            .push((attr.to_ascii_lowercase(), value.to_owned()));
    }

    pub fn remove_parameter(&mut self, attr: &str) {
        self.params.retain(|(a, _)| !a.eq_ignore_ascii_case(attr));
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}/{}", self.typ, self.subtype);
        format_parameters(&mut out, &self.params);
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentDisposition {
    pub disposition: String,
    pub params: Vec<(String, String)>,
}

impl ContentDisposition {
    pub fn parse(s: &str) -> Option<Self> {
        let mut chunks = split_unquoted(s, ';');
        let disposition = chunks.remove(0).trim().to_ascii_lowercase();
        if disposition.is_empty() || disposition.contains(' ') {
            return None;
        }
        let params = parse_parameters(&chunks.join(";"))?;
        Some(ContentDisposition {
            disposition,
            params,
        })
    }

    pub fn render(&self) -> String {
        let mut out = self.disposition.clone();
        format_parameters(&mut out, &self.params);
        out
    }
}

/// The parsed payload of a field, by shape.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldData {
    Unstructured(String),
    Addresses(Vec<Address>),
    Date(DateTime<FixedOffset>),
    MessageIds(Vec<String>),
    ContentType(ContentType),
    TransferEncoding(TransferEncoding),
    Disposition(ContentDisposition),
    /// Content kept as-is because no parser applies or parsing failed; the
    /// data and value forms coincide.
    Raw(String),
}

#[derive(Clone, Debug)]
pub struct HeaderField {
    ftype: FieldType,
    name: String,
    data: FieldData,
    position: u32,
    parsed: bool,
    error: Option<String>,
}

impl HeaderField {
    /// Parses the wire form of a field.
    pub fn create(name: &str, value: &[u8]) -> HeaderField {
        HeaderField::build(name, value, true)
    }

    /// Parses the database form of a field (already unfolded, UTF-8,
    /// RFC 2047 decoded).
    pub fn assemble(name: &str, data: &str) -> HeaderField {
        HeaderField::build(name, data.as_bytes(), false)
    }

    /// An empty address field of type `t`, filled in address by address
    /// when reconstructing a header from `address_fields` rows.
    pub fn new_address(t: FieldType, position: u32) -> HeaderField {
        HeaderField {
            ftype: t,
            name: t
                .canonical_name()
                .unwrap_or("To")
                .to_owned(),
            data: FieldData::Addresses(Vec::new()),
            position,
            parsed: true,
            error: None,
        }
    }

    fn build(name: &str, value: &[u8], wire: bool) -> HeaderField {
        let ftype = FieldType::from_name(name);
        let name = ftype
            .canonical_name()
            .map(str::to_owned)
            .unwrap_or_else(|| header_cased(name));

        let unfolded = unfold(value);
        let text = String::from_utf8_lossy(&unfolded).into_owned();
        let trimmed = text.trim().to_owned();

        let mut f = HeaderField {
            ftype,
            name,
            data: FieldData::Raw(trimmed.clone()),
            position: 0,
            parsed: true,
            error: None,
        };

        match ftype {
            t if t.is_address_field() => match parse_addresses(t, &unfolded)
            {
                Some(mut addrs) => {
                    for a in &mut addrs {
                        if wire {
                            a.name = ew_decode_unstructured(&a.name)
                                .into_owned();
                        }
                    }
                    f.data = FieldData::Addresses(addrs);
                },
                None => f.fail("unparsable address list"),
            },

            t if t.is_date_field() => match parse_date_time(&unfolded) {
                Some(dt) => f.data = FieldData::Date(dt),
                None => f.fail("unparsable date"),
            },

            FieldType::MessageId
            | FieldType::ResentMessageId
            | FieldType::ContentId => match parse_msg_id(&unfolded) {
                Some(id) => f.data = FieldData::MessageIds(vec![id]),
                None => f.fail("unparsable message id"),
            },

            FieldType::References => match parse_msg_id_list(&unfolded) {
                Some(ids) => f.data = FieldData::MessageIds(ids),
                None => f.fail("unparsable references"),
            },

            FieldType::ContentType => match ContentType::parse(&text) {
                Some(ct) => f.data = FieldData::ContentType(ct),
                None => f.fail("unparsable content-type"),
            },

            FieldType::ContentTransferEncoding => {
                // Comments after the token occur in the wild.
                let token =
                    trimmed.split(|c: char| c.is_whitespace() || '(' == c)
                        .next()
                        .unwrap_or("");
                match TransferEncoding::parse(token) {
                    Some(cte) => f.data = FieldData::TransferEncoding(cte),
                    None => f.fail("unknown content-transfer-encoding"),
                }
            },

            FieldType::ContentDisposition => {
                match ContentDisposition::parse(&text) {
                    Some(cd) => f.data = FieldData::Disposition(cd),
                    None => f.fail("unparsable content-disposition"),
                }
            },

            FieldType::MimeVersion => {
                let bare = strip_comments(&trimmed);
                if "1.0" == bare.trim() {
                    f.data = FieldData::Unstructured("1.0".to_owned());
                } else {
                    f.fail("unsupported mime-version");
                }
            },

            FieldType::Received => {
                // Kept verbatim; usable only if the date after the last ';'
                // parses. An unusable Received is not an error, repair
                // drops it.
                f.data = FieldData::Raw(trimmed.clone());
                f.parsed = received_date(&trimmed).is_some();
            },

            FieldType::ContentLocation | FieldType::ContentBase => {
                if trimmed.is_empty()
                    || trimmed.contains(char::is_whitespace)
                {
                    f.fail("unparsable URI");
                } else {
                    f.data = FieldData::Raw(trimmed.clone());
                }
            },

            // In-Reply-To, Subject, Comments, Keywords,
            // Content-Description, Content-Language, Content-Md5, Other:
            // unstructured text. (The address and date types were handled
            // by the guards above.)
            _ => {
                let decoded = if wire {
                    ew_decode_unstructured(&trimmed).into_owned()
                } else {
                    trimmed.clone()
                };
                f.data = FieldData::Unstructured(decoded);
            },
        }

        f
    }

    fn fail(&mut self, what: &str) {
        self.parsed = false;
        if self.error.is_none() {
            self.error = Some(what.to_owned());
        }
    }

    pub fn ftype(&self) -> FieldType {
        self.ftype
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether the field's own parser consumed it successfully.
    pub fn parsed(&self) -> bool {
        self.parsed
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn set_position(&mut self, position: u32) {
        self.position = position;
    }

    pub fn field_data(&self) -> &FieldData {
        &self.data
    }

    pub fn addresses(&self) -> Option<&[Address]> {
        match self.data {
            FieldData::Addresses(ref a) => Some(a),
            _ => None,
        }
    }

    pub fn addresses_mut(&mut self) -> Option<&mut Vec<Address>> {
        match self.data {
            FieldData::Addresses(ref mut a) => Some(a),
            _ => None,
        }
    }

    pub fn date(&self) -> Option<DateTime<FixedOffset>> {
        match self.data {
            FieldData::Date(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn content_type(&self) -> Option<&ContentType> {
        match self.data {
            FieldData::ContentType(ref ct) => Some(ct),
            _ => None,
        }
    }

    pub fn content_type_mut(&mut self) -> Option<&mut ContentType> {
        match self.data {
            FieldData::ContentType(ref mut ct) => Some(ct),
            _ => None,
        }
    }

    pub fn transfer_encoding(&self) -> Option<TransferEncoding> {
        match self.data {
            FieldData::TransferEncoding(cte) => Some(cte),
            _ => None,
        }
    }

    pub fn set_transfer_encoding(&mut self, cte: TransferEncoding) {
        self.data = FieldData::TransferEncoding(cte);
    }

    pub fn disposition(&self) -> Option<&ContentDisposition> {
        match self.data {
            FieldData::Disposition(ref cd) => Some(cd),
            _ => None,
        }
    }

    pub fn message_ids(&self) -> Option<&[String]> {
        match self.data {
            FieldData::MessageIds(ref ids) => Some(ids),
            _ => None,
        }
    }

    /// The database form: unfolded, UTF-8, RFC 2047 decoded.
    pub fn data(&self) -> String {
        match self.data {
            FieldData::Unstructured(ref s) | FieldData::Raw(ref s) => {
                s.clone()
            },
            FieldData::Addresses(ref addrs) => addrs
                .iter()
                .map(Address::to_wire)
                .collect::<Vec<_>>()
                .join(", "),
            FieldData::Date(dt) => {
                dt.format("%a, %d %b %Y %H:%M:%S %z").to_string()
            },
            FieldData::MessageIds(ref ids) => ids
                .iter()
                .map(|id| format!("<{}>", id))
                .collect::<Vec<_>>()
                .join(" "),
            FieldData::ContentType(ref ct) => ct.render(),
            FieldData::TransferEncoding(cte) => cte.name().to_owned(),
            FieldData::Disposition(ref cd) => cd.render(),
        }
    }

    /// The wire form: RFC 2047 encoded where needed and folded at 78
    /// columns.
    pub fn value(&self) -> String {
        let body = match self.data {
            FieldData::Unstructured(ref s) => encode_unstructured(s),
            FieldData::Addresses(ref addrs) => addrs
                .iter()
                .map(|a| {
                    let mut a = a.clone();
                    a.name = encode_display_name(&a.name);
                    a.to_wire()
                })
                .collect::<Vec<_>>()
                .join(", "),
            _ => self.data(),
        };
        fold(self.name.len() + 2, &body)
    }
}

fn parse_addresses(t: FieldType, unfolded: &[u8]) -> Option<Vec<Address>> {
    match t {
        FieldType::Sender | FieldType::ResentSender => {
            parse_mailbox(unfolded).map(|a| vec![a])
        },
        FieldType::ReturnPath => {
            let trimmed: Vec<u8> = unfolded
                .iter()
                .copied()
                .filter(|&b| !b" \t\r\n".contains(&b))
                .collect();
            if b"<>" == trimmed.as_slice() {
                // The null return path.
                Some(Vec::new())
            } else {
                parse_mailbox(unfolded).map(|a| vec![a])
            }
        },
        _ => parse_address_list(unfolded),
    }
}

fn encode_display_name(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    if name.bytes().any(|b| b >= 0x80) {
        return encode_unstructured(name);
    }
    let atom_safe = name.bytes().all(|b| {
        b.is_ascii_alphanumeric() || b" !#$%&'*+-/=?^_`{|}~.".contains(&b)
    });
    if atom_safe {
        name.to_owned()
    } else {
        let mut out = String::with_capacity(name.len() + 2);
        out.push('"');
        for c in name.chars() {
            if '"' == c || '\\' == c {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
        out
    }
}

/// Removes CR and LF; the WSP of each folded line stands for itself.
fn unfold(value: &[u8]) -> Vec<u8> {
    value
        .iter()
        .copied()
        .filter(|&b| b'\r' != b && b'\n' != b)
        .collect()
}

/// Folds `body` at spaces so that lines stay near 78 columns, the first
/// line accounting for `prefix_len` (name, colon, space).
pub fn fold(prefix_len: usize, body: &str) -> String {
    const TARGET: usize = 78;
    let mut out = String::with_capacity(body.len() + 8);
    let mut col = prefix_len;

    for (ix, word) in body.split(' ').enumerate() {
        if 0 == ix {
            out.push_str(word);
            col += word.len();
        } else if col + 1 + word.len() > TARGET && col > prefix_len {
            out.push_str("\r\n ");
            out.push_str(word);
            col = 1 + word.len();
        } else {
            out.push(' ');
            out.push_str(word);
            col += 1 + word.len();
        }
    }

    out
}

fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            c if 0 == depth => out.push(c),
            _ => (),
        }
    }
    out
}

/// The date a Received field claims, from the text after its last ';'.
pub fn received_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let tail = &value[value.rfind(';')? + 1..];
    parse_date_time(tail.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_type_lookup() {
        assert_eq!(FieldType::From, FieldType::from_name("from"));
        assert_eq!(FieldType::From, FieldType::from_name("FROM"));
        assert_eq!(
            FieldType::ContentType,
            FieldType::from_name("content-type")
        );
        assert_eq!(FieldType::Other, FieldType::from_name("X-Spam-Level"));
        assert_eq!(Some(FieldType::Cc), FieldType::from_number(8));
        assert_eq!(None, FieldType::from_number(999));
    }

    #[test]
    fn test_header_cased() {
        assert_eq!("Content-Type", header_cased("CONTENT-TYPE"));
        assert_eq!("X-Spam-Level", header_cased("x-spam-level"));
        assert_eq!("Mime-Version", header_cased("MIME-Version"));
    }

    #[test]
    fn address_field_round_trip() {
        let f = HeaderField::create(
            "To",
            b"Alice <alice@example.com>, bob@example.org",
        );
        assert!(f.valid());
        assert_eq!(2, f.addresses().unwrap().len());
        assert_eq!(
            "Alice <alice@example.com>, bob@example.org",
            f.data()
        );
        assert_eq!(f.data(), f.value());

        let g = HeaderField::assemble("To", &f.data());
        assert_eq!(f.data(), g.data());
    }

    #[test]
    fn encoded_word_display_name() {
        let f = HeaderField::create(
            "From",
            b"=?iso-8859-1?q?Andr=E9?= <andre@example.fr>",
        );
        assert!(f.valid());
        assert_eq!("André", f.addresses().unwrap()[0].name);
        assert_eq!("Andr\u{e9} <andre@example.fr>", f.data());

        // Wire form re-encodes.
        let wire = f.value();
        assert!(wire.bytes().all(|b| b < 0x80));
        let g = HeaderField::create("From", wire.as_bytes());
        assert_eq!(f.data(), g.data());
    }

    #[test]
    fn date_field() {
        let f = HeaderField::create(
            "Date",
            b"Fri, 21 Nov 1997 09:55:06 -0600",
        );
        assert!(f.valid());
        assert_eq!("Fri, 21 Nov 1997 09:55:06 -0600", f.data());

        let bad = HeaderField::create("Date", b"yesterday-ish");
        assert!(!bad.valid());
        assert!(bad.error().is_some());
        assert_eq!("Date", bad.name());
        assert_eq!("yesterday-ish", bad.data());
    }

    #[test]
    fn unstructured_decoding_and_idempotence() {
        let f = HeaderField::create(
            "Subject",
            b"=?utf-8?q?caf=C3=A9?= meeting",
        );
        assert_eq!("café meeting", f.data());

        // parse is idempotent on data: assembling from data and taking
        // data again is the identity.
        let g = HeaderField::assemble("Subject", &f.data());
        assert_eq!(f.data(), g.data());
        let h = HeaderField::assemble("Subject", &g.data());
        assert_eq!(g.data(), h.data());
    }

    #[test]
    fn content_type_parsing() {
        let f = HeaderField::create(
            "Content-Type",
            b"TEXT/Plain; charset=\"utf-8\"; format=flowed",
        );
        let ct = f.content_type().unwrap();
        assert!(ct.is_type("text"));
        assert!(ct.is_subtype("plain"));
        assert_eq!(Some("utf-8"), ct.parameter("charset"));
        assert_eq!(Some("flowed"), ct.parameter("format"));
        assert_eq!(
            "text/plain; charset=utf-8; format=flowed",
            f.data()
        );

        assert!(!HeaderField::create("Content-Type", b"garbage").valid());
    }

    #[test]
    fn transfer_encoding_with_comment() {
        let f = HeaderField::create(
            "Content-Transfer-Encoding",
            b"base64 (bulk data)",
        );
        assert_eq!(
            Some(TransferEncoding::Base64),
            f.transfer_encoding()
        );
    }

    #[test]
    fn return_path_null() {
        let f = HeaderField::create("Return-Path", b"<>");
        assert!(f.valid());
        assert_eq!(Some(&[][..]), f.addresses());
    }

    #[test]
    fn received_parsed_flag() {
        let good = HeaderField::create(
            "Received",
            b"from x.example by y.example; Fri, 21 Nov 1997 09:55:06 -0600",
        );
        assert!(good.parsed());
        assert!(good.valid());

        let bad = HeaderField::create(
            "Received",
            b"from x.example by y.example; not a date",
        );
        assert!(!bad.parsed());
        assert!(bad.valid());
    }

    #[test]
    fn references_list() {
        let f = HeaderField::create("References", b"<a@b> <c@d>");
        assert_eq!(
            Some(&["a@b".to_owned(), "c@d".to_owned()][..]),
            f.message_ids()
        );
        assert_eq!("<a@b> <c@d>", f.data());
    }

    #[test]
    fn folding_long_values() {
        let long = "word ".repeat(40);
        let folded = fold(9, long.trim());
        for line in folded.split("\r\n") {
            assert!(line.len() <= 78);
        }
        assert_eq!(
            long.trim(),
            folded.replace("\r\n ", " ").as_str()
        );
    }
}
