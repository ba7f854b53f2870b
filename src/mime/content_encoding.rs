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

//! Content-transfer encodings.
//!
//! Decoding never fails: invalid quoted-printable sequences pass through
//! untransformed, and base64 decoding skips anything outside the alphabet,
//! because real mail contains both.

use std::str;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferEncoding {
    Binary,
    SevenBit,
    EightBit,
    QuotedPrintable,
    Base64,
}

impl Default for TransferEncoding {
    fn default() -> Self {
        TransferEncoding::Binary
    }
}

impl TransferEncoding {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Some(TransferEncoding::Binary),
            "7bit" => Some(TransferEncoding::SevenBit),
            "8bit" => Some(TransferEncoding::EightBit),
            "quoted-printable" => Some(TransferEncoding::QuotedPrintable),
            "base64" => Some(TransferEncoding::Base64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TransferEncoding::Binary => "binary",
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::EightBit => "8bit",
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Base64 => "base64",
        }
    }
}

/// Decodes `data` according to `cte`.
pub fn decode(data: &[u8], cte: TransferEncoding) -> Vec<u8> {
    match cte {
        TransferEncoding::Binary
        | TransferEncoding::SevenBit
        | TransferEncoding::EightBit => data.to_vec(),
        TransferEncoding::QuotedPrintable => qp_decode(data),
        TransferEncoding::Base64 => base64_decode_lenient(data),
    }
}

/// Encodes `data` according to `cte`. Base64 output is wrapped at 72
/// columns, quoted-printable at 76.
pub fn encode(data: &[u8], cte: TransferEncoding) -> Vec<u8> {
    match cte {
        TransferEncoding::Binary
        | TransferEncoding::SevenBit
        | TransferEncoding::EightBit => data.to_vec(),
        TransferEncoding::QuotedPrintable => qp_encode(data),
        TransferEncoding::Base64 => base64_encode_wrapped(data, 72),
    }
}

/// Decodes quoted-printable per RFC 2045: encoded bytes and soft line
/// breaks (both line-ending conventions), with invalid escapes passed
/// through verbatim.
pub fn qp_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let b = data[i];
        if b'=' != b {
            out.push(b);
            i += 1;
            continue;
        }

        let rest = &data[i + 1..];
        if rest.starts_with(b"\r\n") {
            i += 3;
        } else if rest.starts_with(b"\n") {
            i += 2;
        } else if rest.len() >= 2 {
            match str::from_utf8(&rest[..2])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                Some(decoded) => {
                    out.push(decoded);
                    i += 3;
                },
                None => {
                    out.push(b'=');
                    i += 1;
                },
            }
        } else {
            out.push(b'=');
            i += 1;
        }
    }

    out
}

/// Encodes `data` as quoted-printable, wrapping with soft line breaks so no
/// output line exceeds 76 characters. Input line breaks, either convention,
/// come out as hard CRLF.
pub fn qp_encode(data: &[u8]) -> Vec<u8> {
    const LIMIT: usize = 75;
    let mut out = Vec::with_capacity(data.len() * 3 / 2);
    let mut col = 0;

    fn push(out: &mut Vec<u8>, col: &mut usize, bytes: &[u8]) {
        if *col + bytes.len() > LIMIT {
            out.extend_from_slice(b"=\r\n");
            *col = 0;
        }
        out.extend_from_slice(bytes);
        *col += bytes.len();
    }

    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b'\r' == b && data.get(i + 1) == Some(&b'\n') {
            out.extend_from_slice(b"\r\n");
            col = 0;
            i += 2;
            continue;
        }
        if b'\n' == b {
            out.extend_from_slice(b"\r\n");
            col = 0;
            i += 1;
            continue;
        }

        let next = data.get(i + 1).copied();
        // Whitespace is literal except at the end of a line, where it must
        // be encoded.
        let at_line_end =
            next.is_none() || Some(b'\n') == next || Some(b'\r') == next;
        let literal = match b {
            b' ' | b'\t' => !at_line_end,
            b'=' => false,
            b => (b' '..=b'~').contains(&b),
        };

        if literal {
            push(&mut out, &mut col, &[b]);
        } else {
            push(&mut out, &mut col, format!("={:02X}", b).as_bytes());
        }
        i += 1;
    }

    out
}

fn base64_decode_lenient(data: &[u8]) -> Vec<u8> {
    let filtered = data
        .iter()
        .copied()
        .filter(|b| b.is_ascii_alphanumeric() || b"+/=".contains(b))
        .collect::<Vec<u8>>();

    let mut out = Vec::with_capacity(filtered.len() * 3 / 4);
    let _ = base64::decode_config_buf(
        &filtered,
        base64::STANDARD.decode_allow_trailing_bits(true),
        &mut out,
    );
    out
}

/// Base64-encodes `data` in lines of `width` characters.
pub fn base64_encode_wrapped(data: &[u8], width: usize) -> Vec<u8> {
    let encoded = base64::encode(data);
    let mut out =
        Vec::with_capacity(encoded.len() + encoded.len() / width.max(1) * 2 + 2);
    for chunk in encoded.as_bytes().chunks(width.max(1)) {
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Whether a text body needs quoted-printable to survive 7-bit transport:
/// any 8-bit or control octet (other than CR, LF, HT), or a line longer
/// than 78 characters.
pub fn needs_qp(data: &[u8]) -> bool {
    let mut line_len = 0;
    for &b in data {
        if b'\n' == b {
            line_len = 0;
            continue;
        }
        line_len += 1;
        if line_len > 78 {
            return true;
        }
        if (b < 32 && b'\r' != b && b'\t' != b) || b >= 127 {
            return true;
        }
    }
    false
}

/// Counts the lines of an encoded body: the number of LFs, plus one for a
/// final unterminated line.
pub fn encoded_line_count(data: &[u8]) -> u32 {
    let mut n = memchr::memchr_iter(b'\n', data).count() as u32;
    if !data.is_empty() && b'\n' != data[data.len() - 1] {
        n += 1;
    }
    n
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_qp_decode() {
        assert_eq!(b"hello world".to_vec(), qp_decode(b"hello world"));
        assert_eq!(b"\xabfoo".to_vec(), qp_decode(b"=ABfoo"));
        assert_eq!(b"fo\xabo".to_vec(), qp_decode(b"fo=ABo"));
        assert_eq!(b"foo\xab".to_vec(), qp_decode(b"foo=AB"));
        assert_eq!(b"foo".to_vec(), qp_decode(b"foo=\n"));
        assert_eq!(b"foobar".to_vec(), qp_decode(b"foo=\r\nbar"));
        assert_eq!(b"foo=()bar".to_vec(), qp_decode(b"foo=()bar"));
        assert_eq!(b"foo=".to_vec(), qp_decode(b"foo="));
        assert_eq!(b"foo=A".to_vec(), qp_decode(b"foo=A"));
    }

    #[test]
    fn test_qp_encode() {
        assert_eq!(b"hello world".to_vec(), qp_encode(b"hello world"));
        assert_eq!(b"caf=E9".to_vec(), qp_encode(b"caf\xe9"));
        assert_eq!(b"a=3Db".to_vec(), qp_encode(b"a=b"));
        assert_eq!(b"line\r\nbreak".to_vec(), qp_encode(b"line\nbreak"));
        assert_eq!(
            b"trailing=20\r\nx".to_vec(),
            qp_encode(b"trailing \nx")
        );
    }

    #[test]
    fn qp_encode_wraps_long_lines() {
        let long = vec![b'x'; 200];
        let encoded = qp_encode(&long);
        for line in encoded.split(|&b| b'\n' == b) {
            assert!(line.len() <= 77, "line too long: {}", line.len());
        }
        assert_eq!(long, qp_decode(&encoded));
    }

    #[test]
    fn test_base64() {
        assert_eq!(
            b"aGVsbG8gd29ybGQ=\r\n".to_vec(),
            base64_encode_wrapped(b"hello world", 72)
        );
        assert_eq!(
            b"hello world".to_vec(),
            decode(b"aGVsbG8gd29ybGQ=", TransferEncoding::Base64)
        );
        // Whitespace inside the payload is tolerated.
        assert_eq!(
            b"hello world".to_vec(),
            decode(b"aGVsbG8g\r\nd29ybGQ=\r\n", TransferEncoding::Base64)
        );
    }

    #[test]
    fn test_needs_qp() {
        assert!(!needs_qp(b"plain text\r\nwith lines\r\n"));
        assert!(needs_qp(b"caf\xe9"));
        assert!(needs_qp(b"\x00"));
        assert!(needs_qp(&vec![b'a'; 100]));
        assert!(!needs_qp(b"tab\tand\rcr are fine"));
    }

    #[test]
    fn test_encoded_line_count() {
        assert_eq!(0, encoded_line_count(b""));
        assert_eq!(1, encoded_line_count(b"x"));
        assert_eq!(1, encoded_line_count(b"x\n"));
        assert_eq!(2, encoded_line_count(b"x\ny"));
        assert_eq!(2, encoded_line_count(b"x\r\ny\r\n"));
    }

    proptest! {
        #[test]
        fn qp_round_trip(
            s in prop::collection::vec(
                prop::num::u8::ANY.prop_filter("no line breaks", |&b| {
                    b != b'\n' && b != b'\r'
                }),
                0..200,
            )
        ) {
            prop_assert_eq!(s.clone(), qp_decode(&qp_encode(&s)));
        }

        #[test]
        fn base64_round_trip(
            s in prop::collection::vec(prop::num::u8::ANY, 0..200)
        ) {
            let encoded = base64_encode_wrapped(&s, 72);
            prop_assert_eq!(s, decode(&encoded, TransferEncoding::Base64));
        }

        #[test]
        fn qp_decode_never_panics(
            s in prop::collection::vec(prop::num::u8::ANY, 0..64)
        ) {
            qp_decode(&s);
        }
    }
}
