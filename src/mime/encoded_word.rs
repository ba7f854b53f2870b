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

//! RFC 2047 encoded words.
//!
//! Decoding accepts over-long encoded words (agents produce them and
//! Thunderbird interprets them, so the 75-character limit buys nothing).
//! Encoding always labels the content utf-8 and picks whichever of the B
//! and Q encodings is shorter for the material at hand.

use std::borrow::Cow;
use std::iter;

use lazy_static::lazy_static;
use regex::Regex;

use super::codec::Codec;
use super::content_encoding::qp_decode;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"^=\?([!->@-~]*)\?([!->@-~]*)\?([!->@-~]*)\?=$").unwrap();
}

/// Decode all encoded words in the given unstructured string.
///
/// Whitespace between adjacent encoded words is deleted; all other
/// whitespace is preserved.
pub fn ew_decode_unstructured(text: &str) -> Cow<str> {
    let mut transformed = String::new();

    let mut untransformed_ix = 0;
    let mut word_start = 0;
    let mut last_was_encoded = false;

    for word_end in text
        .as_bytes()
        .iter()
        .copied()
        .enumerate()
        .filter(|&(_, c)| c == b' ' || c == b'\t' || c == b'\n' || c == b'\r')
        .map(|(ix, _)| ix)
        .chain(iter::once(text.len()))
    {
        let word = &text[word_start..word_end];

        if let Some(decoded) = ew_decode(word) {
            if !last_was_encoded {
                transformed.push_str(&text[untransformed_ix..word_start]);
            }
            transformed.push_str(&decoded);
            untransformed_ix = word_end;
            last_was_encoded = true;
        } else if !word.is_empty() {
            last_was_encoded = false;
        }

        word_start = word_end + 1;
    }

    if !transformed.is_empty() {
        transformed.push_str(&text[untransformed_ix..]);
        Cow::Owned(transformed)
    } else {
        Cow::Borrowed(text)
    }
}

/// Test if `word` (in its entirety) is an encoded word, and if so decode it.
///
/// Returns `None` if it is not an encoded word or could not be decoded; the
/// distinction from returning the input matters because whitespace between
/// adjacent encoded words must be deleted.
pub fn ew_decode(word: &str) -> Option<String> {
    let captures = ENCODED_WORD.captures(word)?;

    let charset = captures.get(1).unwrap().as_str();
    let transfer_encoding = captures.get(2).unwrap().as_str();
    let mut content =
        Cow::Borrowed(captures.get(3).unwrap().as_str().as_bytes());

    // _ in the content (before transfer decoding) stands for ASCII space
    // regardless of charset.
    if content.contains(&b'_') {
        for b in content.to_mut() {
            if *b == b'_' {
                *b = b' ';
            }
        }
    }

    let content = decode_xfer(transfer_encoding, &content)?;

    let mut codec = Codec::by_name(charset)?;
    let decoded = codec.to_unicode(&content);
    if codec.valid() {
        Some(decoded)
    } else {
        None
    }
}

fn decode_xfer(xfer: &str, content: &[u8]) -> Option<Vec<u8>> {
    match xfer {
        "q" | "Q" => Some(qp_decode(content)),
        "b" | "B" => base64::decode(content).ok(),
        _ => None,
    }
}

/// Maximum length of one produced encoded word.
const MAX_EW: usize = 75;

/// Encodes `text` as a sequence of utf-8 encoded words.
///
/// The text is split on character boundaries so each word stays within the
/// length limit; decoders delete the whitespace between the pieces.
pub fn ew_encode(text: &str) -> String {
    // "=?utf-8?q?" + "?=" leaves this much room for content.
    const BUDGET: usize = MAX_EW - 12;

    let mut out = String::new();
    let mut chunk = String::new();

    let mut flush = |chunk: &mut String, out: &mut String| {
        if chunk.is_empty() {
            return;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&ew_encode_one(chunk));
        chunk.clear();
    };

    for c in text.chars() {
        let mut buf = [0u8; 4];
        let encoded_len = c.encode_utf8(&mut buf).len() * 3;
        if q_len(chunk.as_bytes()) + encoded_len > BUDGET
            && b64_len(chunk.len() + c.len_utf8()) > BUDGET
        {
            flush(&mut chunk, &mut out);
        }
        chunk.push(c);
    }
    flush(&mut chunk, &mut out);

    out
}

fn ew_encode_one(chunk: &str) -> String {
    let bytes = chunk.as_bytes();
    if q_len(bytes) <= b64_len(bytes.len()) {
        let mut content = String::with_capacity(q_len(bytes));
        for &b in bytes {
            match b {
                b' ' => content.push('_'),
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'!' | b'*'
                | b'+' | b'-' | b'/' => content.push(b as char),
                b => content.push_str(&format!("={:02X}", b)),
            }
        }
        format!("=?utf-8?q?{}?=", content)
    } else {
        format!("=?utf-8?b?{}?=", base64::encode(bytes))
    }
}

fn q_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .map(|&b| match b {
            b' ' => 1,
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'!' | b'*' | b'+'
            | b'-' | b'/' => 1,
            _ => 3,
        })
        .sum()
}

fn b64_len(raw: usize) -> usize {
    (raw + 2) / 3 * 4
}

/// Encodes unstructured header text for the wire: runs of words that carry
/// 8-bit material become encoded words, everything else passes through.
pub fn encode_unstructured(text: &str) -> String {
    if text.bytes().all(|b| b < 0x80) {
        return text.to_owned();
    }

    let mut out = String::with_capacity(text.len() + 16);
    let mut run = String::new();

    for word in text.split(' ') {
        if word.bytes().any(|b| b >= 0x80)
            || (!run.is_empty() && word.starts_with("=?"))
        {
            // An all-ASCII word that looks like an encoded word must also
            // be encoded, or it would decode as one.
            if !run.is_empty() {
                run.push(' ');
            }
            run.push_str(word);
        } else {
            if !run.is_empty() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&ew_encode(&run));
                run.clear();
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(word);
        }
    }

    if !run.is_empty() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&ew_encode(&run));
    }

    out
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_ew_decode() {
        assert_eq!(None, ew_decode("hello world"));
        assert_eq!("test", ew_decode("=?us-ascii?q?test?=").unwrap());

        // Examples from RFC 2047
        assert_eq!(
            "Keith Moore",
            ew_decode("=?US-ASCII?Q?Keith_Moore?=").unwrap()
        );
        assert_eq!(
            "Keld Jørn Simonsen",
            ew_decode("=?ISO-8859-1?Q?Keld_J=F8rn_Simonsen?=").unwrap()
        );
        assert_eq!("André", ew_decode("=?ISO-8859-1?Q?Andr=E9?=").unwrap());
        assert_eq!(
            "If you can read this yo",
            ew_decode("=?ISO-8859-1?B?SWYgeW91IGNhbiByZWFkIHRoaXMgeW8=?=")
                .unwrap()
        );
        assert_eq!(
            "u understand the example.",
            ew_decode("=?ISO-8859-2?B?dSB1bmRlcnN0YW5kIHRoZSBleGFtcGxlLg==?=")
                .unwrap()
        );

        assert_eq!("🎆", ew_decode("=?utf-8?Q?=F0=9F=8E=86?=").unwrap());
        assert_eq!(
            "Keith Moore",
            ew_decode("=?US-ASCII*EN?Q?Keith_Moore?=").unwrap()
        );
    }

    #[test]
    fn test_ew_decode_unstructured() {
        assert_eq!("hello world", ew_decode_unstructured("hello world"));
        assert_eq!(
            "this is a test",
            ew_decode_unstructured("=?us-ascii?q?this?= is a test")
        );
        assert_eq!(
            "this is a test",
            ew_decode_unstructured("this =?us-ascii?q?is?= a test")
        );
        assert_eq!(
            "this is a test",
            ew_decode_unstructured("this is a =?us-ascii?q?test?=")
        );
        assert_eq!(
            "this isa test",
            ew_decode_unstructured(
                "this =?us-ascii?q?is?= \t\r\n=?us-ascii?q?a?= test"
            )
        );
        assert_eq!("", ew_decode_unstructured(""));
    }

    #[test]
    fn test_encode_unstructured() {
        assert_eq!("plain ascii", encode_unstructured("plain ascii"));

        let encoded = encode_unstructured("café crème brûlée");
        assert!(encoded.bytes().all(|b| b < 0x80));
        assert_eq!(
            "café crème brûlée",
            ew_decode_unstructured(&encoded)
        );

        let mixed = encode_unstructured("hello ☺ world");
        assert!(mixed.starts_with("hello "));
        assert!(mixed.ends_with(" world"));
        assert_eq!("hello ☺ world", ew_decode_unstructured(&mixed));
    }

    #[test]
    fn encoded_words_respect_length_limit() {
        let long = "żółć gęślą jaźń ".repeat(20);
        let encoded = ew_encode(long.trim());
        for word in encoded.split(' ') {
            assert!(word.len() <= 76, "word too long: {}", word.len());
        }
        assert_eq!(long.trim(), ew_decode_unstructured(&encoded));
    }

    proptest! {
        #[test]
        fn ew_decode_never_panics(s in r"=\?(.*|us-ascii)\?(.*|q|b)\?.*\?=") {
            ew_decode(&s);
        }

        #[test]
        fn encode_decode_round_trip(s in "[a-zA-Zà-üα-ω ]{0,60}") {
            let trimmed = s.trim();
            prop_assume!(!trimmed.contains("  "));
            let encoded = encode_unstructured(trimmed);
            let decoded = ew_decode_unstructured(&encoded);
            prop_assert_eq!(
                trimmed,
                decoded.as_ref()
            );
        }
    }
}
