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

//! Bidirectional octet/Unicode codecs.
//!
//! A codec's only state is its validity flag: a failed conversion leaves it
//! usable but invalid, so callers can fall back (typically to us-ascii)
//! without special-case plumbing. us-ascii, iso-8859-1 and utf-8 are
//! implemented directly; every other charset label goes through encoding_rs.
//! Note that the WHATWG tables treat the iso-8859-1 label as windows-1252,
//! which is wrong for mail, hence the direct implementation.

use encoding_rs::Encoding;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Imp {
    Ascii,
    Latin1,
    Utf8,
    Other(&'static Encoding),
}

#[derive(Clone, Debug)]
pub struct Codec {
    imp: Imp,
    valid: bool,
    error: Option<String>,
}

impl Codec {
    pub fn ascii() -> Self {
        Codec::of(Imp::Ascii)
    }

    pub fn latin1() -> Self {
        Codec::of(Imp::Latin1)
    }

    pub fn utf8() -> Self {
        Codec::of(Imp::Utf8)
    }

    fn of(imp: Imp) -> Self {
        Codec {
            imp,
            valid: true,
            error: None,
        }
    }

    /// Maps a charset label to a codec, after alias normalisation.
    pub fn by_name(label: &str) -> Option<Codec> {
        let norm = label
            .trim()
            .trim_matches('"')
            // RFC 2184 permits a language suffix; nothing to do with it.
            .split('*')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        match norm.as_str() {
            "" => None,
            "us-ascii" | "ascii" | "ansi_x3.4-1968" | "iso646-us" => {
                Some(Codec::ascii())
            },
            "iso-8859-1" | "iso8859-1" | "iso_8859-1" | "latin1"
            | "latin-1" | "cp819" => Some(Codec::latin1()),
            "utf-8" | "utf8" => Some(Codec::utf8()),
            _ => Encoding::for_label_no_replacement(norm.as_bytes())
                .map(|e| Codec::of(Imp::Other(e))),
        }
    }

    /// Picks the cheapest codec able to encode `s` without loss.
    pub fn by_string(s: &str) -> Codec {
        if s.bytes().all(|b| b < 0x80) {
            Codec::ascii()
        } else if s.chars().all(|c| (c as u32) < 0x100) {
            Codec::latin1()
        } else {
            Codec::utf8()
        }
    }

    pub fn name(&self) -> &'static str {
        match self.imp {
            Imp::Ascii => "us-ascii",
            Imp::Latin1 => "iso-8859-1",
            Imp::Utf8 => "utf-8",
            Imp::Other(e) => e.name(),
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn reset(&mut self) {
        self.valid = true;
        self.error = None;
    }

    fn record_error(&mut self, what: &str) {
        self.valid = false;
        if self.error.is_none() {
            self.error = Some(format!("{} in {}", what, self.name()));
        }
    }

    /// Converts octets to Unicode.
    ///
    /// Undecodable bytes become U+FFFD and mark the codec invalid, but the
    /// rest of the input still converts.
    pub fn to_unicode(&mut self, bytes: &[u8]) -> String {
        match self.imp {
            Imp::Ascii => bytes
                .iter()
                .map(|&b| {
                    if b < 0x80 {
                        b as char
                    } else {
                        self.valid = false;
                        self.error.get_or_insert_with(|| {
                            "8-bit byte in us-ascii".to_owned()
                        });
                        '\u{FFFD}'
                    }
                })
                .collect(),
            Imp::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Imp::Utf8 => match std::str::from_utf8(bytes) {
                Ok(s) => s.to_owned(),
                Err(_) => {
                    self.record_error("malformed sequence");
                    String::from_utf8_lossy(bytes).into_owned()
                },
            },
            Imp::Other(e) => {
                let (out, _, had_errors) = e.decode(bytes);
                if had_errors {
                    self.record_error("malformed sequence");
                }
                out.into_owned()
            },
        }
    }

    /// Converts Unicode to octets.
    ///
    /// Unmappable characters become `?` and mark the codec invalid.
    pub fn from_unicode(&mut self, s: &str) -> Vec<u8> {
        match self.imp {
            Imp::Ascii => s
                .chars()
                .map(|c| {
                    if (c as u32) < 0x80 {
                        c as u8
                    } else {
                        self.valid = false;
                        self.error.get_or_insert_with(|| {
                            "unmappable character in us-ascii".to_owned()
                        });
                        b'?'
                    }
                })
                .collect(),
            Imp::Latin1 => s
                .chars()
                .map(|c| {
                    if (c as u32) < 0x100 {
                        c as u8
                    } else {
                        self.valid = false;
                        self.error.get_or_insert_with(|| {
                            "unmappable character in iso-8859-1".to_owned()
                        });
                        b'?'
                    }
                })
                .collect(),
            Imp::Utf8 => s.as_bytes().to_vec(),
            Imp::Other(e) => {
                let (out, _, had_errors) = e.encode(s);
                if had_errors {
                    self.record_error("unmappable character");
                }
                out.into_owned()
            },
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn by_name_aliases() {
        assert_eq!("us-ascii", Codec::by_name("US-ASCII").unwrap().name());
        assert_eq!("us-ascii", Codec::by_name(" ascii ").unwrap().name());
        assert_eq!(
            "iso-8859-1",
            Codec::by_name("Latin1").unwrap().name()
        );
        assert_eq!("utf-8", Codec::by_name("UTF-8").unwrap().name());
        assert_eq!("utf-8", Codec::by_name("\"utf-8\"").unwrap().name());
        assert_eq!(
            "us-ascii",
            Codec::by_name("US-ASCII*EN").unwrap().name()
        );
        assert_eq!("GBK", Codec::by_name("gb2312").unwrap().name());
        assert!(Codec::by_name("no-such-charset").is_none());
        assert!(Codec::by_name("").is_none());
    }

    #[test]
    fn by_string_picks_cheapest() {
        assert_eq!("us-ascii", Codec::by_string("hello").name());
        assert_eq!("iso-8859-1", Codec::by_string("héllo").name());
        assert_eq!("utf-8", Codec::by_string("héllo ☺").name());
    }

    #[test]
    fn invalid_input_marks_codec_but_output_continues() {
        let mut c = Codec::ascii();
        let s = c.to_unicode(b"ok\xffstill ok");
        assert!(!c.valid());
        assert!(c.error().is_some());
        assert!(s.starts_with("ok"));
        assert!(s.ends_with("still ok"));

        c.reset();
        assert!(c.valid());
    }

    #[test]
    fn latin1_round_trip() {
        let mut c = Codec::latin1();
        let s = c.to_unicode(b"caf\xe9");
        assert_eq!("café", s);
        assert_eq!(b"caf\xe9".to_vec(), c.from_unicode(&s));
        assert!(c.valid());
    }

    proptest! {
        #[test]
        fn ascii_round_trip(s in "[ -~]*") {
            let mut c = Codec::ascii();
            let u = c.to_unicode(s.as_bytes());
            prop_assert!(c.valid());
            prop_assert_eq!(s.as_bytes().to_vec(), c.from_unicode(&u));
        }

        #[test]
        fn utf8_round_trip(s in ".*") {
            let mut c = Codec::utf8();
            let b = c.from_unicode(&s);
            prop_assert!(c.valid());
            prop_assert_eq!(s, c.to_unicode(&b));
        }
    }
}
