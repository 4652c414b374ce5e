//! Text units in which operation lengths and document offsets are measured.
//!
//! Editors disagree on what "one character" is. A JavaScript editor counts
//! UTF-16 code units, so an astral character such as `😄` is two units wide;
//! most other clients count Unicode scalar values, where it is one. The
//! encoding is chosen once per server and every session and operation of that
//! server measures text the same way.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unit used for `base_len`, `target_len`, retain/delete counts and
/// selection offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    /// One unit per Unicode scalar value (code point).
    #[default]
    Utf8,
    /// One unit per UTF-16 code unit; astral characters count twice.
    Utf16,
}

impl TextEncoding {
    /// Length of `s` in this encoding's units.
    pub fn unit_len(self, s: &str) -> usize {
        match self {
            TextEncoding::Utf8 => s.chars().count(),
            TextEncoding::Utf16 => s.encode_utf16().count(),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextEncoding::Utf8 => write!(f, "utf8"),
            TextEncoding::Utf16 => write!(f, "utf16"),
        }
    }
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(TextEncoding::Utf8),
            "utf16" | "utf-16" => Ok(TextEncoding::Utf16),
            other => Err(format!("unknown text encoding '{other}' (expected utf8 or utf16)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_len_ascii() {
        assert_eq!(TextEncoding::Utf8.unit_len("hello"), 5);
        assert_eq!(TextEncoding::Utf16.unit_len("hello"), 5);
    }

    #[test]
    fn test_unit_len_bmp() {
        assert_eq!(TextEncoding::Utf8.unit_len("가나다"), 3);
        assert_eq!(TextEncoding::Utf16.unit_len("가나다"), 3);
    }

    #[test]
    fn test_unit_len_astral() {
        assert_eq!(TextEncoding::Utf8.unit_len("😄😃😀"), 3);
        assert_eq!(TextEncoding::Utf16.unit_len("😄😃😀"), 6);
    }

    #[test]
    fn test_parse() {
        assert_eq!("utf8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!("UTF-16".parse::<TextEncoding>().unwrap(), TextEncoding::Utf16);
        assert!("latin1".parse::<TextEncoding>().is_err());
    }

    #[test]
    fn test_default_is_utf8() {
        assert_eq!(TextEncoding::default(), TextEncoding::Utf8);
        assert_eq!(TextEncoding::Utf16.to_string(), "utf16");
    }
}
