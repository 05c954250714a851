use std::str::FromStr;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyEncoding {
    #[default]
    Auto,
    Utf8,
    Latin1,
    Windows1252,
}

impl LegacyEncoding {
    pub fn name(self) -> &'static str {
        match self {
            LegacyEncoding::Auto => "auto",
            LegacyEncoding::Utf8 => "utf-8",
            LegacyEncoding::Latin1 => "iso-8859-1",
            LegacyEncoding::Windows1252 => "windows-1252",
        }
    }
}

impl FromStr for LegacyEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "auto" => Ok(LegacyEncoding::Auto),
            "utf8" | "utf-8" => Ok(LegacyEncoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Ok(LegacyEncoding::Latin1),
            "windows1252" | "windows-1252" | "cp1252" => Ok(LegacyEncoding::Windows1252),
            other => Err(format!("unsupported encoding '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decoded {
    pub text: String,
    pub encoding: LegacyEncoding,
    /// Count of mojibake markers found after decoding.
    pub suspicious: usize,
}

// 0x80..=0x9F in Windows-1252; None marks the five undefined slots.
const CP1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'),
    None,
    Some('\u{201A}'),
    Some('\u{0192}'),
    Some('\u{201E}'),
    Some('\u{2026}'),
    Some('\u{2020}'),
    Some('\u{2021}'),
    Some('\u{02C6}'),
    Some('\u{2030}'),
    Some('\u{0160}'),
    Some('\u{2039}'),
    Some('\u{0152}'),
    None,
    Some('\u{017D}'),
    None,
    None,
    Some('\u{2018}'),
    Some('\u{2019}'),
    Some('\u{201C}'),
    Some('\u{201D}'),
    Some('\u{2022}'),
    Some('\u{2013}'),
    Some('\u{2014}'),
    Some('\u{02DC}'),
    Some('\u{2122}'),
    Some('\u{0161}'),
    Some('\u{203A}'),
    Some('\u{0153}'),
    None,
    Some('\u{017E}'),
    Some('\u{0178}'),
];

pub fn decode(bytes: &[u8], requested: LegacyEncoding) -> Decoded {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);

    let encoding = match requested {
        LegacyEncoding::Auto => {
            if std::str::from_utf8(bytes).is_ok() {
                LegacyEncoding::Utf8
            } else {
                LegacyEncoding::Windows1252
            }
        }
        other => other,
    };

    let text = match encoding {
        LegacyEncoding::Utf8 | LegacyEncoding::Auto => String::from_utf8_lossy(bytes).into_owned(),
        LegacyEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        LegacyEncoding::Windows1252 => bytes
            .iter()
            .map(|&b| match b {
                0x80..=0x9F => CP1252_HIGH[(b - 0x80) as usize].unwrap_or(b as char),
                _ => b as char,
            })
            .collect(),
    };

    let suspicious = count_mojibake(&text);
    Decoded {
        text,
        encoding,
        suspicious,
    }
}

/// UTF-8 read as a single-byte encoding shows up as 'Ã' or 'Â' followed by a
/// character in U+0080..U+00BF; failed UTF-8 shows up as U+FFFD.
pub fn count_mojibake(text: &str) -> usize {
    let mut hits = 0;
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if c == '\u{FFFD}' {
            hits += 1;
        } else if matches!(prev, Some('Ã') | Some('Â')) && ('\u{80}'..='\u{BF}').contains(&c) {
            hits += 1;
        }
        prev = Some(c);
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_detects_utf8() {
        let decoded = decode("João;Conceição".as_bytes(), LegacyEncoding::Auto);
        assert_eq!(decoded.encoding, LegacyEncoding::Utf8);
        assert_eq!(decoded.text, "João;Conceição");
        assert_eq!(decoded.suspicious, 0);
    }

    #[test]
    fn auto_falls_back_to_windows_1252() {
        // 0xE3 alone is not valid UTF-8.
        let bytes = [b'J', b'o', 0xE3, b'o', b' ', 0x96, b' ', b'A'];
        let decoded = decode(&bytes, LegacyEncoding::Auto);
        assert_eq!(decoded.encoding, LegacyEncoding::Windows1252);
        assert_eq!(decoded.text, "João – A");
    }

    #[test]
    fn strips_utf8_bom() {
        let decoded = decode(b"\xEF\xBB\xBFCODIGO;NOME", LegacyEncoding::Auto);
        assert_eq!(decoded.text, "CODIGO;NOME");
    }

    #[test]
    fn explicit_latin1_on_utf8_input_is_flagged() {
        let decoded = decode("Conceição".as_bytes(), LegacyEncoding::Latin1);
        assert!(decoded.suspicious >= 2, "got {}", decoded.suspicious);
    }

    #[test]
    fn parses_encoding_names() {
        assert_eq!("cp1252".parse::<LegacyEncoding>(), Ok(LegacyEncoding::Windows1252));
        assert_eq!("ISO-8859-1".parse::<LegacyEncoding>(), Ok(LegacyEncoding::Latin1));
        assert!("ebcdic".parse::<LegacyEncoding>().is_err());
    }
}
