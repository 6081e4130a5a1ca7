use std::borrow::Cow;

use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE, WINDOWS_1252};
use infer::Infer;
use unicode_normalization::UnicodeNormalization;

use crate::names::basename;
use crate::types::{
    CSS_MIME, HTML_MIME, NCX_MIME, OCTET_STREAM_MIME, OPF_MIME, SVG_MIME, XHTML_MIME,
};

/// Text decoded from raw bytes, together with the encoding that won
#[derive(Debug)]
pub struct DecodedText {
    pub text: String,
    pub encoding: &'static Encoding,
}

/// Provides functionality to decode byte data into strings
///
/// Raw bytes read from a book are decoded with the following chain,
/// the first step that succeeds wins:
///
/// 1. A byte order mark (UTF-8, UTF-16 LE/BE, UTF-32 LE/BE) is detected and stripped.
/// 2. The bytes are tried as UTF-8.
/// 3. An encoding declared in the document itself (XML declaration,
///    `<meta charset>` or CSS `@charset`) is used.
/// 4. Windows-1252, which can decode any byte sequence.
///
/// ## Notes
/// - UTF-32 is not known to `encoding_rs`, it is decoded by hand and
///   reported as UTF-8, the encoding it is written back with.
pub trait DecodeBytes {
    fn decode(&self) -> DecodedText;
}

impl DecodeBytes for [u8] {
    fn decode(&self) -> DecodedText {
        match self {
            // UTF-32 must be checked before UTF-16, the LE marks share a prefix
            [0xFF, 0xFE, 0x00, 0x00, rest @ ..] => DecodedText {
                text: decode_utf32(rest, u32::from_le_bytes),
                encoding: UTF_8,
            },
            [0x00, 0x00, 0xFE, 0xFF, rest @ ..] => DecodedText {
                text: decode_utf32(rest, u32::from_be_bytes),
                encoding: UTF_8,
            },
            [0xEF, 0xBB, 0xBF, rest @ ..] => DecodedText {
                text: String::from_utf8_lossy(rest).into_owned(),
                encoding: UTF_8,
            },
            [0xFE, 0xFF, rest @ ..] => DecodedText {
                text: UTF_16BE.decode_without_bom_handling(rest).0.into_owned(),
                encoding: UTF_16BE,
            },
            [0xFF, 0xFE, rest @ ..] => DecodedText {
                text: UTF_16LE.decode_without_bom_handling(rest).0.into_owned(),
                encoding: UTF_16LE,
            },
            _ => {
                if let Ok(text) = std::str::from_utf8(self) {
                    return DecodedText {
                        text: text.to_string(),
                        encoding: UTF_8,
                    };
                }

                let encoding = declared_encoding(self)
                    .filter(|encoding| *encoding != UTF_8)
                    .unwrap_or(WINDOWS_1252);
                let (text, _) = encoding.decode_without_bom_handling(self);
                DecodedText {
                    text: text.into_owned(),
                    encoding,
                }
            }
        }
    }
}

impl DecodeBytes for Vec<u8> {
    fn decode(&self) -> DecodedText {
        self.as_slice().decode()
    }
}

fn decode_utf32(bytes: &[u8], to_u32: fn([u8; 4]) -> u32) -> String {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            char::from_u32(to_u32([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .unwrap_or(char::REPLACEMENT_CHARACTER)
        })
        .collect()
}

/// Looks for an encoding declared inside the first kilobyte of a document
///
/// Recognizes `encoding="…"` in an XML declaration, `charset=…` in an
/// HTML `<meta>` element and `@charset "…"` in a stylesheet.
fn declared_encoding(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(1024)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();

    for marker in ["encoding=", "charset=", "@charset "] {
        let Some(position) = head.find(marker) else {
            continue;
        };

        let label = head[position + marker.len()..]
            .trim_start_matches(['"', '\'', ' '])
            .split(|c: char| c == '"' || c == '\'' || c == ';' || c == '>' || c.is_whitespace())
            .next()
            .unwrap_or_default();

        if let Some(encoding) = Encoding::for_label(label.as_bytes()) {
            return Some(encoding);
        }
    }

    None
}

/// Normalizes decoded text before it is handed to a parser or a caller
///
/// Line endings are folded to LF; the text is optionally normalized to NFC.
pub fn normalize_text(text: &str, normalize_nfc: bool) -> String {
    let text = if text.contains('\r') {
        Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(text)
    };

    if normalize_nfc {
        text.nfc().collect()
    } else {
        text.into_owned()
    }
}

/// Provides functionality for normalizing whitespace characters
///
/// This trait normalizes various sequences of whitespace characters
/// (including spaces, tabs, newlines, etc.) in a string into a single
/// whitespace character, removing leading and trailing whitespace characters.
pub trait NormalizeWhitespace {
    fn normalize_whitespace(&self) -> String;
}

impl NormalizeWhitespace for &str {
    fn normalize_whitespace(&self) -> String {
        self.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl NormalizeWhitespace for String {
    fn normalize_whitespace(&self) -> String {
        self.as_str().normalize_whitespace()
    }
}

/// Guesses a media type from the extension of a name
pub fn guess_media_type(name: &str) -> Option<&'static str> {
    let extension = basename(name).rsplit_once('.')?.1.to_ascii_lowercase();

    let media_type = match extension.as_str() {
        "xhtml" | "xht" => XHTML_MIME,
        "html" | "htm" => HTML_MIME,
        "css" => CSS_MIME,
        "opf" => OPF_MIME,
        "ncx" => NCX_MIME,
        "svg" => SVG_MIME,
        "xml" => "application/xml",
        "smil" => "application/smil+xml",
        "pls" => "application/pls+xml",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "otf" => "font/otf",
        "ttf" => "font/ttf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "mp3" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "ogg" => "audio/ogg",
        "m4v" => "video/mp4",
        "webm" => "video/webm",
        _ => return None,
    };

    Some(media_type)
}

/// Determines the media type of a file from its name and, failing that, its content
///
/// The extension is consulted first; content sniffing with `infer` is used
/// for files with unknown extensions, and `application/octet-stream` is the
/// final fallback.
pub fn media_type_for(name: &str, data: Option<&[u8]>) -> String {
    if let Some(media_type) = guess_media_type(name) {
        return media_type.to_string();
    }

    let extension = basename(name)
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .unwrap_or_default();

    data.and_then(|data| Infer::new().get(data))
        .map(|kind| refine_media_type(kind.mime_type(), &extension))
        .unwrap_or_else(|| OCTET_STREAM_MIME.to_string())
}

/// Refine the media type
///
/// Optimize media types inferred from file content based on file extensions
fn refine_media_type(infer_mime: &str, extension: &str) -> String {
    match (infer_mime, extension) {
        ("text/xml", "xhtml") | ("application/xml", "xhtml") => XHTML_MIME.to_string(),
        ("text/xml", "opf") | ("application/xml", "opf") => OPF_MIME.to_string(),
        ("text/xml", "ncx") | ("application/xml", "ncx") => NCX_MIME.to_string(),
        ("text/plain", "css") => CSS_MIME.to_string(),

        _ => infer_mime.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use encoding_rs::{UTF_8, UTF_16BE, UTF_16LE, WINDOWS_1252};

    use crate::utils::{DecodeBytes, NormalizeWhitespace, media_type_for, normalize_text};

    /// Testing text decoding with UTF-8 BOM
    #[test]
    fn test_decode_utf8_with_bom() {
        let data: Vec<u8> = vec![0xEF, 0xBB, 0xBF, b'H', b'e', b'l', b'l', b'o'];
        let result = data.decode();
        assert_eq!(result.text, "Hello");
        assert_eq!(result.encoding, UTF_8);
    }

    /// Test text decoding with UTF-16 BE BOM
    #[test]
    fn test_decode_utf16_be_with_bom() {
        let data = vec![
            0xFE, 0xFF, // BOM
            0x00, b'H', // H
            0x00, b'e', // e
            0x00, b'l', // l
            0x00, b'l', // l
            0x00, b'o', // o
        ];
        let result = data.decode();
        assert_eq!(result.text, "Hello");
        assert_eq!(result.encoding, UTF_16BE);
    }

    /// Testing text decoding with UTF-16 LE BOM
    #[test]
    fn test_decode_utf16_le_with_bom() {
        let data = vec![
            0xFF, 0xFE, // BOM
            b'H', 0x00, // H
            b'e', 0x00, // e
            b'l', 0x00, // l
            b'l', 0x00, // l
            b'o', 0x00, // o
        ];
        let result = data.decode();
        assert_eq!(result.text, "Hello");
        assert_eq!(result.encoding, UTF_16LE);
    }

    /// Testing text decoding with UTF-32 LE BOM
    #[test]
    fn test_decode_utf32_le_with_bom() {
        let mut data = vec![0xFF, 0xFE, 0x00, 0x00];
        for c in "Hé".chars() {
            data.extend_from_slice(&(c as u32).to_le_bytes());
        }
        assert_eq!(data.decode().text, "Hé");
    }

    /// Testing ordinary UTF-8 text (without BOM)
    #[test]
    fn test_decode_plain_utf8() {
        let data = "Grüße".as_bytes().to_vec();
        let result = data.decode();
        assert_eq!(result.text, "Grüße");
        assert_eq!(result.encoding, UTF_8);
    }

    /// Bytes that are not UTF-8 use the declared encoding, or Windows-1252
    #[test]
    fn test_decode_declared_and_fallback() {
        let declared = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><a>\xE9</a>".to_vec();
        let result = declared.decode();
        assert_eq!(result.text, "<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><a>é</a>");
        assert_eq!(result.encoding, WINDOWS_1252);

        let undeclared = b"caf\xE9 \x93quoted\x94".to_vec();
        assert_eq!(undeclared.decode().text, "café \u{201C}quoted\u{201D}");
    }

    /// Line endings are folded and text is composed
    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("a\r\nb\rc\n", false), "a\nb\nc\n");
        assert_eq!(normalize_text("Cafe\u{301}", true), "Café");
        assert_eq!(normalize_text("Cafe\u{301}", false), "Cafe\u{301}");
    }

    /// Test text standardization containing various whitespace characters
    #[test]
    fn test_normalize_whitespace_trait() {
        let text = "  Hello,\tWorld!\n\nRust  ";
        assert_eq!(text.normalize_whitespace(), "Hello, World! Rust");

        let text_string = String::from("  Hello,\tWorld!\n\nRust  ");
        assert_eq!(text_string.normalize_whitespace(), "Hello, World! Rust");
    }

    /// Media types come from the extension, then the content
    #[test]
    fn test_media_type_for() {
        assert_eq!(media_type_for("OEBPS/a.XHTML", None), "application/xhtml+xml");
        assert_eq!(media_type_for("OEBPS/a.css", None), "text/css");
        assert_eq!(
            media_type_for("OEBPS/image", Some(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR")),
            "image/png"
        );
        assert_eq!(media_type_for("OEBPS/blob", Some(b"\0\x01")), "application/octet-stream");
    }
}
