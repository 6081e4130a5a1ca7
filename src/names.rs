//! Canonical names, filesystem paths and hrefs
//!
//! Every file inside a book is identified by its *canonical name*: an NFC
//! normalized, `/`-separated path relative to the book root that never starts
//! with `/` and never contains `..`. Filesystem paths and the percent-encoded
//! hrefs found in documents are converted to and from canonical names here.

use std::path::{Component, Path, PathBuf};

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use unicode_normalization::UnicodeNormalization;

/// Characters that must be escaped when a canonical name is written as an href
const HREF_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'\\')
    .add(b'^')
    .add(b'|')
    .add(b'[')
    .add(b']');

/// Returns the NFC normalized form of a string
pub fn nfc(value: &str) -> String {
    value.nfc().collect()
}

/// Converts a canonical name into an absolute filesystem path under `root`
///
/// ## Parameters
/// - `name`: The canonical name of the file
/// - `root`: The directory the book is unpacked into
pub fn name_to_path(name: &str, root: &Path) -> PathBuf {
    name.split('/')
        .filter(|segment| !segment.is_empty())
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

/// Converts a filesystem path under `root` into a canonical name
///
/// The relative path is joined with `/` and normalized to NFC, so that
/// names read back from filesystems which decompose Unicode (HFS+) still
/// compare equal to the names listed in the manifest.
pub fn path_to_name(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let segments = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>();

    nfc(&segments.join("/"))
}

/// Returns the directory part of a canonical name, without the trailing slash
pub fn dirname(name: &str) -> &str {
    match name.rfind('/') {
        Some(index) => &name[..index],
        None => "",
    }
}

/// Returns the last segment of a canonical name
pub fn basename(name: &str) -> &str {
    match name.rfind('/') {
        Some(index) => &name[index + 1..],
        None => name,
    }
}

/// Checks that a string is usable as a canonical name
///
/// A valid name is non-empty, relative, `/`-separated and contains
/// no empty, `.` or `..` segments.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('\\')
        && name
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Joins a relative path onto a directory and resolves `.` and `..` segments
///
/// Returns `None` when the result would escape the book root.
pub(crate) fn join_and_normalize(base_dir: &str, relative: &str) -> Option<String> {
    let mut segments: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();

    for segment in relative.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// Splits an href into its path and the `?query#fragment` suffix
pub fn split_href(href: &str) -> (&str, &str) {
    match href.find(['#', '?']) {
        Some(index) => (&href[..index], &href[index..]),
        None => (href, ""),
    }
}

/// Returns the URL scheme of an href, if it has one
fn url_scheme(href: &str) -> Option<&str> {
    let colon = href.find(':')?;
    let scheme = &href[..colon];
    let mut chars = scheme.chars();
    let first = chars.next()?;

    if first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
    {
        Some(scheme)
    } else {
        None
    }
}

/// Resolves an href found in a document into a canonical name
///
/// The href is stripped of its query and fragment, percent-decoded and
/// joined against the directory of `base_name` (or the book root when
/// `base_name` is `None`). A leading `/` makes the href root-relative.
///
/// ## Return
/// - `Some(String)`: The canonical name the href points to
/// - `None`: The href is external (has a scheme other than `file`), empty,
///   malformed, or escapes the book root
pub fn href_to_name(href: &str, base_name: Option<&str>) -> Option<String> {
    let href = href.trim();
    let (path, _) = split_href(href);

    let path = match url_scheme(path) {
        Some(scheme) if scheme.eq_ignore_ascii_case("file") => {
            let rest = &path[scheme.len() + 1..];
            rest.strip_prefix("//").unwrap_or(rest)
        }
        Some(_) => return None,
        None => path,
    };

    if path.is_empty() {
        return None;
    }

    let decoded = percent_decode_str(path).decode_utf8().ok()?;
    if cfg!(windows) && decoded.contains(':') {
        return None;
    }

    let base_dir = match (decoded.starts_with('/'), base_name) {
        (true, _) | (false, None) => "",
        (false, Some(base)) => dirname(base),
    };

    join_and_normalize(base_dir, &decoded).map(|name| nfc(&name))
}

/// Computes the percent-encoded href of `name` relative to `base_name`
///
/// When `base_name` is `None` the href is relative to the book root.
pub fn name_to_href(name: &str, base_name: Option<&str>) -> String {
    let base_dir = base_name.map(dirname).unwrap_or("");
    let relative = relative_path(name, base_dir);
    utf8_percent_encode(&relative, HREF_ESCAPE).to_string()
}

/// Computes the `/`-separated path of `name` relative to the directory `base_dir`
fn relative_path(name: &str, base_dir: &str) -> String {
    let target: Vec<&str> = name.split('/').collect();
    let base: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();

    // the last segment of the target is the file itself and never part of the common prefix
    let common = target[..target.len() - 1]
        .iter()
        .zip(base.iter())
        .take_while(|(left, right)| left == right)
        .count();

    let mut parts = vec![".."; base.len() - common];
    parts.extend_from_slice(&target[common..]);
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::names::{
        basename, dirname, href_to_name, is_valid_name, name_to_href, name_to_path, nfc,
        path_to_name, split_href,
    };

    /// Names survive a round trip through filesystem paths
    #[test]
    fn test_name_path_round_trip() {
        let root = Path::new("/tmp/book-root");
        for name in ["mimetype", "OEBPS/content.opf", "OEBPS/Text/chapter one.xhtml"] {
            let path = name_to_path(name, root);
            assert!(path.starts_with(root));
            assert_eq!(path_to_name(&path, root), name);
        }
    }

    /// Decomposed filenames are folded into NFC names
    #[test]
    fn test_path_to_name_nfc() {
        let root = Path::new("/tmp/book-root");
        let decomposed = "OEBPS/Cafe\u{301}.xhtml";
        let path = name_to_path(decomposed, root);
        assert_eq!(path_to_name(&path, root), "OEBPS/Café.xhtml");
        assert_eq!(nfc(decomposed), "OEBPS/Café.xhtml");
    }

    /// Relative hrefs resolve against the directory of the base name
    #[test]
    fn test_href_to_name_relative() {
        let base = Some("OEBPS/Text/ch1.xhtml");
        assert_eq!(
            href_to_name("ch2.xhtml#p3", base).as_deref(),
            Some("OEBPS/Text/ch2.xhtml")
        );
        assert_eq!(
            href_to_name("../Images/cover.jpg", base).as_deref(),
            Some("OEBPS/Images/cover.jpg")
        );
        assert_eq!(
            href_to_name("./../Styles/./a.css?v=1", base).as_deref(),
            Some("OEBPS/Styles/a.css")
        );
        assert_eq!(
            href_to_name("/OEBPS/x.xhtml", base).as_deref(),
            Some("OEBPS/x.xhtml")
        );
        assert_eq!(href_to_name("content.opf", None).as_deref(), Some("content.opf"));
    }

    /// External, empty and escaping hrefs are rejected
    #[test]
    fn test_href_to_name_rejects() {
        let base = Some("OEBPS/ch1.xhtml");
        assert_eq!(href_to_name("http://example.com/a.html", base), None);
        assert_eq!(href_to_name("mailto:someone@example.com", base), None);
        assert_eq!(href_to_name("#note-1", base), None);
        assert_eq!(href_to_name("", base), None);
        assert_eq!(href_to_name("../../etc/passwd", base), None);
        assert_eq!(
            href_to_name("file:///OEBPS/ch2.xhtml", base).as_deref(),
            Some("OEBPS/ch2.xhtml")
        );
    }

    /// Percent-encoded hrefs compare equal to their plain spelling
    #[test]
    fn test_percent_encoded_href() {
        let base = Some("OEBPS/content.opf");
        assert_eq!(
            href_to_name("Text/chapter%20one.xhtml", base),
            href_to_name("Text/chapter one.xhtml", base)
        );
        assert_eq!(
            href_to_name("Text/Cafe%CC%81.xhtml", base).as_deref(),
            Some("OEBPS/Text/Café.xhtml")
        );
    }

    /// Hrefs are relative to the base directory and escape reserved characters
    #[test]
    fn test_name_to_href() {
        assert_eq!(
            name_to_href("OEBPS/Text/ch2.xhtml", Some("OEBPS/Text/ch1.xhtml")),
            "ch2.xhtml"
        );
        assert_eq!(
            name_to_href("OEBPS/Images/a b.jpg", Some("OEBPS/Text/ch1.xhtml")),
            "../Images/a%20b.jpg"
        );
        assert_eq!(
            name_to_href("text/chap1.xhtml", Some("OEBPS/content.opf")),
            "../text/chap1.xhtml"
        );
        assert_eq!(name_to_href("OEBPS/100%.css", None), "OEBPS/100%25.css");
        assert_eq!(name_to_href("OEBPS/é.xhtml", Some("OEBPS/x.opf")), "%C3%A9.xhtml");
    }

    /// An href produced for a name resolves back to the same name
    #[test]
    fn test_href_round_trip() {
        let names = [
            "OEBPS/Text/chapter #1.xhtml",
            "images/a[1].png",
            "OEBPS/Text/Café.xhtml",
            "top.css",
        ];
        for base in ["OEBPS/content.opf", "a/b/c/d.xhtml", "root.xhtml"] {
            for name in names {
                let href = name_to_href(name, Some(base));
                assert_eq!(href_to_name(&href, Some(base)).as_deref(), Some(name));
            }
        }
    }

    #[test]
    fn test_name_helpers() {
        assert_eq!(dirname("OEBPS/Text/a.xhtml"), "OEBPS/Text");
        assert_eq!(dirname("mimetype"), "");
        assert_eq!(basename("OEBPS/Text/a.xhtml"), "a.xhtml");
        assert_eq!(split_href("a.xhtml#x"), ("a.xhtml", "#x"));
        assert!(is_valid_name("OEBPS/a.xhtml"));
        assert!(!is_valid_name("OEBPS/../a.xhtml"));
        assert!(!is_valid_name("/OEBPS/a.xhtml"));
        assert!(!is_valid_name(""));
    }
}
