//! Comparison of two containers
//!
//! Names are compared as sets and common names by their current bytes, so
//! pending edits of either side are taken into account without writing them.

use std::collections::BTreeSet;

use crate::{container::Container, error::EpubError, types::DiffReport};

/// Compares the current content of two containers
///
/// The report is empty when both hold the same names with the same bytes;
/// comparing `b` with `a` swaps `only_in_self` and `only_in_other`.
pub fn compare(left: &Container, right: &Container) -> Result<DiffReport, EpubError> {
    let left_names = left.names().collect::<BTreeSet<_>>();
    let right_names = right.names().collect::<BTreeSet<_>>();

    let mut report = DiffReport {
        only_in_self: left_names
            .difference(&right_names)
            .map(|name| name.to_string())
            .collect(),
        only_in_other: right_names
            .difference(&left_names)
            .map(|name| name.to_string())
            .collect(),
        ..Default::default()
    };

    for name in left_names.intersection(&right_names) {
        if left.current_bytes(name)? != right.current_bytes(name)? {
            report.changed.push(name.to_string());
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use crate::{container::Container, diff::compare};

    fn open_book(temp: &TempDir) -> Container {
        let dir = temp.path().join("book");
        fs::create_dir_all(dir.join("META-INF")).unwrap();
        fs::write(dir.join("mimetype"), "application/epub+zip").unwrap();
        fs::write(
            dir.join("META-INF/container.xml"),
            r#"<container><rootfiles><rootfile full-path="content.opf" media-type="application/oebps-package+xml"/></rootfiles></container>"#,
        )
        .unwrap();
        fs::write(
            dir.join("content.opf"),
            r#"<package xmlns="http://www.idpf.org/2007/opf" version="2.0"><metadata/><manifest><item id="a" href="a.css" media-type="text/css"/></manifest><spine/></package>"#,
        )
        .unwrap();
        fs::write(dir.join("a.css"), "p { color: red }").unwrap();
        Container::open(&dir).unwrap()
    }

    #[test]
    fn test_compare_reflexive_and_symmetric() {
        let temp = TempDir::new().unwrap();
        let mut original = open_book(&temp);
        let mut checkpoint = original.clone_to(temp.path().join("checkpoint")).unwrap();

        assert!(compare(&original, &original).unwrap().is_empty());
        assert!(compare(&original, &checkpoint).unwrap().is_empty());

        checkpoint.replace_raw("a.css", b"p { color: blue }").unwrap();
        checkpoint.add_file("b.css", b"", None, None, false).unwrap();
        original.remove_item("a.css", true).unwrap();

        let forward = compare(&original, &checkpoint).unwrap();
        let backward = compare(&checkpoint, &original).unwrap();
        assert_eq!(forward.only_in_other, vec!["a.css", "b.css"]);
        assert_eq!(forward.changed, vec!["content.opf"]);
        assert_eq!(forward.only_in_self, backward.only_in_other);
        assert_eq!(forward.only_in_other, backward.only_in_self);
        assert_eq!(forward.changed, backward.changed);
    }

    /// Pending tree edits count as changes without being written
    #[test]
    fn test_compare_sees_dirty_trees() {
        let temp = TempDir::new().unwrap();
        let mut original = open_book(&temp);
        let mut checkpoint = original.clone_to(temp.path().join("checkpoint")).unwrap();

        checkpoint
            .replace_links("a.css", |url| url.to_string())
            .unwrap();
        assert!(compare(&original, &checkpoint).unwrap().is_empty());

        let sheet = checkpoint.parsed("a.css").unwrap().as_stylesheet_mut().unwrap();
        sheet.text.push_str("\nem { color: green }");
        checkpoint.dirty("a.css").unwrap();

        assert_eq!(compare(&original, &checkpoint).unwrap().changed, vec!["a.css"]);
        assert!(checkpoint.is_dirty("a.css"));
        assert_eq!(fs::read(original.name_to_abspath("a.css").unwrap()).unwrap(), b"p { color: red }");
        original.commit(None).unwrap();
    }
}
