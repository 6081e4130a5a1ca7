//! Link visiting
//!
//! Every URL-bearing location of a parsed file is reached through
//! [visit_links], which dispatches on the kind of document. Rewriting and
//! iterating links are both built on top of the same visitor: the visitor
//! receives each URL and returns `Some(new_url)` to replace it.

use crate::{
    container::ParsedItem,
    css::{css_urls, rewrite_css_urls},
    types::{LinkLocation, NCX_MIME, OPF_MIME},
    xml::{XmlElement, XmlNode},
};

/// The visitor applied to every URL, returning a replacement or `None`
pub type LinkVisitor<'a> = dyn FnMut(&str) -> Option<String> + 'a;

#[derive(Debug, Clone, Copy, PartialEq)]
enum TreeKind {
    Package,
    Ncx,
    Content,
}

/// Visits every link of a parsed file
///
/// ## Parameters
/// - `item`: The parsed file
/// - `media_type`: The media type of the file, selecting the link locations
/// - `visitor`: Called with every URL; a returned value that differs from the URL replaces it
///
/// ## Return
/// The number of URLs that were replaced.
pub fn visit_links(item: &mut ParsedItem, media_type: &str, visitor: &mut LinkVisitor) -> usize {
    match item {
        ParsedItem::Css(sheet) => sheet.rewrite_urls(visitor),
        ParsedItem::Html(document) => visit_element(&mut document.root, TreeKind::Content, visitor),
        ParsedItem::Xml(document) => {
            let kind = match media_type {
                OPF_MIME => TreeKind::Package,
                NCX_MIME => TreeKind::Ncx,
                _ => TreeKind::Content,
            };
            visit_element(&mut document.root, kind, visitor)
        }
    }
}

/// Lists the links of a parsed file in document order
///
/// Stylesheets report exact lines and offsets; tree based documents report `0`.
pub fn collect_links(item: &mut ParsedItem, media_type: &str) -> Vec<LinkLocation> {
    if let ParsedItem::Css(sheet) = item {
        return css_urls(&sheet.text)
            .into_iter()
            .map(|url| LinkLocation {
                url: url.url,
                line: url.line,
                offset: url.offset,
            })
            .collect();
    }

    let mut links = Vec::new();
    visit_links(item, media_type, &mut |url| {
        links.push(LinkLocation {
            url: url.to_string(),
            line: 0,
            offset: 0,
        });
        None
    });
    links
}

fn visit_element(element: &mut XmlElement, kind: TreeKind, visitor: &mut LinkVisitor) -> usize {
    let mut count = 0;
    let local_name = element.local_name().to_ascii_lowercase();

    let keys = element
        .attributes
        .keys()
        .filter(|key| is_link_attribute(kind, &local_name, key))
        .cloned()
        .collect::<Vec<_>>();

    for key in keys {
        let Some(value) = element.attributes.get_mut(&key) else {
            continue;
        };
        if let Some(new_value) = visitor(value) {
            if new_value != *value {
                *value = new_value;
                count += 1;
            }
        }
    }

    if kind == TreeKind::Content {
        if let Some(style) = element.attributes.get_mut("style") {
            let (text, replaced) = rewrite_css_urls(style, visitor);
            if replaced > 0 {
                *style = text;
                count += replaced;
            }
        }

        if local_name == "style" {
            for child in &mut element.children {
                if let XmlNode::Text(text) | XmlNode::CData(text) = child {
                    let (new_text, replaced) = rewrite_css_urls(text, visitor);
                    if replaced > 0 {
                        *text = new_text;
                        count += replaced;
                    }
                }
            }
        }
    }

    for child in element.elements_mut() {
        count += visit_element(child, kind, visitor);
    }
    count
}

fn is_link_attribute(kind: TreeKind, element: &str, key: &str) -> bool {
    match kind {
        TreeKind::Package => matches!(key, "href" | "src"),
        TreeKind::Ncx => key == "src",
        TreeKind::Content => {
            if key.ends_with(":href") && !key.starts_with("xmlns") {
                return true;
            }
            match key {
                "href" => matches!(element, "a" | "area" | "link" | "image" | "use"),
                "src" => matches!(
                    element,
                    "img"
                        | "script"
                        | "iframe"
                        | "embed"
                        | "audio"
                        | "video"
                        | "source"
                        | "track"
                        | "frame"
                        | "input"
                        | "text"
                ),
                "poster" => element == "video",
                "data" => element == "object",
                "cite" => matches!(element, "blockquote" | "q" | "ins" | "del"),
                "background" => element == "body",
                _ => false,
            }
        }
    }
}
