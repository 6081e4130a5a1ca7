//! Package document (OPF) access and editing
//!
//! The OPF stays a mutable [XmlDocument] in the container's parsed cache; the
//! functions here read and edit that tree directly. Hrefs in the package
//! document are relative to the OPF itself, so most functions take the OPF's
//! canonical name to resolve them.

use std::collections::{HashMap, HashSet};

use log::warn;

use crate::{
    names::href_to_name,
    types::{
        GuideReference, Identifier, ManifestItem, MetadataItem, MetadataRefinement, SpineItem,
    },
    utils::NormalizeWhitespace,
    xml::{XmlDocument, XmlElement},
};

pub const DC_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";
pub const OPF_NAMESPACE: &str = "http://www.idpf.org/2007/opf";

/// Returns a top-level section of the package (`metadata`, `manifest`, `spine`, `guide`)
pub fn section<'a>(opf: &'a XmlDocument, local_name: &str) -> Option<&'a XmlElement> {
    opf.root
        .find_child(local_name)
        .or_else(|| opf.root.find_elements_by_name(local_name).next())
}

/// Returns a top-level section of the package for editing
pub fn section_mut<'a>(opf: &'a mut XmlDocument, local_name: &str) -> Option<&'a mut XmlElement> {
    opf.root.find_child_mut(local_name)
}

/// The version declared by `<package version>`, `0.0` when missing or unparsable
pub fn version(opf: &XmlDocument) -> f64 {
    opf.root
        .get_attr("version")
        .and_then(|version| version.trim().parse::<f64>().ok())
        .filter(|version| version.is_finite() && *version >= 0.0)
        .unwrap_or(0.0)
}

/// Lists the manifest items in document order
pub fn manifest_items(opf: &XmlDocument, opf_name: &str) -> Vec<ManifestItem> {
    let Some(manifest) = section(opf, "manifest") else {
        return Vec::new();
    };

    manifest
        .elements()
        .filter(|element| element.local_name() == "item")
        .filter_map(|element| {
            let id = element.get_attr("id")?.to_string();
            let href = element.get_attr("href")?.to_string();
            let media_type = element
                .get_attr("media-type")
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            let properties = element
                .get_attr("properties")
                .map(|properties| properties.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();

            Some(ManifestItem {
                name: href_to_name(&href, Some(opf_name)),
                id,
                href,
                media_type,
                properties,
            })
        })
        .collect()
}

/// Lists the spine itemrefs in reading order
pub fn spine_items(opf: &XmlDocument, opf_name: &str) -> Vec<SpineItem> {
    let Some(spine) = section(opf, "spine") else {
        return Vec::new();
    };

    let names = manifest_items(opf, opf_name)
        .into_iter()
        .filter_map(|item| item.name.map(|name| (item.id, name)))
        .collect::<HashMap<_, _>>();

    spine
        .elements()
        .filter(|element| element.local_name() == "itemref")
        .filter_map(|element| {
            let idref = element.get_attr("idref")?.to_string();
            let linear = element
                .get_attr("linear")
                .map(|linear| linear.trim() != "no")
                .unwrap_or(true);

            Some(SpineItem {
                name: names.get(&idref).cloned(),
                idref,
                linear,
            })
        })
        .collect()
}

/// Lists the references of the legacy guide
pub fn guide_references(opf: &XmlDocument, opf_name: &str) -> Vec<GuideReference> {
    let Some(guide) = section(opf, "guide") else {
        return Vec::new();
    };

    guide
        .elements()
        .filter(|element| element.local_name() == "reference")
        .filter_map(|element| {
            let href = element.get_attr("href")?.to_string();
            Some(GuideReference {
                ref_type: element.get_attr("type").unwrap_or_default().to_string(),
                title: element.get_attr("title").map(str::to_string),
                name: href_to_name(&href, Some(opf_name)),
                href,
            })
        })
        .collect()
}

/// Collects the metadata of the package
///
/// Dublin Core elements, EPUB 2 `<meta name content>` pairs and EPUB 3
/// `<meta property>` elements are reported in document order. EPUB 3
/// `refines` metas are attached to the item they refine; for EPUB 2, extra
/// attributes of Dublin Core elements (`opf:role`, `opf:scheme`, ...) are the
/// refinements.
pub fn metadata_items(opf: &XmlDocument) -> Vec<MetadataItem> {
    let Some(metadata_element) = section(opf, "metadata") else {
        return Vec::new();
    };

    let mut metadata = Vec::new();
    let mut refinements = HashMap::<String, Vec<MetadataRefinement>>::new();

    for element in metadata_children(metadata_element) {
        if is_dublin_core(element) {
            parse_dc_metadata(element, &mut metadata);
        } else if element.local_name() == "meta" {
            parse_meta_element(element, &mut metadata, &mut refinements);
        }
    }

    for item in metadata.iter_mut() {
        if let Some(id) = &item.id {
            if let Some(refinements) = refinements.remove(id) {
                item.refined.extend(refinements);
            }
        }
    }

    metadata
}

/// Children of `<metadata>`, looking through the OPF 1.x `dc-metadata` and `x-metadata` wrappers
fn metadata_children(metadata: &XmlElement) -> Vec<&XmlElement> {
    let mut children = Vec::new();
    for element in metadata.elements() {
        match element.local_name() {
            "dc-metadata" | "x-metadata" => children.extend(element.elements()),
            _ => children.push(element),
        }
    }
    children
}

fn is_dublin_core(element: &XmlElement) -> bool {
    match &element.namespace {
        Some(namespace) => namespace.trim_end_matches('/') == DC_NAMESPACE.trim_end_matches('/'),
        None => element.prefix().is_some_and(|prefix| prefix.eq_ignore_ascii_case("dc")),
    }
}

fn parse_dc_metadata(element: &XmlElement, metadata: &mut Vec<MetadataItem>) {
    let id = element.get_attr("id").map(str::to_string);
    let lang = element
        .get_attr("xml:lang")
        .or_else(|| element.get_attr("lang"))
        .map(str::to_string);

    let refined = element
        .attributes
        .iter()
        .filter(|(name, _)| {
            !matches!(name.as_str(), "id" | "xml:lang" | "lang") && !name.starts_with("xmlns")
        })
        .map(|(name, value)| MetadataRefinement {
            property: local_part(name).to_string(),
            value: value.normalize_whitespace(),
        })
        .collect();

    metadata.push(MetadataItem {
        id,
        property: element.local_name().to_ascii_lowercase(),
        value: element.text().normalize_whitespace(),
        lang,
        refined,
    });
}

fn parse_meta_element(
    element: &XmlElement,
    metadata: &mut Vec<MetadataItem>,
    refinements: &mut HashMap<String, Vec<MetadataRefinement>>,
) {
    if let Some(property) = element.get_attr("property") {
        let value = element.text().normalize_whitespace();

        if let Some(refines) = element.get_attr("refines") {
            let id = refines.trim().trim_start_matches('#').to_string();
            refinements.entry(id).or_default().push(MetadataRefinement {
                property: property.to_string(),
                value,
            });
        } else {
            metadata.push(MetadataItem {
                id: element.get_attr("id").map(str::to_string),
                property: property.to_string(),
                value,
                lang: element.get_attr("xml:lang").map(str::to_string),
                refined: vec![],
            });
        }
        return;
    }

    if let (Some(name), Some(content)) = (element.get_attr("name"), element.get_attr("content")) {
        metadata.push(MetadataItem {
            id: element.get_attr("id").map(str::to_string),
            property: name.to_string(),
            value: content.normalize_whitespace(),
            lang: None,
            refined: vec![],
        });
    }
}

/// Lists the `<dc:identifier>` elements of the package in document order
pub fn identifiers(opf: &XmlDocument) -> Vec<Identifier> {
    let Some(metadata) = section(opf, "metadata") else {
        return Vec::new();
    };

    metadata_children(metadata)
        .into_iter()
        .filter(|element| is_dublin_core(element) && element.local_name() == "identifier")
        .map(|element| Identifier {
            id: element.get_attr("id").map(str::to_string),
            scheme: element.get_attr_local("scheme").map(str::to_string),
            value: element.text().trim().to_string(),
        })
        .collect()
}

/// The value of the identifier named by `<package unique-identifier>`
pub fn unique_identifier(opf: &XmlDocument) -> Option<String> {
    let id = opf.root.get_attr("unique-identifier")?.trim();
    identifiers(opf)
        .into_iter()
        .find(|identifier| identifier.id.as_deref() == Some(id))
        .map(|identifier| identifier.value)
}

/// Every `id` attribute used anywhere in the package document
pub fn all_ids(opf: &XmlDocument) -> HashSet<String> {
    let mut ids = HashSet::new();
    opf.root.walk(&mut |element| {
        if let Some(id) = element.get_attr("id") {
            ids.insert(id.to_string());
        }
    });
    ids
}

/// Generates an id that is not used yet, derived from `base`
///
/// The base is reduced to characters valid in an XML name; `base`, `base1`,
/// `base2`, ... are tried in turn.
pub fn generate_id(opf: &XmlDocument, base: &str) -> String {
    let mut id = base
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect::<String>();
    if !id.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        id.insert_str(0, "id");
    }

    let used = all_ids(opf);
    if !used.contains(&id) {
        return id;
    }

    (1..)
        .map(|counter| format!("{}{}", id, counter))
        .find(|candidate| !used.contains(candidate))
        .unwrap_or(id)
}

/// Returns the id of the manifest item whose href resolves to `name`
pub fn manifest_id_for(opf: &XmlDocument, opf_name: &str, name: &str) -> Option<String> {
    manifest_items(opf, opf_name)
        .into_iter()
        .find(|item| item.name.as_deref() == Some(name))
        .map(|item| item.id)
}

/// Appends an item to the manifest
///
/// Returns false when the package has no manifest.
pub fn add_manifest_item(opf: &mut XmlDocument, id: &str, href: &str, media_type: &str) -> bool {
    let Some(manifest) = section_mut(opf, "manifest") else {
        return false;
    };

    let item = XmlElement::new_like("item", manifest)
        .with_attr("id", id)
        .with_attr("href", href)
        .with_attr("media-type", media_type);
    manifest.push_element(item);
    true
}

/// Inserts an itemref into the spine, appending when `index` is `None` or past the end
///
/// Returns false when the package has no spine.
pub fn insert_spine_itemref(opf: &mut XmlDocument, idref: &str, index: Option<usize>) -> bool {
    let Some(spine) = section_mut(opf, "spine") else {
        return false;
    };

    let itemref = XmlElement::new_like("itemref", spine).with_attr("idref", idref);
    match index {
        Some(index) => spine.insert_element(index, itemref),
        None => spine.push_element(itemref),
    }
    true
}

/// Replaces the itemrefs of the spine with `(idref, linear)` pairs, in order
///
/// Returns false when the package has no spine.
pub fn set_spine(opf: &mut XmlDocument, entries: &[(String, bool)]) -> bool {
    let Some(spine) = section_mut(opf, "spine") else {
        return false;
    };

    // the first old itemref stays as an anchor so the new ones inherit its indentation
    let mut seen = false;
    spine.retain_elements(|element| {
        if element.local_name() != "itemref" {
            return true;
        }
        let keep = !seen;
        seen = true;
        keep
    });
    let anchor = spine
        .elements()
        .position(|element| element.local_name() == "itemref");

    for (offset, (idref, linear)) in entries.iter().enumerate() {
        let mut itemref = XmlElement::new_like("itemref", spine).with_attr("idref", idref);
        if !linear {
            itemref.set_attr("linear", "no");
        }
        match anchor {
            Some(anchor) => spine.insert_element(anchor + offset, itemref),
            None => spine.push_element(itemref),
        }
    }

    if let Some(anchor) = anchor {
        let target = anchor + entries.len();
        let mut index = 0;
        spine.retain_elements(|_| {
            let keep = index != target;
            index += 1;
            keep
        });
    }
    true
}

/// Removes every trace of `name` from the package
///
/// Manifest items whose href resolves to `name` are removed, together with
/// the spine itemrefs, `<meta name="cover">` entries and `spine@toc`
/// attributes that reference their ids. Guide references to `name` are
/// removed when `remove_from_guide` is set.
///
/// Returns true when the document changed.
pub fn remove_name(
    opf: &mut XmlDocument,
    opf_name: &str,
    name: &str,
    remove_from_guide: bool,
) -> bool {
    let removed_ids = manifest_items(opf, opf_name)
        .into_iter()
        .filter(|item| item.name.as_deref() == Some(name))
        .map(|item| item.id)
        .collect::<HashSet<_>>();

    let mut changed = false;

    if let Some(manifest) = section_mut(opf, "manifest") {
        changed |= manifest.retain_elements(|element| {
            element.local_name() != "item"
                || !element
                    .get_attr("id")
                    .is_some_and(|id| removed_ids.contains(id))
        }) > 0;
    }

    if let Some(spine) = section_mut(opf, "spine") {
        changed |= spine.retain_elements(|element| {
            !element
                .get_attr("idref")
                .is_some_and(|idref| removed_ids.contains(idref))
        }) > 0;

        if spine.get_attr("toc").is_some_and(|toc| removed_ids.contains(toc)) {
            spine.remove_attr("toc");
            changed = true;
        }
    }

    if let Some(metadata) = section_mut(opf, "metadata") {
        let is_cover_meta = |element: &XmlElement| {
            element.local_name() == "meta"
                && element.get_attr("name") == Some("cover")
                && element
                    .get_attr("content")
                    .is_some_and(|content| removed_ids.contains(content))
        };

        changed |= metadata.retain_elements(|element| !is_cover_meta(element)) > 0;
        for wrapper in metadata.elements_mut() {
            changed |= wrapper.retain_elements(|element| !is_cover_meta(element)) > 0;
        }
    }

    if remove_from_guide {
        if let Some(guide) = section_mut(opf, "guide") {
            changed |= guide.retain_elements(|element| {
                element.local_name() != "reference"
                    || element
                        .get_attr("href")
                        .and_then(|href| href_to_name(href, Some(opf_name)))
                        .as_deref()
                        != Some(name)
            }) > 0;
        }
    }

    changed
}

/// Removes manifest items that repeat an earlier item's href
///
/// Spine itemrefs to a removed duplicate are pointed at the kept item.
/// Returns the hrefs of the removed duplicates.
pub fn dedupe_manifest(opf: &mut XmlDocument, opf_name: &str) -> Vec<String> {
    let mut first_ids = HashMap::<String, String>::new();
    let mut replaced_ids = HashMap::<String, String>::new();
    let mut removed = Vec::new();

    for item in manifest_items(opf, opf_name) {
        let Some(name) = item.name else {
            continue;
        };
        match first_ids.get(&name) {
            Some(kept) => {
                warn!(
                    "Manifest item {:?} duplicates the href of {:?}, removing it",
                    item.id, kept
                );
                replaced_ids.insert(item.id, kept.clone());
                removed.push(item.href);
            }
            None => {
                first_ids.insert(name, item.id);
            }
        }
    }

    if replaced_ids.is_empty() {
        return removed;
    }

    // ids are unique, so removing by id never drops the kept item
    if let Some(manifest) = section_mut(opf, "manifest") {
        manifest.retain_elements(|element| {
            element.local_name() != "item"
                || !element
                    .get_attr("id")
                    .is_some_and(|id| replaced_ids.contains_key(id))
        });
    }

    if let Some(spine) = section_mut(opf, "spine") {
        for itemref in spine.elements_mut() {
            let replacement = itemref
                .get_attr("idref")
                .and_then(|idref| replaced_ids.get(idref))
                .cloned();
            if let Some(replacement) = replacement {
                itemref.set_attr("idref", &replacement);
            }
        }
    }

    removed
}

/// The canonical name of the cover image
///
/// Uses the EPUB 2 `<meta name="cover" content="id">` entry, falling back to
/// the manifest item with the EPUB 3 `cover-image` property.
pub fn cover_name(opf: &XmlDocument, opf_name: &str) -> Option<String> {
    let items = manifest_items(opf, opf_name);

    let cover_id = metadata_items(opf)
        .into_iter()
        .find(|item| item.property == "cover")
        .map(|item| item.value);

    if let Some(cover_id) = cover_id {
        if let Some(name) = items
            .iter()
            .find(|item| item.id == cover_id)
            .and_then(|item| item.name.clone())
        {
            return Some(name);
        }
    }

    items
        .into_iter()
        .find(|item| item.properties.iter().any(|property| property == "cover-image"))
        .and_then(|item| item.name)
}

/// Sets the media type of the manifest items whose href resolves to `name`
///
/// Returns true when an item changed.
pub fn set_media_type(opf: &mut XmlDocument, opf_name: &str, name: &str, media_type: &str) -> bool {
    let Some(manifest) = section_mut(opf, "manifest") else {
        return false;
    };

    let mut changed = false;
    for item in manifest.elements_mut() {
        let resolves = item
            .get_attr("href")
            .and_then(|href| href_to_name(href, Some(opf_name)))
            .as_deref()
            == Some(name);
        if resolves && item.get_attr("media-type") != Some(media_type) {
            item.set_attr("media-type", media_type);
            changed = true;
        }
    }
    changed
}

fn local_part(name: &str) -> &str {
    match name.split_once(':') {
        Some((_, local)) => local,
        None => name,
    }
}
