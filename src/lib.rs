//! OEB container library
//!
//! A Rust library for editing EPUB (and KF8/AZW3) e-books as a set of files.
//!
//! A book is unpacked into a private directory and exposed as files identified
//! by canonical names (`OEBPS/Text/chapter1.xhtml`). Files can be read as raw
//! bytes or as parsed XML, XHTML and CSS trees; edits are kept in a cache and
//! written back when the book is committed. Operations that touch more than one
//! file keep the package consistent: renaming a file rewrites every link to it,
//! removing a file removes it from the manifest, spine and guide.
//!
//! ## Features
//!
//! - Open zipped EPUBs, unpacked EPUB directories and KF8 (AZW3) books.
//! - Forgiving parsing: malformed markup is recovered and the repairs are logged.
//! - Rename, add and remove files with automatic link and manifest maintenance.
//! - Cheap checkpoints through hard-link clones, and content diffs between them.
//! - Transparent handling of Adobe and IDPF font obfuscation.
//! - Commit back to the source (ZIP or directory) or to a new EPUB file.
//!
//! ## Quick Start
//!
//! ```rust, no_run
//! # use oeb_container::{Container, EpubError};
//! # fn main() -> Result<(), EpubError> {
//! let mut book = Container::open("path/to/book.epub")?;
//! println!("Title: {:?}", book.title());
//!
//! // rename a chapter, every link to it follows
//! book.rename("OEBPS/chapter1.xhtml", "OEBPS/Text/chapter1.xhtml")?;
//!
//! // edit a parsed tree, then mark it dirty
//! if let Some(document) = book.parsed("OEBPS/Text/chapter1.xhtml")?.as_document_mut() {
//!     document.root.set_attr("xml:lang", "en");
//! }
//! book.dirty("OEBPS/Text/chapter1.xhtml")?;
//!
//! // checkpoint, then save
//! let checkpoint = book.clone_to("/tmp/checkpoint")?;
//! assert!(book.compare_to(&checkpoint)?.is_empty());
//! book.commit(None)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `azw3` (default): Enable opening KF8 (AZW3) books. Without it, MOBI input
//!   fails with `EpubError::InvalidMobi`.

pub mod archive;
pub mod container;
pub mod css;
pub mod diff;
pub mod error;
pub mod links;
#[cfg(feature = "azw3")]
pub mod mobi;
pub mod names;
pub mod obfuscation;
pub mod opf;
pub mod types;
pub(crate) mod utils;
pub mod xml;

pub use container::{Container, OpenOptions, ParsedItem};
pub use error::EpubError;
pub use names::{href_to_name, name_to_href};
pub use utils::DecodeBytes;
pub use xml::{XmlDocument, XmlElement, XmlNode};
