//! Error Type Definition Module
//!
//! This module defines the error types that may be encountered while opening,
//! editing and committing a book container. All errors are uniformly wrapped in
//! the `EpubError` enumeration for convenient error handling by the caller.
//!
//! ## Error classes
//!
//! - Structural errors ([EpubError::InvalidEpub], [EpubError::InvalidMobi],
//!   [EpubError::FailedParsingXml]) are fatal when opening a book.
//! - Referential errors ([EpubError::DuplicateName], [EpubError::NotFound],
//!   [EpubError::ReferentialIntegrity]) fail a single mutation and leave the
//!   container unchanged.
//! - Obfuscation errors ([EpubError::DrmError] at open,
//!   [EpubError::ObfuscationKeyMissing] at commit).

use thiserror::Error;

/// Types of errors that can occur while working with a book container
#[derive(Debug, Error)]
pub enum EpubError {
    /// ZIP archive related errors
    ///
    /// Errors raised by the zip library while reading or writing an archive.
    #[error("Archive error: {source}")]
    ArchiveError { source: zip::result::ZipError },

    /// DRM protected book error
    ///
    /// The book contains resources encrypted with an algorithm other than
    /// the Adobe or IDPF font obfuscation, or the MOBI header declares encryption.
    /// Such books are encrypted, not merely obfuscated, and cannot be edited.
    #[error("DRM error: {reason}")]
    DrmError { reason: String },

    /// Duplicate name error
    ///
    /// The target name of an add or rename operation is already used by another file.
    #[error("Duplicate name: A file named \"{name}\" already exists in the book.")]
    DuplicateName { name: String },

    /// XML parsing failure error
    ///
    /// Every stage of the forgiving parser pipeline failed to recover a tree.
    /// The accumulated diagnostics of each stage are kept for reporting.
    #[error("Failed parsing XML error: \"{name}\" could not be parsed ({})", diagnostics.join("; "))]
    FailedParsingXml {
        name: String,
        diagnostics: Vec<String>,
    },

    #[error("IO error: {source}")]
    IOError { source: std::io::Error },

    /// Invalid EPUB error
    ///
    /// The archive could not be read even by the forgiving reader, or the
    /// container lacks the files required to locate its package document.
    #[error("Invalid EPUB: {reason}")]
    InvalidEpub { reason: String },

    /// Invalid MOBI error
    ///
    /// The file looks like a MOBI/PDB book but cannot be opened for editing,
    /// for example because it is a Topaz book, a plain MOBI 6 book, or a
    /// joint KF8 + MOBI 6 file.
    #[error("Invalid MOBI: {reason}")]
    InvalidMobi { reason: String },

    /// Resource not found error
    ///
    /// The requested name does not exist in the container, or a name that
    /// an operation requires to be in the manifest is not listed there.
    #[error("Not found: There is no file named \"{name}\" in the book.")]
    NotFound { name: String },

    /// Missing obfuscation key error
    ///
    /// An obfuscated font exists, but the package has no identifier from which
    /// the obfuscation key can be derived. Raised by commits, which keep the
    /// in-memory edits so that they can be retried once an identifier is added,
    /// and by raw reads of a font that could not be decrypted.
    #[error(
        "Obfuscation key missing: Unable to derive the \"{algorithm}\" key for the font \"{name}\"."
    )]
    ObfuscationKeyMissing { name: String, algorithm: String },

    /// Referential integrity error
    ///
    /// A mutation would break a cross reference of the package document, such as
    /// renaming a file that must not change, or putting a file into the spine
    /// that is not listed in the manifest.
    #[error("Referential integrity: {reason}")]
    ReferentialIntegrity { reason: String },

    /// Unsupported media type error
    ///
    /// A parsed tree was requested for a file whose media type has no parser.
    #[error("Unsupported media type: \"{name}\" has the media type \"{media_type}\".")]
    UnsupportedMediaType { name: String, media_type: String },

    /// WalkDir error
    ///
    /// This error occurs when using the WalkDir library to traverse a directory.
    #[error("WalkDir error: {source}")]
    WalkDirError { source: walkdir::Error },

    /// QuickXml error
    ///
    /// This error occurs when writing XML data using the QuickXml library.
    #[error("QuickXml error: {source}")]
    QuickXmlError { source: quick_xml::Error },
}

impl From<zip::result::ZipError> for EpubError {
    fn from(value: zip::result::ZipError) -> Self {
        EpubError::ArchiveError { source: value }
    }
}

impl From<quick_xml::Error> for EpubError {
    fn from(value: quick_xml::Error) -> Self {
        EpubError::QuickXmlError { source: value }
    }
}

impl From<std::io::Error> for EpubError {
    fn from(value: std::io::Error) -> Self {
        EpubError::IOError { source: value }
    }
}

impl From<walkdir::Error> for EpubError {
    fn from(value: walkdir::Error) -> Self {
        EpubError::WalkDirError { source: value }
    }
}

#[cfg(test)]
impl PartialEq for EpubError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::DrmError { reason: l_reason }, Self::DrmError { reason: r_reason }) => {
                l_reason == r_reason
            }
            (Self::DuplicateName { name: l_name }, Self::DuplicateName { name: r_name }) => {
                l_name == r_name
            }
            (Self::InvalidEpub { reason: l_reason }, Self::InvalidEpub { reason: r_reason }) => {
                l_reason == r_reason
            }
            (Self::InvalidMobi { reason: l_reason }, Self::InvalidMobi { reason: r_reason }) => {
                l_reason == r_reason
            }
            (Self::NotFound { name: l_name }, Self::NotFound { name: r_name }) => l_name == r_name,
            (
                Self::ObfuscationKeyMissing {
                    name: l_name,
                    algorithm: l_algorithm,
                },
                Self::ObfuscationKeyMissing {
                    name: r_name,
                    algorithm: r_algorithm,
                },
            ) => l_name == r_name && l_algorithm == r_algorithm,
            (
                Self::UnsupportedMediaType {
                    name: l_name,
                    media_type: l_media_type,
                },
                Self::UnsupportedMediaType {
                    name: r_name,
                    media_type: r_media_type,
                },
            ) => l_name == r_name && l_media_type == r_media_type,

            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}
