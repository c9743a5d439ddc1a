use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};

use pictor_core::constants::{ARCHIVE_ENTRY_SEPARATOR, ARCHIVE_EXTENSIONS};

use crate::error::ResolveError;

/// Containers whose entry index can be read with the `zip` crate.
const ZIP_EXTENSIONS: &[&str] = &["zip", "cbz"];

/// A parsed source reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Plain(PathBuf),
    ArchiveEntry { container: PathBuf, entry: String },
}

impl SourceRef {
    /// Parse a raw reference.
    ///
    /// The text is an archive entry when some `#` is preceded by a path naming
    /// a container by extension and followed by an entry name. The first such
    /// `#` wins, so directories containing `#` still resolve. Anything else,
    /// including plain paths that happen to contain `#`, is a plain file.
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ResolveError::EmptyReference);
        }

        for (at, separator) in raw.match_indices(ARCHIVE_ENTRY_SEPARATOR) {
            let container = &raw[..at];
            let entry = raw[at + separator.len()..].trim_start_matches(['/', '\\']);
            if !entry.is_empty() && has_extension(Path::new(container), ARCHIVE_EXTENSIONS) {
                return Ok(SourceRef::ArchiveEntry {
                    container: PathBuf::from(container),
                    entry: entry.to_string(),
                });
            }
        }

        Ok(SourceRef::Plain(PathBuf::from(raw)))
    }

    pub fn is_archive_entry(&self) -> bool {
        matches!(self, SourceRef::ArchiveEntry { .. })
    }

    /// Whether the container format can be indexed without extraction.
    pub fn is_supported_container(&self) -> bool {
        match self {
            SourceRef::Plain(_) => true,
            SourceRef::ArchiveEntry { container, .. } => has_extension(container, ZIP_EXTENSIONS),
        }
    }

    /// File name used for format sniffing: the entry name for archive entries.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            SourceRef::Plain(path) => path.file_name().and_then(|n| n.to_str()),
            SourceRef::ArchiveEntry { entry, .. } => entry.rsplit(['/', '\\']).next(),
        }
    }
}

impl Display for SourceRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            SourceRef::Plain(path) => write!(f, "{}", path.display()),
            SourceRef::ArchiveEntry { container, entry } => {
                write!(
                    f,
                    "{}{}{}",
                    container.display(),
                    ARCHIVE_ENTRY_SEPARATOR,
                    entry
                )
            }
        }
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|c| c.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_entry_is_an_archive_entry() {
        let source = SourceRef::parse("container.zip#photo.png").unwrap();
        assert_eq!(
            source,
            SourceRef::ArchiveEntry {
                container: PathBuf::from("container.zip"),
                entry: "photo.png".to_string(),
            }
        );
        assert!(source.is_supported_container());
        assert_eq!(source.file_name(), Some("photo.png"));
    }

    #[test]
    fn windows_paths_are_plain_files() {
        let source = SourceRef::parse(r"C:\Photos\photo.png").unwrap();
        assert!(!source.is_archive_entry());
    }

    #[test]
    fn hash_in_a_plain_path_does_not_make_an_archive() {
        let source = SourceRef::parse("/photos/#1 best.jpg").unwrap();
        assert_eq!(source, SourceRef::Plain(PathBuf::from("/photos/#1 best.jpg")));
        assert!(!SourceRef::parse("/comics/vol1.CBZ#").unwrap().is_archive_entry());
    }

    #[test]
    fn nested_entries_keep_their_directories() {
        let source = SourceRef::parse("/comics/vol1.CBZ#pages/003.png").unwrap();
        assert!(source.is_archive_entry());
        assert_eq!(source.file_name(), Some("003.png"));
        assert_eq!(source.to_string(), "/comics/vol1.CBZ#pages/003.png");
    }

    #[test]
    fn hash_in_a_directory_before_the_container() {
        let source = SourceRef::parse("/library/#2024 trip/album.zip#photo.png").unwrap();
        assert_eq!(
            source,
            SourceRef::ArchiveEntry {
                container: PathBuf::from("/library/#2024 trip/album.zip"),
                entry: "photo.png".to_string(),
            }
        );
        let nested = SourceRef::parse("/a#b/c.zip#d#e.png").unwrap();
        assert_eq!(
            nested,
            SourceRef::ArchiveEntry {
                container: PathBuf::from("/a#b/c.zip"),
                entry: "d#e.png".to_string(),
            }
        );
    }

    #[test]
    fn non_zip_containers_are_recognised_but_unsupported() {
        let source = SourceRef::parse("/comics/vol2.cb7#001.jpg").unwrap();
        assert!(source.is_archive_entry());
        assert!(!source.is_supported_container());
    }

    #[test]
    fn empty_reference_is_rejected() {
        assert!(matches!(
            SourceRef::parse("  "),
            Err(ResolveError::EmptyReference)
        ));
    }
}
