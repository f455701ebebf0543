//! The canonical metadata record (spec.md S3): shape, per-platform id
//! derivation, ingress validation and the equality predicates watchers use
//! to suppress no-op events.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

pub const ROOT_ID: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    File,
    Folder,
}

/// Which id-derivation family applies to the local filesystem of this
/// sync root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdPlatform {
    /// Case-sensitive filesystems (most Linux filesystems): id == path.
    Unix,
    /// Case-preserving, case-insensitive, Unicode-NFD filesystems (macOS).
    Hfs,
    /// Case-insensitive filesystems (Windows).
    Ntfs,
}

impl IdPlatform {
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            IdPlatform::Hfs
        } else if cfg!(target_os = "windows") {
            IdPlatform::Ntfs
        } else {
            IdPlatform::Unix
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "unix" | "linux" | "case-sensitive" => Some(IdPlatform::Unix),
            "hfs" | "hfs+" | "macos" | "darwin" => Some(IdPlatform::Hfs),
            "ntfs" | "windows" => Some(IdPlatform::Ntfs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdPlatform::Unix => "unix",
            IdPlatform::Hfs => "hfs",
            IdPlatform::Ntfs => "ntfs",
        }
    }

    /// Derives the id for a normalized path under this platform's rules.
    /// Idempotent: `derive_id(derive_id(p))` treating the second input as
    /// already-canonical yields the same string back (upper-casing and NFD
    /// are both fixed points on their own output).
    pub fn derive_id(&self, path: &str) -> String {
        match self {
            IdPlatform::Unix => path.to_string(),
            IdPlatform::Hfs => path.nfd().collect::<String>().to_uppercase(),
            IdPlatform::Ntfs => path.to_uppercase(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub id: Option<String>,
    pub rev: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sides {
    pub local: i64,
    pub remote: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncompatibilityType {
    ReservedName,
    ForbiddenChar,
    PathTooLong,
    TrailingDotOrSpace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incompatibility {
    #[serde(rename = "type")]
    pub kind: IncompatibilityType,
    pub path: String,
    pub doc_type: DocType,
}

/// The canonical record the whole engine operates on (spec.md S3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub rev: String,
    pub path: String,
    pub doc_type: DocType,
    #[serde(default)]
    pub deleted: bool,
    pub md5sum: Option<String>,
    pub size: Option<u64>,
    pub executable: Option<bool>,
    pub mime: Option<String>,
    pub class: Option<String>,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ino: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub remote: RemoteRef,
    #[serde(default)]
    pub sides: Sides,
    #[serde(default)]
    pub errors: u32,
    pub move_to: Option<String>,
    pub move_from: Option<Box<Metadata>>,
    #[serde(default)]
    pub child_move: bool,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub incompatibilities: Vec<Incompatibility>,
}

/// Extracts the integer prefix of a `"N-hash"` rev string. Revs the engine
/// itself never produced (e.g. `"0"` for a never-materialized doc) parse as
/// 0.
pub fn extract_rev(rev: &str) -> i64 {
    rev.split('-').next().and_then(|n| n.parse().ok()).unwrap_or(0)
}

/// `dirname` over an id path, using `/` as the sole separator (ids are
/// POSIX-relative paths before platform folding). Returns `ROOT_ID` for a
/// top-level id.
pub fn parent_id(id: &str) -> &str {
    match id.rfind('/') {
        Some(idx) => &id[..idx],
        None => ROOT_ID,
    }
}

pub mod validate {
    use super::*;

    /// Rejects a path with a leading separator, `.`, `""`, or any `..`
    /// component. Returns the normalized path on success.
    pub fn invalid_path(path: &str) -> Result<String, String> {
        let stripped = path.strip_prefix('/').unwrap_or(path);
        if stripped.is_empty() || stripped == "." {
            return Err(format!("empty or current-dir path: {path:?}"));
        }
        for segment in stripped.split('/') {
            if segment == ".." {
                return Err(format!("path contains '..' component: {path:?}"));
            }
        }
        Ok(stripped.to_string())
    }

    /// A missing checksum on a file is invalid; otherwise the base64 must
    /// decode to exactly 16 bytes and re-encode to the same string.
    pub fn invalid_checksum(doc_type: DocType, md5sum: Option<&str>) -> Result<(), String> {
        match (doc_type, md5sum) {
            (DocType::Folder, _) => Ok(()),
            (DocType::File, None) => Err("file is missing md5sum".to_string()),
            (DocType::File, Some(encoded)) => {
                let decoded = BASE64
                    .decode(encoded)
                    .map_err(|e| format!("md5sum is not valid base64: {e}"))?;
                if decoded.len() != 16 {
                    return Err(format!("md5sum decodes to {} bytes, want 16", decoded.len()));
                }
                let reencoded = BASE64.encode(&decoded);
                if reencoded != encoded {
                    return Err("md5sum does not round-trip through base64".to_string());
                }
                Ok(())
            }
        }
    }

    const MAX_PATH_LEN: usize = 260;
    const RESERVED_WINDOWS_NAMES: &[&str] = &[
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

    /// Per-segment restrictions plus a total-path-length limit, combined
    /// across the three platform families named in S3. An empty result
    /// means compatible.
    pub fn detect_platform_incompatibilities(path: &str, doc_type: DocType) -> Vec<Incompatibility> {
        let mut out = Vec::new();

        if path.chars().count() > MAX_PATH_LEN {
            out.push(Incompatibility {
                kind: IncompatibilityType::PathTooLong,
                path: path.to_string(),
                doc_type,
            });
        }

        for segment in path.split('/') {
            if segment.is_empty() {
                continue;
            }
            let stem = segment.split('.').next().unwrap_or(segment);
            if RESERVED_WINDOWS_NAMES
                .iter()
                .any(|name| stem.eq_ignore_ascii_case(name))
            {
                out.push(Incompatibility {
                    kind: IncompatibilityType::ReservedName,
                    path: segment.to_string(),
                    doc_type,
                });
            }
            if segment.chars().any(|c| FORBIDDEN_CHARS.contains(&c) || c.is_control()) {
                out.push(Incompatibility {
                    kind: IncompatibilityType::ForbiddenChar,
                    path: segment.to_string(),
                    doc_type,
                });
            }
            if segment.ends_with('.') || segment.ends_with(' ') {
                out.push(Incompatibility {
                    kind: IncompatibilityType::TrailingDotOrSpace,
                    path: segment.to_string(),
                    doc_type,
                });
            }
        }

        out
    }
}

pub mod equality {
    use super::*;

    fn coerce_bool(v: Option<bool>) -> bool {
        v.unwrap_or(false)
    }

    /// Equal on `{id, docType, remote, tags, trashed, ino}`. `updated_at`
    /// is deliberately excluded: filesystems differ by up to 3s.
    pub fn same_folder(a: &Metadata, b: &Metadata) -> bool {
        a.id == b.id
            && a.doc_type == b.doc_type
            && a.remote == b.remote
            && a.tags == b.tags
            && a.trashed == b.trashed
            && a.ino == b.ino
    }

    /// Equal on `{id, docType, md5sum, remote, tags, size, trashed, ino,
    /// executable(coerced to bool)}`.
    pub fn same_file(a: &Metadata, b: &Metadata) -> bool {
        a.id == b.id
            && a.doc_type == b.doc_type
            && a.md5sum == b.md5sum
            && a.remote == b.remote
            && a.tags == b.tags
            && a.size == b.size
            && a.trashed == b.trashed
            && a.ino == b.ino
            && coerce_bool(a.executable) == coerce_bool(b.executable)
    }

    pub fn same_binary(a: &Metadata, b: &Metadata) -> bool {
        a.md5sum == b.md5sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_doc(id: &str, path: &str) -> Metadata {
        Metadata {
            id: id.to_string(),
            rev: "1-abc".to_string(),
            path: path.to_string(),
            doc_type: DocType::File,
            deleted: false,
            md5sum: Some("rL0Y20zC+Fzt72VPzMSk2A==".to_string()),
            size: Some(10),
            executable: None,
            mime: None,
            class: None,
            updated_at: None,
            ino: None,
            tags: Vec::new(),
            remote: RemoteRef::default(),
            sides: Sides::default(),
            errors: 0,
            move_to: None,
            move_from: None,
            child_move: false,
            trashed: false,
            incompatibilities: Vec::new(),
        }
    }

    #[test]
    fn hfs_id_folds_accents_and_case() {
        let hfs = IdPlatform::Hfs;
        assert_eq!(hfs.derive_id("Café"), hfs.derive_id("CAFÉ"));
    }

    #[test]
    fn ntfs_id_folds_case_only() {
        let ntfs = IdPlatform::Ntfs;
        assert_eq!(ntfs.derive_id("a/B"), ntfs.derive_id("A/b"));
    }

    #[test]
    fn unix_id_is_case_sensitive() {
        let unix = IdPlatform::Unix;
        assert_ne!(unix.derive_id("a/B"), unix.derive_id("A/b"));
    }

    #[test]
    fn id_derivation_is_idempotent() {
        for platform in [IdPlatform::Unix, IdPlatform::Hfs, IdPlatform::Ntfs] {
            let once = platform.derive_id("Some/Path.txt");
            let twice = platform.derive_id(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn rejects_dotdot_path() {
        assert!(validate::invalid_path("../escape").is_err());
        assert!(validate::invalid_path("a/../b").is_err());
        assert!(validate::invalid_path(".").is_err());
        assert!(validate::invalid_path("").is_err());
    }

    #[test]
    fn accepts_and_normalizes_leading_slash() {
        assert_eq!(validate::invalid_path("/a/b").unwrap(), "a/b");
        assert_eq!(validate::invalid_path("a/b").unwrap(), "a/b");
    }

    #[test]
    fn rejects_15_byte_checksum() {
        let fifteen_bytes = BASE64.encode([0u8; 15]);
        assert!(validate::invalid_checksum(DocType::File, Some(&fifteen_bytes)).is_err());
        assert!(validate::invalid_checksum(DocType::File, None).is_err());
    }

    #[test]
    fn accepts_16_byte_checksum_round_trip() {
        let sixteen_bytes = BASE64.encode([7u8; 16]);
        assert!(validate::invalid_checksum(DocType::File, Some(&sixteen_bytes)).is_ok());
    }

    #[test]
    fn folders_never_need_a_checksum() {
        assert!(validate::invalid_checksum(DocType::Folder, None).is_ok());
    }

    #[test]
    fn detects_reserved_and_forbidden_segments() {
        let issues = validate::detect_platform_incompatibilities("a/CON/b", DocType::File);
        assert!(issues
            .iter()
            .any(|i| i.kind == IncompatibilityType::ReservedName));

        let issues = validate::detect_platform_incompatibilities("a/b<c", DocType::File);
        assert!(issues
            .iter()
            .any(|i| i.kind == IncompatibilityType::ForbiddenChar));

        let long_segment = "a".repeat(300);
        let issues = validate::detect_platform_incompatibilities(&long_segment, DocType::File);
        assert!(issues
            .iter()
            .any(|i| i.kind == IncompatibilityType::PathTooLong));

        assert!(validate::detect_platform_incompatibilities("a/b/c.txt", DocType::File).is_empty());
    }

    #[test]
    fn same_file_and_same_folder_are_reflexive() {
        let doc = base_doc("id1", "a/b.txt");
        assert!(equality::same_file(&doc, &doc));
        let mut folder = doc.clone();
        folder.doc_type = DocType::Folder;
        assert!(equality::same_folder(&folder, &folder));
    }

    #[test]
    fn same_file_ignores_updated_at_but_not_md5() {
        let a = base_doc("id1", "a/b.txt");
        let mut b = a.clone();
        b.updated_at = Some(chrono::Utc::now());
        assert!(equality::same_file(&a, &b));

        b.md5sum = Some("AAAAAAAAAAAAAAAAAAAAAA==".to_string());
        assert!(!equality::same_file(&a, &b));
    }

    #[test]
    fn extract_rev_parses_leading_integer() {
        assert_eq!(extract_rev("0"), 0);
        assert_eq!(extract_rev("7-deadbeef"), 7);
        assert_eq!(extract_rev("not-a-number"), 0);
    }

    #[test]
    fn parent_id_splits_on_last_slash() {
        assert_eq!(parent_id("a/b/c"), "a/b");
        assert_eq!(parent_id("top"), ROOT_ID);
    }
}
