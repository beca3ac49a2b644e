//! Logical, hierarchical path identifiers and their deterministic mapping
//! onto filesystem directories.

use std::fmt;
use std::path::{Path as FsPath, PathBuf};

use crate::resource::ResourceType;

/// A hierarchical logical identifier: an ordered sequence of non-empty
/// segments, rooted at `/`. Two paths are equal iff their segment
/// sequences are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub const fn root() -> Path {
        Path {
            segments: Vec::new(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Path
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Path {
            segments: segments
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        }
    }

    /// Parses a `/`-delimited string. A leading `/` is optional; empty
    /// segments (`//`, trailing `/`) are dropped.
    pub fn parse(s: &str) -> Path {
        Path::from_segments(s.split('/'))
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn join(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Path { segments }
    }

    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            None
        } else {
            let mut segments = self.segments.clone();
            segments.pop();
            Some(Path { segments })
        }
    }

    /// True if `self` is `other`, or an ancestor of `other`.
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Strips `prefix` from `self`, returning the remaining, relative
    /// segment sequence. `None` if `prefix` is not actually a prefix.
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        if !prefix.is_prefix_of(self) {
            return None;
        }
        Some(Path {
            segments: self.segments[prefix.segments.len()..].to_vec(),
        })
    }

    /// The well-known `.cached` child of this path, used for
    /// cache-invalidation side effects (`spec.md §4.3`'s
    /// `maybeInvalidateCache`).
    pub fn cached_child(&self) -> Path {
        self.join(".cached")
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/")?;
        for (i, s) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{s}")?;
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(value: &str) -> Self {
        Path::parse(value)
    }
}

/// Per-path metadata returned by discovery operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMetadata {
    pub path: Path,
    pub resource_type: Option<ResourceType>,
}

/// Deterministic mapping from logical [`Path`]s to on-disk directories,
/// plus one-level directory discovery.
pub struct PathUtils;

const VERSIONS_DIR: &str = "versions";
const LOG_FILE: &str = "version.log";

impl PathUtils {
    /// The directory a path's state (version log + versions/) is rooted
    /// at, under `base_dir`.
    pub fn path_dir(base_dir: &FsPath, path: &Path) -> PathBuf {
        let mut dir = base_dir.to_path_buf();
        for segment in path.segments() {
            dir.push(encode_segment(segment));
        }
        dir
    }

    pub fn versions_subdir(path_dir: &FsPath) -> PathBuf {
        path_dir.join(VERSIONS_DIR)
    }

    pub fn version_dir(path_dir: &FsPath, version_id: &uuid::Uuid) -> PathBuf {
        Self::versions_subdir(path_dir).join(version_id.to_string())
    }

    pub fn log_path(path_dir: &FsPath) -> PathBuf {
        path_dir.join(LOG_FILE)
    }

    /// One-level listing of `base_dir/<path_dir>`'s immediate children,
    /// returned as logical, path-relative [`Path`]s (a single segment
    /// each). Entries whose name fails to decode as a valid escaped
    /// segment are skipped.
    pub fn find_children(base_dir: &FsPath, path: &Path) -> std::io::Result<Vec<String>> {
        let dir = Self::path_dir(base_dir, path);
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if let Some(decoded) = decode_segment(name) {
                out.push(decoded);
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Percent-escapes `.`, `/`, `%`, and ASCII control characters so that
/// logical segments map injectively onto single filesystem directory
/// names, regardless of the characters they contain.
///
/// Works byte-wise, not char-wise: a multi-byte UTF-8 sequence's
/// continuation bytes are always >= 0x80 and so never match an escape
/// condition, and get copied through unchanged. Escaping only ever
/// substitutes a reserved byte with three pure-ASCII bytes, so the result
/// is always valid UTF-8.
fn encode_segment(segment: &str) -> String {
    let mut out = Vec::with_capacity(segment.len());
    for b in segment.bytes() {
        if b == b'.' || b == b'/' || b == b'%' || b < 0x20 {
            out.extend_from_slice(format!("%{b:02X}").as_bytes());
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).expect("escaping never produces invalid UTF-8")
}

fn decode_segment(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            let byte = u8::from_str_radix(hex, 16).ok()?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
