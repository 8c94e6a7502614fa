//! Path Sanitizer
//!
//! Remote filenames are untrusted. [`sanitize_filename`] reduces them to a
//! single safe path segment; [`PathSanitizer`] places that segment under the
//! ticket directory and verifies the result never leaves the root.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

use crate::error::{Error, Result};
use crate::ticket_key::TicketKey;

/// Maximum sanitized filename length in bytes
pub const MAX_FILENAME_BYTES: usize = 200;

const MAX_EXTENSION_LEN: usize = 16;
const RESERVED_CHARS: [char; 7] = ['*', '?', ':', '"', '<', '>', '|'];

/// Reduce a remote filename to one safe path segment.
///
/// Never returns an empty string, `.` or `..`, and never a name containing a
/// separator, NUL or control character.
pub fn sanitize_filename(remote: &str, content_type: Option<&str>) -> String {
    let decoded = decode_separators(remote);

    let joined = decoded
        .split(['/', '\\'])
        .filter(|segment| !matches!(*segment, "" | "." | ".."))
        .collect::<Vec<_>>()
        .join("_");

    let cleaned: String = joined
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if RESERVED_CHARS.contains(&c) { '_' } else { c })
        .collect();

    let trimmed = cleaned.trim().trim_end_matches('.').trim_end();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return placeholder_name(remote, content_type);
    }

    cap_length(trimmed, MAX_FILENAME_BYTES)
}

/// Insert ` (n)` before the extension: `log.txt` becomes `log (2).txt`
pub fn with_suffix(name: &str, n: usize) -> String {
    let suffix = format!(" ({n})");
    let (stem, ext) = split_extension(name);
    let candidate = match ext {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    if candidate.len() <= MAX_FILENAME_BYTES {
        return candidate;
    }

    let ext_len = ext.map(|e| e.len() + 1).unwrap_or(0);
    let budget = MAX_FILENAME_BYTES.saturating_sub(suffix.len() + ext_len);
    let stem = truncate_at_boundary(stem, budget);
    match ext {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    }
}

/// Lower-cased final extension of a filename, if it looks like one
pub fn extension_of(name: &str) -> Option<String> {
    split_extension(name)
        .1
        .map(|e| e.to_ascii_lowercase())
}

/// Conventional extension for a content type
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let ext = match essence.as_str() {
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        "text/markdown" => "md",
        "text/html" => "html",
        "text/css" => "css",
        "text/csv" => "csv",
        "application/json" => "json",
        "application/xml" | "text/xml" => "xml",
        "application/x-yaml" | "application/yaml" | "text/yaml" => "yaml",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "application/zip" => "zip",
        "application/gzip" | "application/x-gzip" => "gz",
        _ => return None,
    };
    Some(ext)
}

fn decode_separators(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if bytes[i] == b'%' && raw.is_char_boundary(i + 3) {
            let decoded = match raw[i + 1..i + 3].to_ascii_uppercase().as_str() {
                "2F" => Some('/'),
                "5C" => Some('\\'),
                "2E" => Some('.'),
                "00" => Some('\0'),
                _ => None,
            };
            if let Some(c) = decoded {
                out.push(c);
                i += 3;
                continue;
            }
        }
        let Some(ch) = raw[i..].chars().next() else {
            break;
        };
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => {
            let ext = &name[idx + 1..];
            if !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
            {
                (&name[..idx], Some(ext))
            } else {
                (name, None)
            }
        }
        _ => (name, None),
    }
}

fn truncate_at_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn cap_length(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    match split_extension(name) {
        (stem, Some(ext)) => {
            let stem = truncate_at_boundary(stem, max - ext.len() - 1);
            format!("{}.{}", stem.trim_end(), ext)
        }
        (stem, None) => truncate_at_boundary(stem, max).trim_end().to_string(),
    }
}

fn placeholder_name(remote: &str, content_type: Option<&str>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let base = format!("attachment-{}", &id[..8]);

    let from_remote = remote
        .rsplit(['.', '/', '\\'])
        .next()
        .filter(|_| remote.contains('.'))
        .filter(|e| {
            !e.is_empty() && e.len() <= MAX_EXTENSION_LEN && e.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(|e| e.to_ascii_lowercase());

    let ext = content_type
        .and_then(extension_for_content_type)
        .map(str::to_string)
        .or(from_remote);

    match ext {
        Some(ext) => format!("{base}.{ext}"),
        None => base,
    }
}

/// Confines attachment paths to one root directory
#[derive(Debug, Clone)]
pub struct PathSanitizer {
    root: PathBuf,
}

impl PathSanitizer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root as configured (not canonicalized)
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<KEY>`, without touching the filesystem
    pub fn directory_for(&self, key: &TicketKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Canonical root, created on first use
    pub async fn canonical_root(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).await?;
        Ok(fs::canonicalize(&self.root).await?)
    }

    /// Create (if needed) and verify the ticket directory, returning its
    /// canonical path.
    pub async fn ticket_directory(&self, key: &TicketKey) -> Result<PathBuf> {
        let root = self.canonical_root().await?;
        let dir = root.join(key.as_str());

        match fs::symlink_metadata(&dir).await {
            Ok(meta) if meta.file_type().is_symlink() => return Err(escape(&dir)),
            Ok(_) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => match fs::create_dir(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        }

        let canonical = fs::canonicalize(&dir).await?;
        if canonical.parent() != Some(root.as_path()) {
            return Err(escape(&canonical));
        }
        Ok(canonical)
    }

    /// Destination for a remote filename under the ticket directory.
    ///
    /// The returned path has been checked to lie in the ticket directory and
    /// not to be a symlink. Collisions are resolved by the caller.
    pub async fn sanitize(
        &self,
        key: &TicketKey,
        remote_filename: &str,
        content_type: Option<&str>,
    ) -> Result<PathBuf> {
        let name = sanitize_filename(remote_filename, content_type);
        let dir = self.ticket_directory(key).await?;
        self.destination(&dir, &name).await
    }

    /// Join `name` onto an already verified ticket directory
    pub async fn destination(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        let path = dir.join(name);
        if path.parent() != Some(dir) || path.file_name().map(|n| n != name).unwrap_or(true) {
            return Err(escape(&path));
        }
        match fs::symlink_metadata(&path).await {
            Ok(meta) if meta.file_type().is_symlink() => Err(escape(&path)),
            _ => Ok(path),
        }
    }

    /// Verify that an existing entry lies strictly below the root.
    ///
    /// The entry itself is not followed when it is a symlink; its parent is
    /// canonicalized and must be the root or a descendant of it.
    pub async fn ensure_contained(&self, path: &Path) -> Result<PathBuf> {
        let root = self.canonical_root().await?;
        let parent = path.parent().ok_or_else(|| escape(path))?;
        let name = path.file_name().ok_or_else(|| escape(path))?;

        let parent = fs::canonicalize(parent).await?;
        if !parent.starts_with(&root) {
            return Err(escape(path));
        }
        Ok(parent.join(name))
    }
}

fn escape(path: &Path) -> Error {
    warn!(path = %path.display(), security = true, "Rejected path outside attachment root");
    Error::PathEscape {
        path: path.to_path_buf(),
    }
}
