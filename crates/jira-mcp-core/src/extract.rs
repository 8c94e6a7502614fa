//! Text extraction from stored attachments

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::AttachmentRecord;

const TEXT_EXTENSIONS: [&str; 16] = [
    "txt", "md", "py", "js", "html", "css", "java", "cpp", "c", "h", "json", "xml", "csv", "log",
    "yaml", "yml",
];

/// Bound on one pdftotext run
pub const PDFTOTEXT_TIMEOUT: Duration = Duration::from_secs(60);

const EMPTY_PDF: &str = "No extractable text content found in the PDF.";

/// How the content of an attachment can be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Pdf,
    Unsupported,
}

impl ContentKind {
    /// Extension first, content type as a fallback
    pub fn detect(extension: Option<&str>, content_type: Option<&str>) -> Self {
        if let Some(ext) = extension.map(str::to_ascii_lowercase) {
            if TEXT_EXTENSIONS.contains(&ext.as_str()) {
                return ContentKind::Text;
            }
            if ext == "pdf" {
                return ContentKind::Pdf;
            }
        }

        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match essence.as_str() {
            "application/pdf" => ContentKind::Pdf,
            "application/json" | "application/xml" => ContentKind::Text,
            ct if ct.starts_with("text/") => ContentKind::Text,
            _ => ContentKind::Unsupported,
        }
    }

    pub fn of(record: &AttachmentRecord) -> Self {
        Self::detect(record.extension.as_deref(), record.content_type.as_deref())
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, ContentKind::Unsupported)
    }
}

/// Reads text out of stored attachments
#[derive(Debug, Clone)]
pub struct TextExtractor {
    pdftotext_bin: PathBuf,
    timeout: Duration,
    max_bytes: u64,
}

impl TextExtractor {
    pub fn new(pdftotext_bin: impl Into<PathBuf>, timeout: Duration, max_bytes: u64) -> Self {
        Self {
            pdftotext_bin: pdftotext_bin.into(),
            timeout,
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Extract the text of a stored attachment.
    ///
    /// Files over the size limit are refused before anything is read.
    pub async fn extract(&self, record: &AttachmentRecord) -> Result<String> {
        let kind = ContentKind::of(record);
        if !kind.is_supported() {
            return Err(Error::UnsupportedFormat(format!(
                "{} ({}); only text files and PDFs can be analyzed",
                record.local_name,
                record
                    .extension
                    .as_deref()
                    .or(record.content_type.as_deref())
                    .unwrap_or("unknown type")
            )));
        }

        let size = tokio::fs::metadata(&record.path).await?.len();
        if size > self.max_bytes {
            return Err(Error::Validation(format!(
                "{} is too large to analyze ({} bytes, limit {})",
                record.local_name, size, self.max_bytes
            )));
        }

        if kind == ContentKind::Pdf {
            self.pdf_text(&record.path).await
        } else {
            read_text(&record.path).await
        }
    }

    async fn pdf_text(&self, path: &Path) -> Result<String> {
        let mut cmd = Command::new(&self.pdftotext_bin);
        cmd.arg("-layout")
            .args(["-enc", "UTF-8"])
            .arg(path)
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(bin = %self.pdftotext_bin.display(), path = %path.display(), "Running pdftotext");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => return Err(Error::timeout("pdftotext", self.timeout)),
            Ok(Err(e)) if e.kind() == IoErrorKind::NotFound => {
                return Err(Error::UnsupportedFormat(format!(
                    "PDF extraction unavailable: {} not found",
                    self.pdftotext_bin.display()
                )))
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::backend(
                "pdftotext",
                format!("exited with {}: {}", output.status, stderr.trim()),
                false,
            ));
        }

        Ok(paginate(&String::from_utf8_lossy(&output.stdout)))
    }
}

async fn read_text(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// pdftotext separates pages with form feeds
fn paginate(raw: &str) -> String {
    let mut out = String::new();
    for (i, page) in raw.split('\x0c').enumerate() {
        if page.trim().is_empty() {
            continue;
        }
        out.push_str(&format!("\n--- Page {} ---\n", i + 1));
        out.push_str(page.trim_end());
        out.push('\n');
    }
    if out.is_empty() {
        EMPTY_PDF.to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket_key::TicketKey;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(path: PathBuf, content_type: Option<&str>) -> AttachmentRecord {
        let local_name = path.file_name().unwrap().to_string_lossy().to_string();
        AttachmentRecord {
            key: TicketKey::parse("PROJ-1").unwrap(),
            remote_id: Some("1".into()),
            remote_filename: local_name.clone(),
            extension: crate::sanitize::extension_of(&local_name),
            local_name,
            size: 0,
            content_type: content_type.map(str::to_string),
            path,
            downloaded_at: Utc::now(),
            backend: "primary".into(),
        }
    }

    fn extractor(max_bytes: u64) -> TextExtractor {
        TextExtractor::new("pdftotext", Duration::from_secs(5), max_bytes)
    }

    #[test]
    fn test_detect() {
        assert_eq!(ContentKind::detect(Some("LOG"), None), ContentKind::Text);
        assert_eq!(ContentKind::detect(Some("yml"), None), ContentKind::Text);
        assert_eq!(ContentKind::detect(Some("pdf"), None), ContentKind::Pdf);
        assert_eq!(ContentKind::detect(None, Some("text/x-rust")), ContentKind::Text);
        assert_eq!(
            ContentKind::detect(Some("dat"), Some("application/json; charset=utf-8")),
            ContentKind::Text
        );
        assert_eq!(ContentKind::detect(None, Some("application/pdf")), ContentKind::Pdf);
        assert_eq!(ContentKind::detect(Some("png"), Some("image/png")), ContentKind::Unsupported);
        assert_eq!(ContentKind::detect(None, None), ContentKind::Unsupported);
    }

    #[tokio::test]
    async fn test_text_read_lossy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, b"ok \xff\xfe end").unwrap();

        let text = extractor(1024).extract(&record(path, None)).await.unwrap();
        assert!(text.starts_with("ok "));
        assert!(text.contains('\u{FFFD}'));
        assert!(text.ends_with(" end"));
    }

    #[tokio::test]
    async fn test_oversize_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, vec![b'a'; 2048]).unwrap();

        let err = extractor(1024).extract(&record(path, None)).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unsupported_format_leaves_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.png");
        std::fs::write(&path, b"\x89PNG").unwrap();

        let err = extractor(1024)
            .extract(&record(path.clone(), Some("image/png")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UnsupportedFormat);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_missing_pdftotext_is_unsupported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let extractor = TextExtractor::new(dir.path().join("no-such-bin"), Duration::from_secs(5), 1024);
        let err = extractor.extract(&record(path, None)).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UnsupportedFormat);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pdf_pages_from_fake_pdftotext() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let bin = dir.path().join("fake-pdftotext");
        std::fs::write(&bin, "#!/bin/sh\nprintf 'first page\\f\\fthird page\\f'\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let extractor = TextExtractor::new(&bin, Duration::from_secs(5), 1024);
        let text = extractor.extract(&record(path, None)).await.unwrap();
        assert!(text.contains("--- Page 1 ---\nfirst page"));
        assert!(text.contains("--- Page 3 ---\nthird page"));
        assert!(!text.contains("Page 2"));
    }

    #[test]
    fn test_paginate_empty() {
        assert_eq!(paginate("\x0c  \x0c"), EMPTY_PDF);
    }
}
