//! Attachment Store
//!
//! Downloads ticket attachments into `<root>/<KEY>/<name>`, keeps an
//! in-memory index of what is on disk, and reclaims the space on cleanup.

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::AttachmentSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{CoreEvent, EventObserver};
use crate::jira::AttachmentMeta;
use crate::registry::RegisteredBackend;
use crate::router::KeyRouter;
use crate::sanitize::{extension_for_content_type, extension_of, sanitize_filename, with_suffix, PathSanitizer};
use crate::ticket_key::TicketKey;

/// Upper bound on ` (n)` suffixes tried for one name
const MAX_NAME_ATTEMPTS: usize = 1000;

/// One attachment stored on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentRecord {
    pub key: TicketKey,
    /// Remote attachment id; unknown for records rebuilt from disk
    pub remote_id: Option<String>,
    pub remote_filename: String,
    /// Sanitized name of the file under the ticket directory
    pub local_name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub extension: Option<String>,
    pub path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
    pub backend: String,
}

/// An attachment that could not be stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentFailure {
    pub filename: String,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl AttachmentFailure {
    fn new(filename: &str, error: &Error) -> Self {
        Self {
            filename: filename.to_string(),
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// Outcome of [`AttachmentStore::fetch_all`]
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub key: TicketKey,
    pub backend: String,
    pub records: Vec<AttachmentRecord>,
    pub failures: Vec<AttachmentFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub tickets: usize,
    pub files: usize,
}

type TicketIndex = BTreeMap<String, AttachmentRecord>;

/// Removes a partially written file unless the transfer completed
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != IoErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove partial attachment");
                }
            }
        }
    }
}

pub struct AttachmentStore {
    router: KeyRouter,
    sanitizer: PathSanitizer,
    settings: AttachmentSettings,
    index: RwLock<BTreeMap<TicketKey, TicketIndex>>,
    observer: Arc<dyn EventObserver>,
}

impl AttachmentStore {
    /// Create the root if needed and rebuild the index from what is on disk
    pub async fn open(
        router: KeyRouter,
        settings: AttachmentSettings,
        observer: Arc<dyn EventObserver>,
    ) -> Result<Self> {
        let store = Self {
            router,
            sanitizer: PathSanitizer::new(settings.root.clone()),
            settings,
            index: RwLock::new(BTreeMap::new()),
            observer,
        };
        store.rebuild_index().await?;
        Ok(store)
    }

    pub fn sanitizer(&self) -> &PathSanitizer {
        &self.sanitizer
    }

    pub fn settings(&self) -> &AttachmentSettings {
        &self.settings
    }

    /// Replace the index with one record per regular file found under
    /// `<root>/<KEY>/`. Entries that are not ticket directories are skipped.
    pub async fn rebuild_index(&self) -> Result<()> {
        let root = self.sanitizer.canonical_root().await?;
        let mut rebuilt: BTreeMap<TicketKey, TicketIndex> = BTreeMap::new();

        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let key = match TicketKey::parse(&name) {
                Ok(key) if key.as_str() == name => key,
                _ => {
                    debug!(entry = %name, "Skipping non-ticket directory");
                    continue;
                }
            };

            let backend = self
                .router
                .resolve(&key)
                .map(|b| b.label().to_string())
                .unwrap_or_default();
            let records = Self::scan_ticket_dir(&key, &entry.path(), &backend).await?;
            if !records.is_empty() {
                rebuilt.insert(key, records);
            }
        }

        let tickets = rebuilt.len();
        let records = rebuilt.values().map(BTreeMap::len).sum();
        *self.index.write().await = rebuilt;
        self.observer
            .record(CoreEvent::IndexRebuilt { tickets, records });
        Ok(())
    }

    async fn scan_ticket_dir(key: &TicketKey, dir: &Path, backend: &str) -> Result<TicketIndex> {
        let mut records = TicketIndex::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            // DirEntry::metadata does not follow symlinks
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let local_name = entry.file_name().to_string_lossy().to_string();
            let downloaded_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            records.insert(
                local_name.clone(),
                AttachmentRecord {
                    key: key.clone(),
                    remote_id: None,
                    remote_filename: local_name.clone(),
                    extension: extension_of(&local_name),
                    local_name,
                    size: meta.len(),
                    content_type: None,
                    path: entry.path(),
                    downloaded_at,
                    backend: backend.to_string(),
                },
            );
        }
        Ok(records)
    }

    /// Download every attachment of a ticket.
    ///
    /// Individual failures are collected in the report; only routing,
    /// listing and ticket-directory errors fail the call.
    pub async fn fetch_all(&self, key: &TicketKey) -> Result<FetchReport> {
        let backend = self.router.resolve(key)?;

        let listing = timeout(self.settings.transfer_timeout, backend.client.attachments(key))
            .await
            .map_err(|_| {
                Error::timeout(
                    format!("listing attachments of {key}"),
                    self.settings.transfer_timeout,
                )
            })??;
        if listing.is_empty() {
            return Ok(FetchReport {
                key: key.clone(),
                backend: backend.label().to_string(),
                records: Vec::new(),
                failures: Vec::new(),
            });
        }

        let dir = match self.sanitizer.ticket_directory(key).await {
            Ok(dir) => dir,
            Err(e) => return Err(self.report_escape(Some(key), e)),
        };

        let concurrency = self.settings.download_concurrency.max(1);
        let outcomes: Vec<(AttachmentMeta, Result<AttachmentRecord>)> = stream::iter(listing)
            .map(|meta| {
                let backend = &backend;
                let dir = dir.as_path();
                async move {
                    let outcome = self.fetch_one(key, backend, dir, &meta).await;
                    (meta, outcome)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut records = Vec::new();
        let mut failures = Vec::new();
        for (meta, outcome) in outcomes {
            match outcome {
                Ok(record) => records.push(record),
                Err(e) => {
                    let e = self.report_escape(Some(key), e);
                    self.observer.record(CoreEvent::AttachmentRejected {
                        key: key.clone(),
                        filename: meta.filename.clone(),
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                    failures.push(AttachmentFailure::new(&meta.filename, &e));
                }
            }
        }
        records.sort_by(|a, b| a.local_name.cmp(&b.local_name));
        failures.sort_by(|a, b| a.filename.cmp(&b.filename));

        Ok(FetchReport {
            key: key.clone(),
            backend: backend.label().to_string(),
            records,
            failures,
        })
    }

    async fn fetch_one(
        &self,
        key: &TicketKey,
        backend: &RegisteredBackend,
        dir: &Path,
        meta: &AttachmentMeta,
    ) -> Result<AttachmentRecord> {
        if let Some(existing) = self.reusable_record(key, meta).await {
            debug!(key = %key, filename = %existing.local_name, "Attachment already stored");
            return Ok(existing);
        }

        let limit = self.settings.max_attachment_bytes;
        if let Some(declared) = meta.size {
            if declared > limit {
                return Err(Error::Transfer(format!(
                    "{} is {} bytes, over the {} byte limit",
                    meta.filename, declared, limit
                )));
            }
        }

        let name = sanitize_filename(&meta.filename, meta.content_type.as_deref());
        let (local_name, path, file) = self.claim(dir, &name).await?;
        let partial = PartialFile::new(path.clone());

        let size = timeout(
            self.settings.transfer_timeout,
            Self::transfer(backend, meta, file, limit),
        )
        .await
        .map_err(|_| {
            Error::timeout(
                format!("download of {}", meta.filename),
                self.settings.transfer_timeout,
            )
        })??;
        partial.keep();

        let record = AttachmentRecord {
            key: key.clone(),
            remote_id: Some(meta.id.clone()),
            remote_filename: meta.filename.clone(),
            extension: extension_of(&local_name).or_else(|| {
                meta.content_type
                    .as_deref()
                    .and_then(extension_for_content_type)
                    .map(str::to_string)
            }),
            local_name: local_name.clone(),
            size,
            content_type: meta.content_type.clone(),
            path,
            downloaded_at: Utc::now(),
            backend: backend.label().to_string(),
        };

        self.index
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .insert(local_name.clone(), record.clone());

        self.observer.record(CoreEvent::AttachmentStored {
            key: key.clone(),
            filename: local_name,
            bytes: size,
            backend: record.backend.clone(),
        });
        Ok(record)
    }

    /// A live record for the same remote attachment. Records rebuilt from
    /// disk carry no remote id and are matched by sanitized name and size.
    async fn reusable_record(&self, key: &TicketKey, meta: &AttachmentMeta) -> Option<AttachmentRecord> {
        let candidate = {
            let index = self.index.read().await;
            let records = index.get(key)?;
            records
                .values()
                .find(|r| r.remote_id.as_deref() == Some(meta.id.as_str()))
                .or_else(|| {
                    let name = sanitize_filename(&meta.filename, meta.content_type.as_deref());
                    records
                        .get(&name)
                        .filter(|r| r.remote_id.is_none() && meta.size == Some(r.size))
                })
                .cloned()?
        };

        let on_disk = fs::symlink_metadata(&candidate.path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);

        let mut index = self.index.write().await;
        let records = index.get_mut(key)?;
        if !on_disk {
            records.remove(&candidate.local_name);
            return None;
        }
        let record = records.get_mut(&candidate.local_name)?;
        if record.remote_id.is_none() {
            record.remote_id = Some(meta.id.clone());
            record.remote_filename = meta.filename.clone();
            record.content_type = meta.content_type.clone();
        }
        Some(record.clone())
    }

    /// Create a new file for `name`, adding ` (n)` until the name is free
    async fn claim(&self, dir: &Path, name: &str) -> Result<(String, PathBuf, File)> {
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let candidate = if attempt == 1 {
                name.to_string()
            } else {
                with_suffix(name, attempt)
            };
            let path = self.sanitizer.destination(dir, &candidate).await?;
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((candidate, path, file)),
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Transfer(format!(
            "no free filename for {name} after {MAX_NAME_ATTEMPTS} attempts"
        )))
    }

    async fn transfer(
        backend: &RegisteredBackend,
        meta: &AttachmentMeta,
        mut file: File,
        limit: u64,
    ) -> Result<u64> {
        let mut stream = backend.client.download(meta).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > limit {
                return Err(Error::Transfer(format!(
                    "{} exceeded the {} byte limit during transfer",
                    meta.filename, limit
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Look up a stored attachment by local name, then by the sanitized form
    /// of `filename`, then by its original remote name. Never touches disk.
    pub async fn get(&self, key: &TicketKey, filename: &str) -> Result<AttachmentRecord> {
        let index = self.index.read().await;
        let not_found = || Error::NotFound(format!("attachment {filename:?} on {key}"));
        let records = index.get(key).ok_or_else(not_found)?;

        records
            .get(filename)
            .or_else(|| records.get(&sanitize_filename(filename, None)))
            .or_else(|| records.values().find(|r| r.remote_filename == filename))
            .cloned()
            .ok_or_else(not_found)
    }

    /// Records of one ticket, sorted by local name
    pub async fn list(&self, key: &TicketKey) -> Vec<AttachmentRecord> {
        self.index
            .read()
            .await
            .get(key)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn has_records(&self, key: &TicketKey) -> bool {
        self.index
            .read()
            .await
            .get(key)
            .is_some_and(|records| !records.is_empty())
    }

    /// Ticket keys present in the index
    pub async fn indexed_keys(&self) -> Vec<TicketKey> {
        self.index.read().await.keys().cloned().collect()
    }

    /// Delete one ticket's directory, or everything under the root
    pub async fn cleanup(&self, key: Option<&TicketKey>) -> Result<CleanupReport> {
        let result = match key {
            Some(key) => self.cleanup_ticket(key).await,
            None => self.cleanup_all().await,
        };
        let report = result.map_err(|e| self.report_escape(key, e))?;

        self.observer.record(CoreEvent::Cleanup {
            key: key.cloned(),
            tickets: report.tickets,
            files: report.files,
        });
        Ok(report)
    }

    async fn cleanup_ticket(&self, key: &TicketKey) -> Result<CleanupReport> {
        let root = self.sanitizer.canonical_root().await?;
        let dir = root.join(key.as_str());

        let meta = match fs::symlink_metadata(&dir).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                self.index.write().await.remove(key);
                return Ok(CleanupReport::default());
            }
            Err(e) => return Err(e.into()),
        };
        if meta.file_type().is_symlink() || !meta.is_dir() {
            return Err(Error::PathEscape { path: dir });
        }
        let dir = self.sanitizer.ensure_contained(&dir).await?;

        let files = count_files(&dir).await?;
        fs::remove_dir_all(&dir).await?;
        self.index.write().await.remove(key);

        Ok(CleanupReport { tickets: 1, files })
    }

    async fn cleanup_all(&self) -> Result<CleanupReport> {
        let root = self.sanitizer.canonical_root().await?;
        let mut report = CleanupReport::default();

        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = self.sanitizer.ensure_contained(&entry.path()).await?;
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                report.files += count_files(&path).await?;
                fs::remove_dir_all(&path).await?;
                report.tickets += 1;
            } else {
                // Files and symlinks are unlinked, never followed
                fs::remove_file(&path).await?;
                report.files += 1;
            }
        }
        self.index.write().await.clear();

        Ok(report)
    }

    fn report_escape(&self, key: Option<&TicketKey>, error: Error) -> Error {
        if let Error::PathEscape { path } = &error {
            self.observer.record(CoreEvent::PathEscape {
                key: key.cloned(),
                path: path.clone(),
            });
        }
        error
    }
}

/// Count non-directory entries below `dir` without following symlinks
async fn count_files(dir: &Path) -> Result<usize> {
    let mut count = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                pending.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use crate::events::EventLog;
    use crate::registry::{BackendConnection, InstanceRegistry};
    use crate::testing::{FakeBody, FakeJira};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        jira: Arc<FakeJira>,
        events: EventLog,
        store: AttachmentStore,
    }

    fn settings(root: &Path) -> AttachmentSettings {
        AttachmentSettings {
            root: root.to_path_buf(),
            max_attachment_bytes: 1024,
            max_analyze_bytes: 1024,
            max_analyze_files: 20,
            download_concurrency: 4,
            transfer_timeout: Duration::from_millis(500),
        }
    }

    fn router(jira: Arc<FakeJira>) -> KeyRouter {
        let backend = RegisteredBackend {
            connection: Arc::new(BackendConnection::new(
                "primary",
                "jira.example.com",
                Credential::Token("t".into()),
            )),
            client: jira,
        };
        KeyRouter::new(Arc::new(InstanceRegistry::builder().primary(backend).build()))
    }

    async fn harness(jira: FakeJira) -> Harness {
        let dir = tempdir().unwrap();
        let root = dir.path().join("attachments");
        let jira = Arc::new(jira);
        let events = EventLog::new();
        let store = AttachmentStore::open(
            router(jira.clone()),
            settings(&root),
            Arc::new(events.clone()),
        )
        .await
        .unwrap();
        Harness {
            _dir: dir,
            root,
            jira,
            events,
            store,
        }
    }

    fn key(raw: &str) -> TicketKey {
        TicketKey::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_then_get_every_record() {
        let h = harness(
            FakeJira::new()
                .with_attachment("PROJ-1", "1", "log.txt", b"line one\n")
                .with_attachment("PROJ-1", "2", "trace.json", b"{}"),
        )
        .await;

        let report = h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.backend, "primary");

        for record in &report.records {
            let found = h.store.get(&key("PROJ-1"), &record.local_name).await.unwrap();
            assert!(found.path.exists());
            assert_eq!(found.path.parent().unwrap().file_name().unwrap(), "PROJ-1");
        }
        let log = h.store.get(&key("proj-1"), "log.txt").await.unwrap();
        assert_eq!(std::fs::read(&log.path).unwrap(), b"line one\n");
        assert_eq!(log.extension.as_deref(), Some("txt"));
    }

    #[tokio::test]
    async fn test_traversal_filename_stored_under_ticket() {
        let h = harness(FakeJira::new().with_attachment("PROJ-1", "1", "../../etc/passwd", b"root:x")).await;

        let report = h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        let record = &report.records[0];
        let root = std::fs::canonicalize(&h.root).unwrap();
        assert_eq!(record.path, root.join("PROJ-1").join("etc_passwd"));

        // Lookup by the hostile name resolves through the sanitized form
        let found = h.store.get(&key("PROJ-1"), "../../etc/passwd").await.unwrap();
        assert_eq!(found.local_name, "etc_passwd");
    }

    #[tokio::test]
    async fn test_colliding_names_get_distinct_files() {
        let h = harness(
            FakeJira::new()
                .with_attachment("PROJ-1", "1", "a/report.txt", b"first")
                .with_attachment("PROJ-1", "2", "a\\report.txt", b"second")
                .with_attachment("PROJ-1", "3", "a_report.txt", b"third"),
        )
        .await;

        let report = h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        let mut names: Vec<_> = report.records.iter().map(|r| r.local_name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a_report (2).txt", "a_report (3).txt", "a_report.txt"]);

        let mut bodies: Vec<_> = report
            .records
            .iter()
            .map(|r| std::fs::read_to_string(&r.path).unwrap())
            .collect();
        bodies.sort();
        assert_eq!(bodies, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_declared_oversize_rejected_before_transfer() {
        let h = harness(FakeJira::new().with_attachment_body(
            "PROJ-1",
            "9",
            "huge.bin",
            Some(500 * 1024 * 1024),
            FakeBody::Bytes(vec![0; 16]),
        ))
        .await;

        let report = h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        assert!(report.records.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, ErrorKind::Transfer);
        assert!(!report.failures[0].retryable);
        assert_eq!(h.jira.download_count(), 0);
        assert!(!h.root.join("PROJ-1").join("huge.bin").exists());
    }

    #[tokio::test]
    async fn test_undeclared_oversize_stream_aborted() {
        let h = harness(FakeJira::new().with_attachment_body(
            "PROJ-1",
            "9",
            "stream.bin",
            None,
            FakeBody::Bytes(vec![7; 4096]),
        ))
        .await;

        let report = h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        assert_eq!(report.failures[0].kind, ErrorKind::Transfer);
        assert!(!h.root.join("PROJ-1").join("stream.bin").exists());
        assert!(h.store.list(&key("PROJ-1")).await.is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_error_removes_partial_file() {
        let h = harness(
            FakeJira::new()
                .with_attachment_body("PROJ-1", "1", "broken.log", None, FakeBody::FailAfter(b"partial".to_vec()))
                .with_attachment("PROJ-1", "2", "ok.log", b"fine"),
        )
        .await;

        let report = h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].local_name, "ok.log");
        assert_eq!(report.failures[0].filename, "broken.log");
        assert!(!h.root.join("PROJ-1").join("broken.log").exists());
    }

    #[tokio::test]
    async fn test_stalled_transfer_times_out_as_retryable() {
        let h = harness(FakeJira::new().with_attachment_body("PROJ-1", "1", "slow.log", None, FakeBody::Stall)).await;

        let report = h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        let failure = &report.failures[0];
        assert_eq!(failure.kind, ErrorKind::Timeout);
        assert!(failure.retryable);
        assert!(!h.root.join("PROJ-1").join("slow.log").exists());
    }

    #[tokio::test]
    async fn test_stalled_listing_times_out_as_retryable() {
        let h = harness(
            FakeJira::new()
                .with_attachment("PROJ-1", "1", "log.txt", b"abc")
                .with_stalled_listing(),
        )
        .await;

        let err = h.store.fetch_all(&key("PROJ-1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());
        assert!(!h.root.join("PROJ-1").exists());
    }

    #[tokio::test]
    async fn test_refetch_reuses_existing_records() {
        let h = harness(FakeJira::new().with_attachment("PROJ-1", "1", "log.txt", b"abc")).await;

        h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        let again = h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        assert_eq!(again.records.len(), 1);
        assert_eq!(again.records[0].local_name, "log.txt");
        assert_eq!(h.jira.download_count(), 1);
    }

    #[tokio::test]
    async fn test_index_rebuilt_from_disk() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("attachments");
        std::fs::create_dir_all(root.join("PROJ-7")).unwrap();
        std::fs::write(root.join("PROJ-7").join("notes.md"), "# hi").unwrap();
        std::fs::create_dir_all(root.join("not a ticket")).unwrap();
        std::fs::write(root.join("stray.txt"), "x").unwrap();

        let jira = Arc::new(FakeJira::new().with_attachment("PROJ-7", "5", "notes.md", b"# hi"));
        let events = EventLog::new();
        let store = AttachmentStore::open(router(jira.clone()), settings(&root), Arc::new(events.clone()))
            .await
            .unwrap();

        let record = store.get(&key("PROJ-7"), "notes.md").await.unwrap();
        assert_eq!(record.size, 4);
        assert_eq!(record.remote_id, None);
        assert_eq!(store.indexed_keys().await, vec![key("PROJ-7")]);
        assert!(events
            .events()
            .contains(&CoreEvent::IndexRebuilt { tickets: 1, records: 1 }));

        // A matching remote attachment adopts the rebuilt record
        let report = store.fetch_all(&key("PROJ-7")).await.unwrap();
        assert_eq!(report.records[0].remote_id.as_deref(), Some("5"));
        assert_eq!(jira.download_count(), 0);
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let h = harness(FakeJira::new()).await;
        let err = h.store.get(&key("PROJ-1"), "nope.txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_cleanup_one_ticket() {
        let h = harness(
            FakeJira::new()
                .with_attachment("PROJ-1", "1", "a.txt", b"a")
                .with_attachment("PROJ-1", "2", "b.txt", b"b")
                .with_attachment("PROJ-2", "3", "c.txt", b"c"),
        )
        .await;
        h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        h.store.fetch_all(&key("PROJ-2")).await.unwrap();

        let report = h.store.cleanup(Some(&key("PROJ-1"))).await.unwrap();
        assert_eq!(report, CleanupReport { tickets: 1, files: 2 });
        assert!(!h.root.join("PROJ-1").exists());
        assert!(h.root.join("PROJ-2").join("c.txt").exists());
        assert!(h.store.list(&key("PROJ-1")).await.is_empty());
        assert_eq!(h.store.list(&key("PROJ-2")).await.len(), 1);

        let again = h.store.cleanup(Some(&key("PROJ-1"))).await.unwrap();
        assert_eq!(again, CleanupReport::default());
    }

    #[tokio::test]
    async fn test_cleanup_everything() {
        let h = harness(
            FakeJira::new()
                .with_attachment("PROJ-1", "1", "a.txt", b"a")
                .with_attachment("PROJ-2", "2", "b.txt", b"b"),
        )
        .await;
        h.store.fetch_all(&key("PROJ-1")).await.unwrap();
        h.store.fetch_all(&key("PROJ-2")).await.unwrap();
        std::fs::write(h.root.join("stray.txt"), "x").unwrap();

        let report = h.store.cleanup(None).await.unwrap();
        assert_eq!(report, CleanupReport { tickets: 2, files: 3 });
        assert_eq!(std::fs::read_dir(&h.root).unwrap().count(), 0);
        assert!(h.store.indexed_keys().await.is_empty());
        assert!(h.events.events().iter().any(|e| matches!(e, CoreEvent::Cleanup { key: None, .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cleanup_everything_through_linked_root() {
        let dir = tempdir().unwrap();
        let real_root = dir.path().join("real");
        std::fs::create_dir_all(real_root.join("PROJ-1")).unwrap();
        std::fs::write(real_root.join("PROJ-1").join("a.txt"), "a").unwrap();
        let linked_root = dir.path().join("linked");
        std::os::unix::fs::symlink(&real_root, &linked_root).unwrap();

        let jira = Arc::new(FakeJira::new());
        let store = AttachmentStore::open(router(jira), settings(&linked_root), Arc::new(EventLog::new()))
            .await
            .unwrap();

        let report = store.cleanup(None).await.unwrap();
        assert_eq!(report, CleanupReport { tickets: 1, files: 1 });
        assert_eq!(std::fs::read_dir(&real_root).unwrap().count(), 0);
        assert!(linked_root.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cleanup_never_follows_symlinks() {
        let h = harness(FakeJira::new()).await;
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("keep.txt"), "precious").unwrap();
        std::fs::create_dir_all(&h.root).unwrap();
        std::os::unix::fs::symlink(outside.path(), h.root.join("PROJ-9")).unwrap();

        let err = h.store.cleanup(Some(&key("PROJ-9"))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathEscape);
        assert!(h.events.events().iter().any(|e| matches!(e, CoreEvent::PathEscape { .. })));

        h.store.cleanup(None).await.unwrap();
        assert!(outside.path().join("keep.txt").exists());
        assert!(!h.root.join("PROJ-9").exists());
    }
}
