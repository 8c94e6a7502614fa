//! Tool facade
//!
//! [`JiraService`] implements every tool operation on top of the router,
//! the attachment store and the analysis dispatcher. Operations that touch
//! a ticket's attachments are serialized per ticket key; a global cleanup
//! excludes all of them.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::analysis::{Analysis, AnalysisDispatcher};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventObserver;
use crate::extract::{ContentKind, TextExtractor, PDFTOTEXT_TIMEOUT};
use crate::jira::TicketDetails;
use crate::llm::{CompletionClient, OllamaClient};
use crate::registry::InstanceRegistry;
use crate::router::KeyRouter;
use crate::store::{AttachmentRecord, AttachmentStore, FetchReport};
use crate::ticket_key::TicketKey;

pub struct JiraService {
    router: KeyRouter,
    store: AttachmentStore,
    dispatcher: AnalysisDispatcher,
    max_analyze_files: usize,
    jira_timeout: Duration,
    gate: RwLock<()>,
    locks: std::sync::Mutex<HashMap<TicketKey, Arc<Mutex<()>>>>,
}

impl JiraService {
    pub fn new(
        router: KeyRouter,
        store: AttachmentStore,
        dispatcher: AnalysisDispatcher,
        max_analyze_files: usize,
        jira_timeout: Duration,
    ) -> Self {
        Self {
            router,
            store,
            dispatcher,
            max_analyze_files,
            jira_timeout,
            gate: RwLock::new(()),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Wire up HTTP collaborators from the loaded configuration
    pub async fn from_config(config: &Config, observer: Arc<dyn EventObserver>) -> Result<Self> {
        let registry = Arc::new(InstanceRegistry::from_config(config)?);
        let router = KeyRouter::new(registry);
        let store =
            AttachmentStore::open(router.clone(), config.attachments.clone(), observer.clone())
                .await?;

        let completion: Arc<dyn CompletionClient> =
            Arc::new(OllamaClient::new(config.ollama.clone())?);
        let extractor = TextExtractor::new(
            &config.pdftotext_bin,
            PDFTOTEXT_TIMEOUT,
            config.attachments.max_analyze_bytes,
        );
        let dispatcher = AnalysisDispatcher::new(completion, extractor, observer);

        Ok(Self::new(
            router,
            store,
            dispatcher,
            config.attachments.max_analyze_files,
            config.jira_timeout,
        ))
    }

    pub fn attachments_root(&self) -> PathBuf {
        self.store.sanitizer().root().to_path_buf()
    }

    pub fn store(&self) -> &AttachmentStore {
        &self.store
    }

    pub async fn completion_available(&self) -> bool {
        self.dispatcher.completion_available().await
    }

    /// Lock for one ticket. Entries no caller holds any more are dropped so
    /// the table only grows with concurrently active tickets.
    fn key_lock(&self, key: &TicketKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        locks.entry(key.clone()).or_default().clone()
    }

    async fn bounded<T, F>(&self, operation: String, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.jira_timeout, fut)
            .await
            .map_err(|_| Error::timeout(operation, self.jira_timeout))?
    }

    async fn details(&self, key: &TicketKey) -> Result<TicketDetails> {
        let backend = self.router.resolve(key)?;
        self.bounded(format!("Jira issue {key}"), backend.client.ticket(key))
            .await
    }

    /// List tickets assigned to the current user on every backend. A failing
    /// backend contributes an error line instead of failing the call.
    pub async fn get_my_tickets(&self) -> Result<String> {
        let mut out = String::new();
        for backend in self.router.registry().backends() {
            let label = backend.label();
            let listing = async {
                let user = backend.client.current_user().await?;
                let tickets = backend.client.my_tickets().await?;
                Ok::<_, Error>((user, tickets))
            };

            match self.bounded(format!("Jira search on {label}"), listing).await {
                Ok((user, tickets)) if tickets.is_empty() => {
                    let _ = writeln!(out, "No tickets assigned to {} in {}.\n", user.display_name, label);
                }
                Ok((user, tickets)) => {
                    let _ = writeln!(out, "Your assigned tickets in {} ({}):", label, user.display_name);
                    for t in tickets {
                        let _ = writeln!(out, "- {}: {} ({})", t.key, t.summary, t.status);
                    }
                    out.push('\n');
                }
                Err(e) => {
                    warn!(backend = %label, error = %e, "Failed to list assigned tickets");
                    let _ = writeln!(out, "Error retrieving tickets from {}: {}\n", label, e);
                }
            }
        }

        if out.is_empty() {
            return Err(Error::Configuration(
                "no Jira instance is configured".to_string(),
            ));
        }
        Ok(out.trim_end().to_string())
    }

    pub async fn get_ticket_details(&self, raw_key: &str) -> Result<String> {
        let key = TicketKey::parse(raw_key)?;
        Ok(self.details(&key).await?.render())
    }

    pub async fn summarize_ticket(&self, raw_key: &str) -> Result<String> {
        let key = TicketKey::parse(raw_key)?;
        let details = self.details(&key).await?;
        let analysis = self.dispatcher.summarize(&details.render()).await?;
        Ok(with_note(format!("Summary of {}:\n\n{}", key, analysis.text), &analysis))
    }

    pub async fn analyze_ticket(&self, raw_key: &str, question: &str) -> Result<String> {
        let key = TicketKey::parse(raw_key)?;
        if question.trim().is_empty() {
            return Err(Error::Validation("question must not be empty".to_string()));
        }
        let details = self.details(&key).await?;
        let analysis = self.dispatcher.analyze(&details.render(), question).await?;
        Ok(with_note(
            format!("Analysis of {}:\n\n{}", key, analysis.text),
            &analysis,
        ))
    }

    /// Download every attachment and report what is stored
    pub async fn get_ticket_attachments(&self, raw_key: &str) -> Result<String> {
        let key = TicketKey::parse(raw_key)?;
        let _gate = self.gate.read().await;
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let report = self.store.fetch_all(&key).await?;
        Ok(render_fetch(&report))
    }

    /// Analyze one stored attachment, downloading the ticket's attachments
    /// first if nothing is stored for it yet.
    pub async fn analyze_attachment(
        &self,
        raw_key: &str,
        filename: &str,
        question: Option<&str>,
    ) -> Result<String> {
        let key = TicketKey::parse(raw_key)?;
        if filename.trim().is_empty() {
            return Err(Error::Validation("filename must not be empty".to_string()));
        }
        let _gate = self.gate.read().await;
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        if !self.store.has_records(&key).await {
            info!(key = %key, "No stored attachments yet, fetching");
            self.store.fetch_all(&key).await?;
        }
        let record = self.store.get(&key, filename).await?;
        let analysis = self.dispatcher.analyze_attachment(&record, question).await?;

        Ok(with_note(
            format!(
                "Analysis of attachment '{}' from {}:\n\n{}",
                record.local_name, key, analysis.text
            ),
            &analysis,
        ))
    }

    pub async fn analyze_all_attachments(&self, raw_key: &str, question: Option<&str>) -> Result<String> {
        let key = TicketKey::parse(raw_key)?;
        let _gate = self.gate.read().await;
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        if !self.store.has_records(&key).await {
            info!(key = %key, "No stored attachments yet, fetching");
            self.store.fetch_all(&key).await?;
        }

        let records = self.store.list(&key).await;
        if records.is_empty() {
            return Ok(format!("No attachments found for ticket {key}."));
        }
        if records.len() > self.max_analyze_files {
            return Err(Error::Validation(format!(
                "too many attachments ({}) on {}; at most {} can be analyzed at once",
                records.len(),
                key,
                self.max_analyze_files
            )));
        }

        let (supported, unsupported): (Vec<AttachmentRecord>, Vec<AttachmentRecord>) = records
            .into_iter()
            .partition(|r| ContentKind::of(r).is_supported());
        if supported.is_empty() {
            return Ok(format!(
                "No supported attachments found for ticket {key}. Only text files and PDFs are supported."
            ));
        }

        let mut out = format!("Analysis of all attachments for {key}:\n");
        for record in &supported {
            let _ = write!(out, "\n--- {} ---\n", record.local_name);
            match self.dispatcher.analyze_attachment(record, question).await {
                Ok(analysis) => {
                    out.push_str(&analysis.text);
                    if let Some(note) = analysis.truncation_note() {
                        let _ = write!(out, "\n\n{note}");
                    }
                    out.push('\n');
                }
                Err(e) => {
                    warn!(key = %key, filename = %record.local_name, error = %e, "Attachment analysis failed");
                    let _ = writeln!(out, "Error: {e}");
                }
            }
        }

        if !unsupported.is_empty() {
            out.push_str("\nUnsupported files (not analyzed):\n");
            for record in &unsupported {
                let _ = writeln!(out, "- {}", record.local_name);
            }
        }
        Ok(out.trim_end().to_string())
    }

    pub async fn cleanup_attachments(&self, raw_key: Option<&str>) -> Result<String> {
        let raw_key = raw_key.map(str::trim).filter(|k| !k.is_empty());
        match raw_key {
            Some(raw) => {
                let key = TicketKey::parse(raw)?;
                let _gate = self.gate.read().await;
                let lock = self.key_lock(&key);
                let _guard = lock.lock().await;

                let report = self.store.cleanup(Some(&key)).await?;
                if report.tickets == 0 {
                    return Ok(format!(
                        "No attachments found for ticket {key}. Nothing to clean up."
                    ));
                }
                Ok(format!(
                    "Deleted {} attachment file(s) for ticket {}.",
                    report.files, key
                ))
            }
            None => {
                let _gate = self.gate.write().await;
                let report = self.store.cleanup(None).await?;
                let root = self.attachments_root();
                if report.tickets == 0 && report.files == 0 {
                    return Ok(format!("Nothing to clean up in {}.", root.display()));
                }
                Ok(format!(
                    "Deleted {} file(s) across {} ticket(s) from {}.",
                    report.files,
                    report.tickets,
                    root.display()
                ))
            }
        }
    }
}

fn render_fetch(report: &FetchReport) -> String {
    if report.records.is_empty() && report.failures.is_empty() {
        return format!("No attachments found for ticket {}.", report.key);
    }

    let mut out = String::new();
    if !report.records.is_empty() {
        let dir = report.records[0]
            .path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "Stored {} attachment(s) from ticket {} ({}).\nLocation: {}",
            report.records.len(),
            report.key,
            report.backend,
            dir
        );
        for record in &report.records {
            let _ = writeln!(out, "- {} ({} bytes)", record.local_name, record.size);
        }
    }
    if !report.failures.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(out, "Failed to download {} attachment(s):", report.failures.len());
        for failure in &report.failures {
            let _ = writeln!(
                out,
                "- {}: [{}{}] {}",
                failure.filename,
                failure.kind,
                if failure.retryable { ", retryable" } else { "" },
                failure.message
            );
        }
    }
    out.trim_end().to_string()
}

fn with_note(mut text: String, analysis: &Analysis) -> String {
    if let Some(note) = analysis.truncation_note() {
        text.push_str("\n\n");
        text.push_str(&note);
    }
    text
}
