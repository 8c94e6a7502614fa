//! In-memory collaborators for tests

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::analysis::AnalysisDispatcher;
use crate::config::{AttachmentSettings, Credential};
use crate::error::{Error, Result};
use crate::events::{EventLog, EventObserver};
use crate::extract::TextExtractor;
use crate::jira::{AttachmentMeta, ByteStream, JiraBackend, JiraUser, TicketDetails, TicketSummary};
use crate::llm::{CompletionClient, CompletionRequest};
use crate::registry::{BackendConnection, InstanceRegistry, RegisteredBackend};
use crate::router::KeyRouter;
use crate::service::JiraService;
use crate::store::AttachmentStore;
use crate::ticket_key::TicketKey;

const CHUNK: usize = 256;

/// Body served for one fake attachment
#[derive(Debug, Clone)]
pub enum FakeBody {
    Bytes(Vec<u8>),
    /// Yields the bytes, then a transfer error
    FailAfter(Vec<u8>),
    /// Never yields
    Stall,
}

#[derive(Debug, Clone)]
struct FakeAttachment {
    meta: AttachmentMeta,
    body: FakeBody,
}

/// Scriptable [`JiraBackend`]
#[derive(Default)]
pub struct FakeJira {
    user: Option<JiraUser>,
    tickets: HashMap<String, TicketDetails>,
    attachments: HashMap<String, Vec<FakeAttachment>>,
    unavailable: bool,
    stalled_listing: bool,
    downloads: AtomicUsize,
}

impl FakeJira {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, name: &str, display_name: &str) -> Self {
        self.user = Some(JiraUser {
            name: name.to_string(),
            display_name: display_name.to_string(),
        });
        self
    }

    /// Every call fails with a retryable backend error
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Attachment listings never answer
    pub fn with_stalled_listing(mut self) -> Self {
        self.stalled_listing = true;
        self
    }

    pub fn with_ticket(mut self, details: TicketDetails) -> Self {
        self.tickets.insert(details.key.to_ascii_uppercase(), details);
        self
    }

    /// Attachment whose declared size matches its body
    pub fn with_attachment(self, key: &str, id: &str, filename: &str, body: &[u8]) -> Self {
        let size = Some(body.len() as u64);
        self.with_attachment_body(key, id, filename, size, FakeBody::Bytes(body.to_vec()))
    }

    pub fn with_attachment_body(
        mut self,
        key: &str,
        id: &str,
        filename: &str,
        declared_size: Option<u64>,
        body: FakeBody,
    ) -> Self {
        let meta = AttachmentMeta {
            id: id.to_string(),
            filename: filename.to_string(),
            size: declared_size,
            content_type: None,
            content_url: format!("https://jira.example.com/secure/attachment/{id}/{filename}"),
        };
        self.attachments
            .entry(key.to_ascii_uppercase())
            .or_default()
            .push(FakeAttachment { meta, body });
        self
    }

    /// Number of download streams opened so far
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::backend("jira", "connection refused", true));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JiraBackend for FakeJira {
    async fn current_user(&self) -> Result<JiraUser> {
        self.check_available()?;
        Ok(self.user.clone().unwrap_or_else(|| JiraUser {
            name: "tester".to_string(),
            display_name: "Test User".to_string(),
        }))
    }

    async fn my_tickets(&self) -> Result<Vec<TicketSummary>> {
        self.check_available()?;
        let mut tickets: Vec<TicketSummary> = self
            .tickets
            .values()
            .map(|t| TicketSummary {
                key: t.key.clone(),
                summary: t.summary.clone(),
                status: t.status.clone(),
            })
            .collect();
        tickets.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(tickets)
    }

    async fn ticket(&self, key: &TicketKey) -> Result<TicketDetails> {
        self.check_available()?;
        self.tickets
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("issue {key}")))
    }

    async fn attachments(&self, key: &TicketKey) -> Result<Vec<AttachmentMeta>> {
        self.check_available()?;
        if self.stalled_listing {
            std::future::pending::<()>().await;
        }
        Ok(self
            .attachments
            .get(key.as_str())
            .map(|list| list.iter().map(|a| a.meta.clone()).collect())
            .unwrap_or_default())
    }

    async fn download(&self, attachment: &AttachmentMeta) -> Result<ByteStream> {
        self.check_available()?;
        let body = self
            .attachments
            .values()
            .flatten()
            .find(|a| a.meta.id == attachment.id)
            .map(|a| a.body.clone())
            .ok_or_else(|| Error::NotFound(format!("attachment {}", attachment.id)))?;
        self.downloads.fetch_add(1, Ordering::SeqCst);

        let chunks = |data: Vec<u8>| -> Vec<Result<Bytes>> {
            data.chunks(CHUNK)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect()
        };
        let stream = match body {
            FakeBody::Bytes(data) => stream::iter(chunks(data)).boxed(),
            FakeBody::FailAfter(data) => {
                let mut items = chunks(data);
                items.push(Err(Error::Transfer("connection reset mid-stream".to_string())));
                stream::iter(items).boxed()
            }
            FakeBody::Stall => stream::pending::<Result<Bytes>>().boxed(),
        };
        Ok(stream)
    }
}

/// Scriptable [`CompletionClient`] that records every request
pub struct FakeCompletion {
    reply: String,
    context_length: u32,
    failing: bool,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeCompletion {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            context_length: 32768,
            failing: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_context_length(mut self, context_length: u32) -> Self {
        self.context_length = context_length;
        self
    }

    /// Every completion fails with a retryable backend error
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CompletionClient for FakeCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if self.failing {
            return Err(Error::backend("ollama", "model not loaded", true));
        }
        Ok(self.reply.clone())
    }

    fn context_length(&self) -> u32 {
        self.context_length
    }

    async fn is_available(&self) -> bool {
        !self.failing
    }
}

/// A service with `jira` as its only (primary) backend, storing attachments
/// under `root`
pub async fn fake_service(
    root: &Path,
    jira: FakeJira,
    completion: Arc<FakeCompletion>,
) -> Result<JiraService> {
    let backend = RegisteredBackend {
        connection: Arc::new(BackendConnection::new(
            "primary",
            "jira.example.com",
            Credential::Token("test-token".into()),
        )),
        client: Arc::new(jira),
    };
    let registry = InstanceRegistry::builder().primary(backend).build();
    let router = KeyRouter::new(Arc::new(registry));
    let events: Arc<dyn EventObserver> = Arc::new(EventLog::new());
    let settings = AttachmentSettings {
        root: root.to_path_buf(),
        max_attachment_bytes: 1024 * 1024,
        max_analyze_bytes: 1024 * 1024,
        max_analyze_files: 20,
        download_concurrency: 4,
        transfer_timeout: Duration::from_secs(5),
    };
    let store = AttachmentStore::open(router.clone(), settings, events.clone()).await?;
    let extractor = TextExtractor::new("pdftotext", Duration::from_secs(5), 1024 * 1024);
    let dispatcher = AnalysisDispatcher::new(completion, extractor, events);
    Ok(JiraService::new(router, store, dispatcher, 20, Duration::from_secs(5)))
}
