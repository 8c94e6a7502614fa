//! jira-mcp-core - Jira ticket routing and attachment lifecycle
//!
//! Routes ticket keys to the owning Jira instance, downloads attachments
//! into a sandboxed directory tree and hands their content to an LLM for
//! analysis. The MCP server in the `jira-mcp` crate is a thin layer over
//! [`JiraService`].

pub mod analysis;
pub mod config;
pub mod error;
pub mod events;
pub mod extract;
pub mod jira;
pub mod llm;
pub mod registry;
pub mod router;
pub mod sanitize;
pub mod service;
pub mod store;
pub mod ticket_key;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use analysis::{Analysis, AnalysisDispatcher};
pub use config::{Config, Credential};
pub use error::{Error, ErrorKind, Result};
pub use events::{CoreEvent, EventLog, EventObserver};
pub use registry::{BackendConnection, InstanceRegistry, RegisteredBackend};
pub use router::KeyRouter;
pub use sanitize::PathSanitizer;
pub use service::JiraService;
pub use store::{AttachmentRecord, AttachmentStore, CleanupReport, FetchReport};
pub use ticket_key::TicketKey;
