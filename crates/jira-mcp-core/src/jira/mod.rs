//! Jira backend collaborator
//!
//! The core talks to a Jira instance only through [`JiraBackend`]. The
//! production implementation is [`HttpJiraBackend`] (REST API v2).

mod http;

pub use http::HttpJiraBackend;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ticket_key::TicketKey;

/// Attachment content as a fallible stream of chunks
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Number of comments rendered by [`TicketDetails::render`]
pub const RENDERED_COMMENTS: usize = 3;

/// Remote attachment metadata, as listed on the ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub id: String,
    /// Filename as supplied by the remote side. Untrusted.
    pub filename: String,
    /// Declared size, when the backend reports one
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub content_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraUser {
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSummary {
    pub key: String,
    pub summary: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketComment {
    pub author: String,
    pub created: String,
    pub body: String,
}

/// Ticket fields used by the detail, summary and analysis tools
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TicketDetails {
    pub key: String,
    pub summary: String,
    pub status: String,
    pub priority: Option<String>,
    pub assignee: Option<String>,
    pub reporter: Option<String>,
    pub created: String,
    pub updated: String,
    pub description: Option<String>,
    pub comments: Vec<TicketComment>,
}

impl TicketDetails {
    /// Plain-text rendering shared by `get_ticket_details` and the LLM prompts
    pub fn render(&self) -> String {
        let mut out = format!(
            "Ticket: {}\nSummary: {}\nStatus: {}\nPriority: {}\nAssignee: {}\nReporter: {}\nCreated: {}\nUpdated: {}\n\nDescription:\n{}\n",
            self.key,
            self.summary,
            self.status,
            self.priority.as_deref().unwrap_or("Not set"),
            self.assignee.as_deref().unwrap_or("Unassigned"),
            self.reporter.as_deref().unwrap_or("Unknown"),
            self.created,
            self.updated,
            self.description
                .as_deref()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or("No description provided"),
        );

        if self.comments.is_empty() {
            out.push_str("\nNo comments on this ticket.\n");
            return out;
        }

        out.push_str(&format!("\nComments ({}):\n", self.comments.len()));
        for comment in self.comments.iter().take(RENDERED_COMMENTS) {
            out.push_str(&format!(
                "\n--- Comment by {} on {} ---\n{}\n",
                comment.author, comment.created, comment.body
            ));
        }
        if self.comments.len() > RENDERED_COMMENTS {
            out.push_str(&format!(
                "\n[...{} more comments not shown...]\n",
                self.comments.len() - RENDERED_COMMENTS
            ));
        }
        out
    }
}

/// Operations the core needs from one Jira instance
#[async_trait::async_trait]
pub trait JiraBackend: Send + Sync {
    /// The authenticated user
    async fn current_user(&self) -> Result<JiraUser>;

    /// Tickets assigned to the authenticated user
    async fn my_tickets(&self) -> Result<Vec<TicketSummary>>;

    async fn ticket(&self, key: &TicketKey) -> Result<TicketDetails>;

    async fn attachments(&self, key: &TicketKey) -> Result<Vec<AttachmentMeta>>;

    /// Open the content stream of one attachment
    async fn download(&self, attachment: &AttachmentMeta) -> Result<ByteStream>;
}
