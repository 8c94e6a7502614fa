//! Maps MCP tool calls onto [`JiraService`] operations

use std::sync::Arc;
use jira_mcp_core::{Error, JiraService, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::server::ToolHandler;
use crate::tools::ToolResult;

#[derive(Debug, Deserialize)]
struct KeyArgs {
    key: String,
}

#[derive(Debug, Deserialize)]
struct OptionalKeyArgs {
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuestionArgs {
    key: String,
    question: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentArgs {
    key: String,
    filename: String,
    #[serde(default)]
    question: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AllAttachmentsArgs {
    key: String,
    #[serde(default)]
    question: Option<String>,
}

fn parse<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| Error::Validation(format!("invalid arguments: {e}")))
}

pub struct JiraToolHandler {
    service: Arc<JiraService>,
}

impl JiraToolHandler {
    pub fn new(service: Arc<JiraService>) -> Self {
        Self { service }
    }

    async fn dispatch(&self, name: &str, arguments: Value) -> Result<String> {
        let svc = &self.service;
        match name {
            "get_my_tickets" => svc.get_my_tickets().await,
            "get_ticket_details" => {
                let args: KeyArgs = parse(arguments)?;
                svc.get_ticket_details(&args.key).await
            }
            "summarize_ticket" => {
                let args: KeyArgs = parse(arguments)?;
                svc.summarize_ticket(&args.key).await
            }
            "analyze_ticket" => {
                let args: QuestionArgs = parse(arguments)?;
                svc.analyze_ticket(&args.key, &args.question).await
            }
            "get_ticket_attachments" => {
                let args: KeyArgs = parse(arguments)?;
                svc.get_ticket_attachments(&args.key).await
            }
            "analyze_attachment" => {
                let args: AttachmentArgs = parse(arguments)?;
                svc.analyze_attachment(&args.key, &args.filename, args.question.as_deref())
                    .await
            }
            "analyze_all_attachments" => {
                let args: AllAttachmentsArgs = parse(arguments)?;
                svc.analyze_all_attachments(&args.key, args.question.as_deref())
                    .await
            }
            "cleanup_attachments" => {
                let args: OptionalKeyArgs = parse(arguments)?;
                svc.cleanup_attachments(args.key.as_deref()).await
            }
            other => Err(Error::Validation(format!("unknown tool: {other}"))),
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for JiraToolHandler {
    async fn call(&self, name: &str, arguments: Value) -> ToolResult {
        match self.dispatch(name, arguments).await {
            Ok(text) => {
                debug!(tool = name, chars = text.len(), "Tool call succeeded");
                ToolResult::text(text)
            }
            Err(e) => {
                warn!(tool = name, kind = %e.kind(), retryable = e.is_retryable(), error = %e, "Tool call failed");
                ToolResult::failure(&e)
            }
        }
    }
}
