//! MCP tool definitions and result envelopes

use jira_mcp_core::Error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        ToolDefinition {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        ToolResult {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: None,
        }
    }

    /// A failed call. The text is a JSON object carrying the error kind and
    /// whether the caller may retry.
    pub fn failure(err: &Error) -> Self {
        let body = json!({
            "error": err.to_string(),
            "kind": err.kind(),
            "retryable": err.is_retryable(),
        });
        ToolResult {
            content: vec![ToolContent::Text {
                text: body.to_string(),
            }],
            is_error: Some(true),
        }
    }

    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// Concatenated text of all content blocks
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .map(|ToolContent::Text { text }| text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn key_property() -> Value {
    json!({
        "type": "string",
        "description": "Ticket key, e.g. PROJ-123. The project prefix selects the Jira instance."
    })
}

fn question_property(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

pub fn all_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "get_my_tickets",
            "List tickets assigned to you on every configured Jira instance",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolDefinition::new(
            "get_ticket_details",
            "Show the fields and latest comments of a ticket",
            json!({
                "type": "object",
                "properties": { "key": key_property() },
                "required": ["key"]
            }),
        ),
        ToolDefinition::new(
            "summarize_ticket",
            "Summarize a ticket with the local language model",
            json!({
                "type": "object",
                "properties": { "key": key_property() },
                "required": ["key"]
            }),
        ),
        ToolDefinition::new(
            "analyze_ticket",
            "Answer a question about a ticket with the local language model",
            json!({
                "type": "object",
                "properties": {
                    "key": key_property(),
                    "question": question_property("Question to answer about the ticket")
                },
                "required": ["key", "question"]
            }),
        ),
        ToolDefinition::new(
            "get_ticket_attachments",
            "Download all attachments of a ticket into the local attachment directory",
            json!({
                "type": "object",
                "properties": { "key": key_property() },
                "required": ["key"]
            }),
        ),
        ToolDefinition::new(
            "analyze_attachment",
            "Analyze one downloaded attachment (text or PDF). Downloads the ticket's attachments first if needed.",
            json!({
                "type": "object",
                "properties": {
                    "key": key_property(),
                    "filename": {
                        "type": "string",
                        "description": "Attachment name as listed by get_ticket_attachments"
                    },
                    "question": question_property("Optional question to focus the analysis")
                },
                "required": ["key", "filename"]
            }),
        ),
        ToolDefinition::new(
            "analyze_all_attachments",
            "Analyze every supported attachment of a ticket",
            json!({
                "type": "object",
                "properties": {
                    "key": key_property(),
                    "question": question_property("Optional question to focus each analysis")
                },
                "required": ["key"]
            }),
        ),
        ToolDefinition::new(
            "cleanup_attachments",
            "Delete downloaded attachments for one ticket, or for all tickets when no key is given",
            json!({
                "type": "object",
                "properties": { "key": key_property() }
            }),
        ),
    ]
}

pub fn get_tool(name: &str) -> Option<ToolDefinition> {
    all_tools().into_iter().find(|t| t.name == name)
}
