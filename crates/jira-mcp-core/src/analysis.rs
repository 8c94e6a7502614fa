//! Analysis Dispatcher
//!
//! Prepares ticket text or extracted attachment content, sizes it to the
//! completion context window and hands it to the [`CompletionClient`].

use serde::Serialize;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventObserver};
use crate::extract::TextExtractor;
use crate::llm::{CompletionClient, CompletionRequest};
use crate::store::AttachmentRecord;

/// Tokens kept free for the instructions and the reply
pub const RESERVED_TOKENS: u32 = 1024;
/// Conservative characters-per-token estimate
pub const CHARS_PER_TOKEN: usize = 3;
/// Smallest content budget used for tiny context windows
const MIN_BUDGET_CHARS: usize = 1024;

pub const TRUNCATION_MARKER: &str = "[... content truncated ...]";

const SUMMARIZE_SYSTEM: &str = "You are a helpful assistant specialized in summarizing Jira tickets. \
Keep your response concise and focus on the most important information.";
const ANALYZE_SYSTEM: &str = "You are a helpful assistant specialized in analyzing Jira tickets. \
Provide specific, accurate answers based only on the information in the ticket.";
const FILE_QUESTION_SYSTEM: &str = "You are a helpful assistant specialized in analyzing document contents. \
Answer the question specifically based on the file content provided.";
const FILE_SUMMARY_SYSTEM: &str = "You are a helpful assistant specialized in analyzing document contents. \
Summarize the key points and important information in the provided file.";

/// A completion together with how much of the input it saw
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub text: String,
    pub truncated: bool,
    pub original_chars: usize,
    pub submitted_chars: usize,
}

impl Analysis {
    /// User-facing caveat for truncated input
    pub fn truncation_note(&self) -> Option<String> {
        self.truncated.then(|| {
            format!(
                "Note: the content was truncated to {} of {} characters to fit the model context; \
the answer may be based on partial content.",
                self.submitted_chars, self.original_chars
            )
        })
    }
}

/// Content cut down to the character budget
#[derive(Debug, Clone, PartialEq)]
pub struct Fitted {
    pub content: String,
    pub truncated: bool,
    pub original_chars: usize,
    pub submitted_chars: usize,
}

/// Character budget for a context window of `context_length` tokens
pub fn content_budget(context_length: u32) -> usize {
    let tokens = context_length.saturating_sub(RESERVED_TOKENS) as usize;
    (tokens * CHARS_PER_TOKEN).max(MIN_BUDGET_CHARS)
}

/// Keep the head of `content` within `budget` characters
pub fn fit_to_budget(content: &str, budget: usize) -> Fitted {
    let original_chars = content.chars().count();
    if original_chars <= budget {
        return Fitted {
            content: content.to_string(),
            truncated: false,
            original_chars,
            submitted_chars: original_chars,
        };
    }

    let cut = content
        .char_indices()
        .nth(budget)
        .map(|(idx, _)| idx)
        .unwrap_or(content.len());
    Fitted {
        content: format!("{}\n\n{}", &content[..cut], TRUNCATION_MARKER),
        truncated: true,
        original_chars,
        submitted_chars: budget,
    }
}

pub struct AnalysisDispatcher {
    completion: Arc<dyn CompletionClient>,
    extractor: TextExtractor,
    observer: Arc<dyn EventObserver>,
}

impl AnalysisDispatcher {
    pub fn new(
        completion: Arc<dyn CompletionClient>,
        extractor: TextExtractor,
        observer: Arc<dyn EventObserver>,
    ) -> Self {
        Self {
            completion,
            extractor,
            observer,
        }
    }

    pub fn extractor(&self) -> &TextExtractor {
        &self.extractor
    }

    pub async fn completion_available(&self) -> bool {
        self.completion.is_available().await
    }

    pub async fn summarize(&self, ticket_text: &str) -> Result<Analysis> {
        self.dispatch("ticket", ticket_text, SUMMARIZE_SYSTEM, |content| {
            format!(
                "Please summarize this Jira ticket in a concise way, focusing on the main issue and solution if available:\n\n{content}"
            )
        })
        .await
    }

    pub async fn analyze(&self, ticket_text: &str, question: &str) -> Result<Analysis> {
        let question = non_empty_question(question)?;
        self.dispatch("ticket", ticket_text, ANALYZE_SYSTEM, |content| {
            format!(
                "Please answer the following question about this Jira ticket:\n\nQuestion: {question}\n\nTicket details:\n{content}"
            )
        })
        .await
    }

    /// Extract the attachment's text and analyze it, answering `question`
    /// when one is given.
    pub async fn analyze_attachment(
        &self,
        record: &AttachmentRecord,
        question: Option<&str>,
    ) -> Result<Analysis> {
        let question = match question.map(str::trim) {
            Some("") | None => None,
            Some(q) => Some(q),
        };
        let content = self.extractor.extract(record).await?;
        let source = format!("{}/{}", record.key, record.local_name);

        match question {
            Some(question) => {
                self.dispatch(&source, &content, FILE_QUESTION_SYSTEM, |content| {
                    format!(
                        "Please analyze the following file and answer this question: {question}\n\nFile content:\n\n{content}"
                    )
                })
                .await
            }
            None => {
                self.dispatch(&source, &content, FILE_SUMMARY_SYSTEM, |content| {
                    format!("Please analyze the following file and provide key insights:\n\n{content}")
                })
                .await
            }
        }
    }

    async fn dispatch<F>(&self, source: &str, content: &str, system: &str, prompt: F) -> Result<Analysis>
    where
        F: FnOnce(&str) -> String,
    {
        let context_length = self.completion.context_length();
        let fitted = fit_to_budget(content, content_budget(context_length));
        if fitted.truncated {
            self.observer.record(CoreEvent::ContentTruncated {
                source: source.to_string(),
                original_chars: fitted.original_chars,
                submitted_chars: fitted.submitted_chars,
            });
        }

        let request = CompletionRequest::new(system, prompt(&fitted.content), context_length);
        let text = self.completion.complete(request).await?;

        Ok(Analysis {
            text,
            truncated: fitted.truncated,
            original_chars: fitted.original_chars,
            submitted_chars: fitted.submitted_chars,
        })
    }
}

fn non_empty_question(question: &str) -> Result<&str> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("question must not be empty".to_string()));
    }
    Ok(trimmed)
}
