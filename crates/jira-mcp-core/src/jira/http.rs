//! Jira REST API v2 client

use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AttachmentMeta, ByteStream, JiraBackend, JiraUser, TicketComment, TicketDetails, TicketSummary};
use crate::config::Credential;
use crate::error::{Error, Result};
use crate::registry::BackendConnection;
use crate::ticket_key::TicketKey;

const SERVICE: &str = "jira";
const MY_TICKETS_JQL: &str = "assignee = currentUser() ORDER BY updated DESC";
const MY_TICKETS_LIMIT: u32 = 50;
const DETAIL_FIELDS: &str =
    "summary,status,priority,assignee,reporter,created,updated,description,comment";

/// HTTP implementation of [`JiraBackend`] for one instance
pub struct HttpJiraBackend {
    connection: Arc<BackendConnection>,
    client: Client,
    timeout: Duration,
}

impl HttpJiraBackend {
    pub fn new(connection: Arc<BackendConnection>, timeout: Duration) -> Result<Self> {
        Url::parse(connection.base_url()).map_err(|e| {
            Error::Configuration(format!(
                "{}: invalid Jira host {:?}: {}",
                connection.label(),
                connection.host(),
                e
            ))
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build Jira HTTP client: {e}")))?;

        Ok(Self {
            connection,
            client,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/rest/api/2/{}",
            self.connection.base_url(),
            path.trim_start_matches('/')
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.connection.credential() {
            Credential::Basic { username, password } => request.basic_auth(username, Some(password)),
            Credential::Token(token) => request.bearer_auth(token),
        }
    }

    fn transport_error(&self, operation: &str, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            return Error::timeout(
                format!("Jira {} ({})", operation, self.connection.label()),
                self.timeout,
            );
        }
        Error::backend(
            SERVICE,
            format!("{} on {}: {}", operation, self.connection.label(), error),
            error.is_connect() || error.is_request(),
        )
    }

    fn status_error(&self, operation: &str, status: StatusCode, body: &str) -> Error {
        if status == StatusCode::NOT_FOUND {
            return Error::NotFound(format!("{} on {}", operation, self.connection.label()));
        }
        let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
        let snippet: String = body.chars().take(300).collect();
        Error::backend(
            SERVICE,
            format!(
                "{} on {} failed with status {}: {}",
                operation,
                self.connection.label(),
                status,
                snippet
            ),
            retryable,
        )
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| self.transport_error(operation, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(operation, e))?;

        if !status.is_success() {
            return Err(self.status_error(operation, status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            Error::backend(
                SERVICE,
                format!("{} returned malformed JSON: {}", operation, e),
                false,
            )
        })
    }

    /// Attachment content must be served by the same origin as the API,
    /// otherwise the credentials would leak to a third party.
    fn check_same_origin(&self, content_url: &str) -> Result<Url> {
        let url = Url::parse(content_url)
            .map_err(|e| Error::Validation(format!("invalid attachment URL: {e}")))?;
        let base = Url::parse(self.connection.base_url())
            .map_err(|e| Error::Configuration(format!("invalid Jira base URL: {e}")))?;

        let same = url.scheme() == base.scheme()
            && url.host_str() == base.host_str()
            && url.port_or_known_default() == base.port_or_known_default();
        if !same {
            warn!(
                backend = %self.connection.label(),
                url = %content_url,
                security = true,
                "Refusing attachment URL outside the Jira origin"
            );
            return Err(Error::Validation(format!(
                "attachment URL host {:?} does not match {}",
                url.host_str().unwrap_or(""),
                self.connection.host()
            )));
        }
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUser {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNamed {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSearch {
    #[serde(default)]
    issues: Vec<RawIssue>,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    key: String,
    #[serde(default)]
    fields: RawFields,
}

#[derive(Debug, Default, Deserialize)]
struct RawFields {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    status: Option<RawNamed>,
    #[serde(default)]
    priority: Option<RawNamed>,
    #[serde(default)]
    assignee: Option<RawUser>,
    #[serde(default)]
    reporter: Option<RawUser>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    comment: Option<RawComments>,
    #[serde(default)]
    attachment: Option<Vec<RawAttachment>>,
}

#[derive(Debug, Deserialize)]
struct RawComments {
    #[serde(default)]
    comments: Vec<RawComment>,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    #[serde(default)]
    author: Option<RawUser>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAttachment {
    id: String,
    filename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    mime_type: Option<String>,
    content: String,
}

impl RawUser {
    fn display(&self) -> Option<String> {
        self.display_name
            .clone()
            .or_else(|| self.name.clone())
            .or_else(|| self.account_id.clone())
    }
}

fn named(value: Option<RawNamed>) -> Option<String> {
    value.and_then(|v| v.name)
}

#[async_trait::async_trait]
impl JiraBackend for HttpJiraBackend {
    async fn current_user(&self) -> Result<JiraUser> {
        let request = self.client.get(self.endpoint("myself"));
        let raw: RawUser = self.get_json("myself", request).await?;
        let name = raw
            .name
            .clone()
            .or_else(|| raw.account_id.clone())
            .unwrap_or_default();
        Ok(JiraUser {
            display_name: raw.display().unwrap_or_else(|| name.clone()),
            name,
        })
    }

    async fn my_tickets(&self) -> Result<Vec<TicketSummary>> {
        let request = self.client.get(self.endpoint("search")).query(&[
            ("jql", MY_TICKETS_JQL.to_string()),
            ("fields", "summary,status".to_string()),
            ("maxResults", MY_TICKETS_LIMIT.to_string()),
        ]);
        let raw: RawSearch = self.get_json("search", request).await?;
        debug!(backend = %self.connection.label(), count = raw.issues.len(), "Fetched assigned tickets");

        Ok(raw
            .issues
            .into_iter()
            .map(|issue| TicketSummary {
                key: issue.key,
                summary: issue.fields.summary.unwrap_or_default(),
                status: named(issue.fields.status).unwrap_or_else(|| "Unknown".to_string()),
            })
            .collect())
    }

    async fn ticket(&self, key: &TicketKey) -> Result<TicketDetails> {
        let request = self
            .client
            .get(self.endpoint(&format!("issue/{}", key)))
            .query(&[("fields", DETAIL_FIELDS)]);
        let raw: RawIssue = self.get_json(&format!("issue {}", key), request).await?;
        let fields = raw.fields;

        Ok(TicketDetails {
            key: raw.key,
            summary: fields.summary.unwrap_or_default(),
            status: named(fields.status).unwrap_or_else(|| "Unknown".to_string()),
            priority: named(fields.priority),
            assignee: fields.assignee.and_then(|u| u.display()),
            reporter: fields.reporter.and_then(|u| u.display()),
            created: fields.created.unwrap_or_default(),
            updated: fields.updated.unwrap_or_default(),
            description: fields.description,
            comments: fields
                .comment
                .map(|c| c.comments)
                .unwrap_or_default()
                .into_iter()
                .map(|c| TicketComment {
                    author: c
                        .author
                        .and_then(|u| u.display())
                        .unwrap_or_else(|| "Unknown".to_string()),
                    created: c.created.unwrap_or_default(),
                    body: c.body.unwrap_or_default(),
                })
                .collect(),
        })
    }

    async fn attachments(&self, key: &TicketKey) -> Result<Vec<AttachmentMeta>> {
        let request = self
            .client
            .get(self.endpoint(&format!("issue/{}", key)))
            .query(&[("fields", "attachment")]);
        let raw: RawIssue = self
            .get_json(&format!("attachments of {}", key), request)
            .await?;

        Ok(raw
            .fields
            .attachment
            .unwrap_or_default()
            .into_iter()
            .map(|a| AttachmentMeta {
                id: a.id,
                filename: a.filename,
                size: a.size,
                content_type: a.mime_type,
                content_url: a.content,
            })
            .collect())
    }

    async fn download(&self, attachment: &AttachmentMeta) -> Result<ByteStream> {
        let url = self.check_same_origin(&attachment.content_url)?;
        let operation = format!("download of attachment {}", attachment.id);

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| self.transport_error(&operation, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(&operation, status, &body));
        }

        let label = self.connection.label().to_string();
        let timeout = self.timeout;
        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(format!("Jira attachment stream ({label})"), timeout)
                } else {
                    Error::Transfer(format!("attachment stream from {label} failed: {e}"))
                }
            })
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn backend_for(server: &MockServer, credential: Credential) -> HttpJiraBackend {
        let connection = Arc::new(BackendConnection::new(
            "primary",
            server.base_url(),
            credential,
        ));
        HttpJiraBackend::new(connection, Duration::from_secs(5)).unwrap()
    }

    fn key(raw: &str) -> TicketKey {
        TicketKey::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_ticket_details_with_bearer_auth() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/rest/api/2/issue/PROJ-1")
                    .header("authorization", "Bearer tok");
                then.status(200).json_body(json!({
                    "key": "PROJ-1",
                    "fields": {
                        "summary": "Login fails",
                        "status": {"name": "In Progress"},
                        "priority": {"name": "High"},
                        "assignee": {"name": "jdoe", "displayName": "J. Doe"},
                        "reporter": null,
                        "created": "2024-03-01T10:00:00.000+0000",
                        "updated": "2024-03-02T10:00:00.000+0000",
                        "description": "Stack trace attached",
                        "comment": {"comments": [
                            {"author": {"displayName": "Ann"}, "created": "2024-03-01", "body": "Repro'd"}
                        ]}
                    }
                }));
            })
            .await;

        let backend = backend_for(&server, Credential::Token("tok".into()));
        let details = backend.ticket(&key("PROJ-1")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(details.summary, "Login fails");
        assert_eq!(details.status, "In Progress");
        assert_eq!(details.priority.as_deref(), Some("High"));
        assert_eq!(details.assignee.as_deref(), Some("J. Doe"));
        assert_eq!(details.reporter, None);
        assert_eq!(details.comments.len(), 1);
        assert_eq!(details.comments[0].author, "Ann");
    }

    #[tokio::test]
    async fn test_attachments_and_download_with_basic_auth() {
        let server = MockServer::start_async().await;
        let content_url = server.url("/secure/attachment/10001/log.txt");
        server
            .mock_async(|when, then| {
                when.method(GET).path("/rest/api/2/issue/PROJ-2");
                then.status(200).json_body(json!({
                    "key": "PROJ-2",
                    "fields": {"attachment": [
                        {"id": "10001", "filename": "log.txt", "size": 5, "mimeType": "text/plain", "content": content_url}
                    ]}
                }));
            })
            .await;
        let download = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/secure/attachment/10001/log.txt")
                    .header_exists("authorization");
                then.status(200).body("hello");
            })
            .await;

        let backend = backend_for(
            &server,
            Credential::Basic {
                username: "me".into(),
                password: "pw".into(),
            },
        );
        let attachments = backend.attachments(&key("PROJ-2")).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].size, Some(5));
        assert_eq!(attachments[0].content_type.as_deref(), Some("text/plain"));

        let mut stream = backend.download(&attachments[0]).await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        download.assert_async().await;
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_download_refuses_foreign_origin() {
        let server = MockServer::start_async().await;
        let backend = backend_for(&server, Credential::Token("tok".into()));
        let meta = AttachmentMeta {
            id: "1".into(),
            filename: "x.txt".into(),
            size: None,
            content_type: None,
            content_url: "https://attacker.example.net/steal".into(),
        };
        let err = match backend.download(&meta).await {
            Err(e) => e,
            Ok(_) => panic!("foreign origin accepted"),
        };
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/rest/api/2/issue/PROJ-404");
                then.status(404).body("{}");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/rest/api/2/issue/PROJ-503");
                then.status(503).body("maintenance");
            })
            .await;

        let backend = backend_for(&server, Credential::Token("tok".into()));
        let err = backend.ticket(&key("PROJ-404")).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);

        let err = backend.ticket(&key("PROJ-503")).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Backend);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_my_tickets_and_current_user() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/rest/api/2/myself");
                then.status(200)
                    .json_body(json!({"name": "jdoe", "displayName": "Jane Doe"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/rest/api/2/search")
                    .query_param("jql", MY_TICKETS_JQL);
                then.status(200).json_body(json!({"issues": [
                    {"key": "PROJ-1", "fields": {"summary": "One", "status": {"name": "Open"}}},
                    {"key": "PROJ-2", "fields": {"summary": "Two"}}
                ]}));
            })
            .await;

        let backend = backend_for(&server, Credential::Token("tok".into()));
        let user = backend.current_user().await.unwrap();
        assert_eq!(user.name, "jdoe");
        assert_eq!(user.display_name, "Jane Doe");

        let tickets = backend.my_tickets().await.unwrap();
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[1].status, "Unknown");
    }
}
