use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::ServiceError;
use super::types::{RawStatusPayload, SubmitRequestBody, SubmittedRequest};
use super::{BroadcastChannel, DocumentFetcher, QuotaProvider, StatusQuery, SubmissionService};
use crate::document::{DocumentParameters, GeneratedDocument};
use crate::ids::{DocumentId, RequestId, ScopeId, UserId};
use crate::state_machine::StatusUpdate;
use crate::usage::{RawUsageSnapshot, UsageSnapshot};

/// Buffered push payloads per subscription.
const EVENT_BUFFER: usize = 64;

/// HTTP implementation of every collaborator.
pub struct HttpBackend {
    api_key: Option<String>,
    client: Client,
    // No overall timeout: the event stream stays open for as long as it is needed.
    stream_client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        let stream_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            api_key: api_key.filter(|k| !k.is_empty()),
            client,
            stream_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        what: &str,
    ) -> Result<T, ServiceError> {
        let response = self.authorize(builder).send().await?;
        let response = check_status(response, what).await?;
        response.json::<T>().await.map_err(|err| {
            if err.is_decode() {
                ServiceError::Decode(format!("{what}: {err}"))
            } else {
                ServiceError::Network(err)
            }
        })
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response, ServiceError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(1000);
        return Err(ServiceError::RateLimited {
            retry_after_ms: retry_after,
        });
    }

    if status == StatusCode::NOT_FOUND {
        return Err(ServiceError::NotFound(what.to_string()));
    }

    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(ServiceError::Api {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response)
}

/// Parses one line of the event stream. Accepts bare JSON or SSE `data:` lines.
fn parse_event_line(line: &[u8]) -> Option<RawStatusPayload> {
    let text = std::str::from_utf8(line).ok()?.trim();
    let text = text.strip_prefix("data:").map(str::trim).unwrap_or(text);
    if text.is_empty() || text.starts_with(':') {
        return None;
    }
    match serde_json::from_str::<RawStatusPayload>(text) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(error = %err, "Dropping undecodable event line");
            None
        }
    }
}

#[async_trait]
impl QuotaProvider for HttpBackend {
    async fn usage_snapshot(&self, user: &UserId) -> Result<UsageSnapshot, ServiceError> {
        let raw: RawUsageSnapshot = self
            .fetch_json(
                self.client.get(self.url(&format!("users/{user}/usage"))),
                &format!("usage for {user}"),
            )
            .await?;
        Ok(UsageSnapshot::from(raw))
    }
}

#[async_trait]
impl SubmissionService for HttpBackend {
    async fn submit(
        &self,
        scope: &ScopeId,
        parameters: &DocumentParameters,
    ) -> Result<SubmittedRequest, ServiceError> {
        let body = SubmitRequestBody { parameters };
        self.fetch_json(
            self.client
                .post(self.url(&format!("scopes/{scope}/generations")))
                .json(&body),
            &format!("scope {scope}"),
        )
        .await
    }
}

#[async_trait]
impl StatusQuery for HttpBackend {
    async fn get_status(&self, request: &RequestId) -> Result<StatusUpdate, ServiceError> {
        let raw: RawStatusPayload = self
            .fetch_json(
                self.client.get(self.url(&format!("generations/{request}"))),
                &format!("generation {request}"),
            )
            .await?;
        raw.into_update(Some(request))
            .map_err(|err| ServiceError::Decode(err.to_string()))
    }
}

#[async_trait]
impl DocumentFetcher for HttpBackend {
    async fn get_document(&self, document: &DocumentId) -> Result<GeneratedDocument, ServiceError> {
        self.fetch_json(
            self.client.get(self.url(&format!("documents/{document}"))),
            &format!("document {document}"),
        )
        .await
    }
}

#[async_trait]
impl BroadcastChannel for HttpBackend {
    async fn subscribe(
        &self,
        scope: &ScopeId,
    ) -> Result<mpsc::Receiver<RawStatusPayload>, ServiceError> {
        let builder = self
            .stream_client
            .get(self.url(&format!("scopes/{scope}/events")))
            .header("accept", "application/x-ndjson");
        let response = self.authorize(builder).send().await?;
        let mut response = check_status(response, &format!("events for {scope}")).await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let scope = scope.clone();
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let chunk = tokio::select! {
                    _ = tx.closed() => break,
                    chunk = response.chunk() => chunk,
                };
                match chunk {
                    Ok(Some(bytes)) => {
                        buffer.extend_from_slice(&bytes);
                        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            if let Some(payload) = parse_event_line(&line)
                                && tx.send(payload).await.is_err()
                            {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        if let Some(payload) = parse_event_line(&buffer) {
                            let _ = tx.send(payload).await;
                        }
                        break;
                    }
                    Err(err) => {
                        warn!(scope_id = %scope, error = %err, "Event stream failed");
                        break;
                    }
                }
            }
            debug!(scope_id = %scope, "Event stream reader finished");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::UpdateKind;
    use crate::usage::{Dimension, Limit};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn backend(server: &MockServer) -> HttpBackend {
        HttpBackend::new(server.uri(), Some("secret".into())).unwrap()
    }

    #[tokio::test]
    async fn usage_snapshot_decodes_wire_shape() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/u1/usage"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tier": "free",
                "tokens_used": 1900,
                "max_tokens": 2000,
                "documents_generated": 0,
                "max_documents": -1
            })))
            .mount(&server)
            .await;

        let snapshot = backend(&server)
            .await
            .usage_snapshot(&UserId::new("u1"))
            .await
            .unwrap();
        assert_eq!(snapshot.tier, "free");
        assert_eq!(snapshot.used.get(Dimension::Tokens), Some(1900));
        assert_eq!(snapshot.limits.get(Dimension::Documents), Some(Limit::Unlimited));
        assert_eq!(snapshot.limits.get(Dimension::Sessions), None);
    }

    #[tokio::test]
    async fn rate_limit_maps_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/generations/req-1"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .await
            .get_status(&RequestId::new("req-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::RateLimited {
                retry_after_ms: 3000
            }
        ));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn huge_retry_after_saturates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/generations/req-1"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", u64::MAX.to_string().as_str()),
            )
            .mount(&server)
            .await;

        let err = backend(&server)
            .await
            .get_status(&RequestId::new("req-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::RateLimited {
                retry_after_ms: u64::MAX
            }
        ));
    }

    #[tokio::test]
    async fn status_without_id_uses_requested_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/generations/req-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "COMPLETED",
                "result_document_id": "doc-1"
            })))
            .mount(&server)
            .await;

        let update = backend(&server)
            .await
            .get_status(&RequestId::new("req-1"))
            .await
            .unwrap();
        assert_eq!(update.request_id, RequestId::new("req-1"));
        assert_eq!(
            update.kind,
            UpdateKind::Completed {
                document_id: DocumentId::new("doc-1")
            }
        );
    }

    #[tokio::test]
    async fn server_error_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/doc-1"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .await
            .get_document(&DocumentId::new("doc-1"))
            .await
            .unwrap_err();
        match err {
            ServiceError::Api { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "upstream down");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/doc-404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = backend(&server)
            .await
            .get_document(&DocumentId::new("doc-404"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn submit_posts_tagged_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scopes/consult-1/generations"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "req-42",
                "status": "PENDING"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let submitted = backend(&server)
            .await
            .submit(
                &ScopeId::new("consult-1"),
                &DocumentParameters::SwotAnalysis {
                    subject: "Bike repair shop".into(),
                    context: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(submitted.id, RequestId::new("req-42"));
    }

    #[tokio::test]
    async fn event_stream_yields_each_line() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"request_id\":\"req-1\",\"status\":\"PROCESSING\"}\n",
            "not json\n",
            "\n",
            "data: {\"request_id\":\"req-1\",\"status\":\"COMPLETED\",\"result_document_id\":\"doc-1\"}\n",
        );
        Mock::given(method("GET"))
            .and(path("/scopes/consult-1/events"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let mut rx = backend(&server)
            .await
            .subscribe(&ScopeId::new("consult-1"))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status.as_deref(), Some("PROCESSING"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.result_document_id.as_deref(), Some("doc-1"));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn parse_event_line_skips_comments_and_blanks() {
        assert!(parse_event_line(b"\n").is_none());
        assert!(parse_event_line(b": keepalive\n").is_none());
        assert!(parse_event_line(b"{\"status\":\"PENDING\"}").is_some());
    }
}
