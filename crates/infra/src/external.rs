//! HTTP adapters for the external collaborators (feature `http`).
//!
//! | Collaborator | Request | Response |
//! |---|---|---|
//! | classifier | `POST {base}/classify` `{ "text" }` | `{ "type", "fields", "confidence" }` |
//! | posting validator | `POST {base}/documents/{id}/posting-validation` `{ "tenantId" }` | `{ "isValid", "errors" }` |
//! | review queue | `POST {base}/review-queue` `{ "tenantId", "documentId", "priority" }` | `{ "routed" }` |

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use docflow_core::{Classification, DocumentId, DocumentKind, TenantId};

use crate::collaborators::{
    ClassifyError, Classifier, CollaboratorError, PostingValidation, PostingValidator,
    ReviewPriority, ReviewRouter,
};

/// Default per-request timeout for collaborator calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn build_client(service: &'static str, timeout: Duration) -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CollaboratorError::Unavailable {
            service,
            message: e.to_string(),
        })
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

async fn post_json<B, R>(
    client: &reqwest::Client,
    service: &'static str,
    url: &str,
    body: &B,
) -> Result<R, CollaboratorError>
where
    B: Serialize + ?Sized,
    R: for<'de> Deserialize<'de>,
{
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| CollaboratorError::Unavailable {
            service,
            message: e.to_string(),
        })?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(CollaboratorError::Unavailable {
            service,
            message: format!("HTTP {}: {}", status.as_u16(), text),
        });
    }

    resp.json::<R>()
        .await
        .map_err(|e| CollaboratorError::InvalidResponse {
            service,
            message: e.to_string(),
        })
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    #[serde(rename = "type", alias = "kind")]
    kind: DocumentKind,
    #[serde(default)]
    fields: Map<String, Value>,
    confidence: f64,
}

/// Classification capability over HTTP.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
}

impl HttpClassifier {
    pub fn new(base_url: &str) -> Result<Self, CollaboratorError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: build_client("classifier", timeout)?,
            url: endpoint(base_url, "classify"),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, payload: &str) -> Result<Classification, ClassifyError> {
        let resp: ClassifyResponse =
            post_json(&self.client, "classifier", &self.url, &ClassifyRequest { text: payload })
                .await
                .map_err(|e| match e {
                    CollaboratorError::InvalidResponse { message, .. } => {
                        ClassifyError::InvalidResult(message)
                    }
                    other => ClassifyError::Failed(other.to_string()),
                })?;

        Ok(Classification::new(resp.kind, resp.fields, resp.confidence))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PostingValidationRequest {
    tenant_id: TenantId,
}

/// Posting validator over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPostingValidator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPostingValidator {
    pub fn new(base_url: &str) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: build_client("posting-validator", DEFAULT_TIMEOUT)?,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl PostingValidator for HttpPostingValidator {
    async fn validate_for_posting(
        &self,
        tenant_id: TenantId,
        document_id: &DocumentId,
    ) -> Result<PostingValidation, CollaboratorError> {
        let url = endpoint(
            &self.base_url,
            &format!("documents/{}/posting-validation", document_id),
        );
        post_json(
            &self.client,
            "posting-validator",
            &url,
            &PostingValidationRequest { tenant_id },
        )
        .await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewRequest<'a> {
    tenant_id: TenantId,
    document_id: &'a DocumentId,
    priority: ReviewPriority,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    routed: bool,
}

/// Review queue over HTTP.
#[derive(Debug, Clone)]
pub struct HttpReviewRouter {
    client: reqwest::Client,
    url: String,
}

impl HttpReviewRouter {
    pub fn new(base_url: &str) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: build_client("review-queue", DEFAULT_TIMEOUT)?,
            url: endpoint(base_url, "review-queue"),
        })
    }
}

#[async_trait]
impl ReviewRouter for HttpReviewRouter {
    async fn route_to_review(
        &self,
        tenant_id: TenantId,
        document_id: &DocumentId,
        priority: ReviewPriority,
    ) -> Result<bool, CollaboratorError> {
        let resp: ReviewResponse = post_json(
            &self.client,
            "review-queue",
            &self.url,
            &ReviewRequest {
                tenant_id,
                document_id,
                priority,
            },
        )
        .await?;
        Ok(resp.routed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_joins_without_double_slashes() {
        assert_eq!(endpoint("http://svc:8080/", "/classify"), "http://svc:8080/classify");
        assert_eq!(endpoint("http://svc:8080", "classify"), "http://svc:8080/classify");
    }

    #[test]
    fn classify_response_accepts_type_key() {
        let resp: ClassifyResponse = serde_json::from_value(json!({
            "type": "receipt",
            "fields": { "total": "4.20" },
            "confidence": 0.82
        }))
        .unwrap();
        assert_eq!(resp.kind, DocumentKind::Receipt);
        assert_eq!(resp.fields.get("total"), Some(&json!("4.20")));
    }

    #[test]
    fn unknown_type_maps_to_unknown_kind() {
        let resp: ClassifyResponse =
            serde_json::from_value(json!({ "kind": "payslip", "confidence": 0.5 })).unwrap();
        assert_eq!(resp.kind, DocumentKind::Unknown);
        assert!(resp.fields.is_empty());
    }

    #[test]
    fn review_request_is_camel_case() {
        let id = DocumentId::parse("doc-1").unwrap();
        let body = serde_json::to_value(ReviewRequest {
            tenant_id: TenantId::new(),
            document_id: &id,
            priority: ReviewPriority::Urgent,
        })
        .unwrap();
        assert_eq!(body["documentId"], json!("doc-1"));
        assert_eq!(body["priority"], json!("urgent"));
    }
}
