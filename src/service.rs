//! HTTP boundary
//!
//! Exposes the aggregated fetch result to the presentation layer as
//! `GET /api/emails`. This is the only place attachment bytes are
//! re-encoded into a text-safe transport form; the pipeline itself
//! carries raw bytes. Failures surface as a generic 500 with an error
//! kind; the underlying cause is logged, never returned, so transport
//! and credential detail cannot leak to callers.

use crate::config::MailConfig;
use crate::coordinator::FetchCoordinator;
use crate::error::Result;
use crate::message::{Attachment, EmailRecord};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

/// The service behind the HTTP boundary.
pub struct EmailService {
    coordinator: FetchCoordinator,
}

impl EmailService {
    #[must_use]
    pub fn new(config: MailConfig) -> Self {
        Self {
            coordinator: FetchCoordinator::new(config),
        }
    }

    /// Run one fetch cycle and return the decoded unread messages.
    ///
    /// # Errors
    ///
    /// Propagates the cycle's failure unchanged; mapping to the
    /// generic boundary signal happens in the route handler.
    pub async fn get_unread_emails(&self) -> Result<Vec<EmailRecord>> {
        self.coordinator.fetch_unread().await
    }
}

/// Wire shape of one email record.
#[derive(Debug, Serialize)]
pub struct EmailDto {
    pub from: String,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<AttachmentDto>,
}

/// Wire shape of one attachment: base64 content plus decoded size.
#[derive(Debug, Serialize)]
pub struct AttachmentDto {
    pub filename: Option<String>,
    pub content: String,
    pub size: usize,
}

impl From<&EmailRecord> for EmailDto {
    fn from(record: &EmailRecord) -> Self {
        Self {
            from: record.from.clone(),
            subject: record.subject.clone(),
            text: record.text.clone(),
            attachments: record.attachments.iter().map(AttachmentDto::from).collect(),
        }
    }
}

impl From<&Attachment> for AttachmentDto {
    fn from(attachment: &Attachment) -> Self {
        Self {
            filename: attachment.filename.clone(),
            content: STANDARD.encode(&attachment.content),
            size: attachment.size,
        }
    }
}

/// Build the boundary router.
///
/// CORS is permissive: the consumer is a browser-hosted presentation
/// layer served from a different origin.
pub fn router(service: Arc<EmailService>) -> Router {
    Router::new()
        .route("/api/emails", get(unread_emails))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

async fn unread_emails(State(service): State<Arc<EmailService>>) -> Response {
    match service.get_unread_emails().await {
        Ok(records) => {
            let body: Vec<EmailDto> = records.iter().map(EmailDto::from).collect();
            Json(body).into_response()
        }
        Err(e) => {
            error!("fetch cycle failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.kind() })),
            )
                .into_response()
        }
    }
}
