//! SMS send and lookup endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{SmsId, UserId};
use domain::SmsMessage;
use saga::CreateOutcome;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct SendSmsRequest {
    pub user_id: String,
    pub receiver: String,
    pub content: String,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct SendSmsResponse {
    pub id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SmsResponse {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub receiver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SmsMessage> for SmsResponse {
    fn from(sms: SmsMessage) -> Self {
        Self {
            id: sms.id().to_string(),
            user_id: sms.user_id().to_string(),
            content: sms.content().to_string(),
            receiver: sms.receiver().to_string(),
            provider: sms.provider().map(str::to_string),
            status: sms.status().to_string(),
            delivered_at: sms.delivered_at(),
            failure_code: sms.failure_code().map(str::to_string),
            created_at: sms.created_at(),
            updated_at: sms.updated_at(),
        }
    }
}

// -- Handlers --

/// POST /sms: accept an SMS and start billing for it.
#[tracing::instrument(skip(state, payload))]
pub async fn send(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SendSmsRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SendSmsResponse>), ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;

    let sms = SmsMessage::new(UserId::new(req.user_id), req.receiver, req.content)?;
    let (code, message) = match state.saga.create_and_bill_sms(&sms).await? {
        CreateOutcome::Billed => (StatusCode::CREATED, "SMS queued for processing"),
        CreateOutcome::BillingDeferred => (
            StatusCode::ACCEPTED,
            "SMS accepted, billing will be retried",
        ),
    };

    let response = SendSmsResponse {
        id: sms.id().to_string(),
        status: sms.status().to_string(),
        created_at: sms.created_at(),
        message,
    };
    Ok((code, Json(response)))
}

/// GET /sms/{id}: load an SMS by id.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SmsResponse>, ApiError> {
    let id: SmsId = id
        .parse()
        .map_err(|e: common::ParseSmsIdError| ApiError::InvalidRequest(e.to_string()))?;

    let sms = state.saga.get_sms(id).await?;

    Ok(Json(SmsResponse::from(sms)))
}
