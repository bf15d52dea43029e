//! Consultation endpoints.
//!
//! Only the request shape and ownership are handled here. Storage and
//! assignment live outside this service.

use chrono::Utc;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::{ConsultationResponse, CreateConsultationRequest};
use crate::pipeline::{HandlerInput, Reply};
use crate::validation::NoInput;

/// `POST /consultations`: accept a validated request from an authenticated
/// caller and return it with an ID, status 201.
pub async fn create_consultation(
    mut input: HandlerInput<CreateConsultationRequest, NoInput>,
) -> ApiResult<Reply> {
    let owner_id = input.identity()?.user_id.clone();
    let request = input.take_body()?;

    let consultation = ConsultationResponse {
        id: Uuid::new_v4(),
        title: request.title,
        description: request.description,
        category: request.category,
        urgent: request.urgent,
        owner_id,
        created_at: Utc::now(),
    };

    input
        .logger
        .update_context("consultationId", consultation.id.to_string());
    if consultation.urgent {
        input.logger.info("Urgent consultation requested");
    } else {
        input.logger.debug("Consultation requested");
    }

    Reply::created(consultation)
}
