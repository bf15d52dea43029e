use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::validation::{FieldRule, Schema};

/// Maximum page size for listing endpoints.
pub const MAX_PAGE_SIZE: u32 = 100;

const DEFAULT_PAGE_SIZE: u32 = 20;

/// Request to open a consultation.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateConsultationRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[serde(default)]
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Whether the client asked for an expedited review.
    #[serde(default)]
    pub urgent: bool,
}

impl CreateConsultationRequest {
    pub fn schema() -> Schema<Self> {
        Schema::new()
            .field(FieldRule::string("title").required().length(Some(1), Some(200)))
            .field(FieldRule::string("description").length(None, Some(5000)))
            .field(FieldRule::string("category").one_of(CATEGORIES))
            .field(FieldRule::boolean("urgent"))
    }
}

/// Consultation categories accepted by the demo endpoints.
pub const CATEGORIES: [&str; 4] = ["family", "employment", "housing", "immigration"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultationResponse {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub urgent: bool,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

/// Paging and filter parameters for `GET /resources`.
#[derive(Debug, Deserialize, Validate)]
pub struct ResourceQuery {
    #[serde(default = "default_page")]
    #[validate(range(min = 1))]
    pub page: u32,
    #[serde(default = "default_page_size")]
    #[validate(range(min = 1, max = 100))]
    pub limit: u32,
    #[serde(default)]
    pub category: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl ResourceQuery {
    pub fn schema() -> Schema<Self> {
        Schema::new()
            .field(FieldRule::integer("page").range(Some(1.0), None))
            .field(FieldRule::integer("limit").range(Some(1.0), Some(f64::from(MAX_PAGE_SIZE))))
            .field(FieldRule::string("category").one_of(CATEGORIES))
    }

    /// Number of items to skip for this page.
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize).saturating_mul(self.limit as usize)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceInfo {
    pub slug: &'static str,
    pub title: &'static str,
    pub category: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePage {
    pub items: Vec<ResourceInfo>,
    pub page: u32,
    pub limit: u32,
    pub total: usize,
}

/// The authenticated caller as returned by `GET /me`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub user_id: String,
    pub email: Option<String>,
    pub role: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status ("healthy")
    pub status: String,
    /// Application version
    pub version: String,
    pub uptime_secs: u64,
    pub rate_limiting: bool,
    pub auth_configured: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_query_offset() {
        let query = ResourceQuery {
            page: 3,
            limit: 10,
            category: None,
        };
        assert_eq!(query.offset(), 20);
    }

    #[test]
    fn test_consultation_validator_rules() {
        let request = CreateConsultationRequest {
            title: String::new(),
            description: None,
            category: None,
            urgent: false,
        };
        let errors = request.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("title"));
    }

    #[test]
    fn test_consultation_response_is_camel_case() {
        let response = ConsultationResponse {
            id: Uuid::new_v4(),
            title: "Lease dispute".to_string(),
            description: None,
            category: Some("housing".to_string()),
            urgent: false,
            owner_id: "u-1".to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ownerId"], "u-1");
        assert!(json.get("createdAt").is_some());
    }
}
