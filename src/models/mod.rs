mod api;

pub use api::{
    CATEGORIES, ConsultationResponse, CreateConsultationRequest, HealthResponse, MAX_PAGE_SIZE,
    ProfileResponse, ResourceInfo, ResourcePage, ResourceQuery,
};
