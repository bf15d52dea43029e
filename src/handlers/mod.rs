mod account;
mod consultations;
mod health;
mod resources;

pub use account::me;
pub use consultations::create_consultation;
pub use health::{HealthInfo, health_check};
pub use resources::list_resources;
