mod business;
mod health;
mod observability;

pub use business::{create_lead, get_report, receive_webhook};
pub use health::{health_check, readiness_check};
pub use observability::{list_violations, slo_report};
