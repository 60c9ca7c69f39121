pub mod health;
pub mod hits;
pub mod metrics_handler;
