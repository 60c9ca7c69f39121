//! Receiver-side hit storage
//!
//! The ingress hands hits to a [`Storage`]. In production that is a
//! [`BatchingStorage`] in front of a [`PublishingStorage`]; the session
//! assembler also uses it to requeue hits whose close failed.

pub mod batching;
pub mod publishing;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::hits::Hit;

pub use batching::BatchingStorage;
pub use publishing::PublishingStorage;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn push(&self, hits: Vec<Hit>) -> Result<(), TaskError>;
}
