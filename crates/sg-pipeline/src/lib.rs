//! # Shotgun evaluation pipeline
//!
//! A fixed pool of worker threads sits between a bounded request queue and a
//! bounded result queue. Each worker consults the shared
//! [`ResultCache`](sg_cache::ResultCache) before calling the evaluator, and
//! every request yields exactly one result carrying the request's
//! [`CorrelationToken`]. A router thread hands results back to the
//! [`Requester`] that issued them.

pub mod cancel;
pub mod message;
pub mod pipeline;
pub mod requester;
pub mod stats;
pub mod token;
mod worker;

pub use cancel::CancelSignal;
pub use message::{EvaluationRequest, EvaluationResult};
pub use pipeline::EvaluationPipeline;
pub use requester::Requester;
pub use stats::{PipelineStats, PipelineStatsSnapshot};
pub use token::{CorrelationToken, IdGenerator, RequesterId};
