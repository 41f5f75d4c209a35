//! Bucket primitive used by the throttle engine.
//!
//! The engine keeps one [`ResourceBucket`] per constrained dimension: one for
//! requests and one for consumed units. A bucket knows nothing about the other
//! dimension; combining them is the engine's job.

pub mod resource_bucket;
pub use resource_bucket::BucketState;
pub use resource_bucket::ResourceBucket;
pub use resource_bucket::ResourceBucketConfig;
