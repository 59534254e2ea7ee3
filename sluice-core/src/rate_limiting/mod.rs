mod limiter;
mod registry;

pub use limiter::{RateLimitDecision, SlidingWindowLimiter};
pub use registry::RateLimiterRegistry;
