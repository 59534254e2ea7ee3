use poem_openapi::OpenApi;

pub mod admission;
pub mod events;
pub mod quota;
pub mod rate_limits;

pub fn get() -> impl OpenApi {
    (
        admission::Api,
        rate_limits::Api,
        events::Api,
        quota::Api,
    )
}

/// Seconds for a `Retry-After` header, never zero.
pub(crate) fn retry_after_header(wait_ms: u64) -> u64 {
    wait_ms.div_ceil(1000).max(1)
}
