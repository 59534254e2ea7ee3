use poem::web::Data;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi};
use sluice_core::Services;

pub struct Api;

#[derive(Object)]
struct RateLimitCheckRequest {
    subject: String,
}

#[derive(Object)]
struct RateLimitResult {
    policy: String,
    allowed: bool,
    remaining: u32,
    retry_after_seconds: u64,
}

#[derive(ApiResponse)]
enum RateLimitCheckResponse {
    #[oai(status = 200)]
    Allowed(Json<RateLimitResult>),
    #[oai(status = 429)]
    Limited(Json<RateLimitResult>, #[oai(header = "Retry-After")] u64),
}

#[OpenApi]
impl Api {
    #[oai(
        path = "/rate-limits/:policy/check",
        method = "post",
        operation_id = "check_rate_limit"
    )]
    async fn api_check_rate_limit(
        &self,
        services: Data<&Services>,
        policy: Path<String>,
        body: Json<RateLimitCheckRequest>,
    ) -> poem::Result<RateLimitCheckResponse> {
        let decision = services.rate_limiters.check(&policy, &body.subject).await?;
        let result = RateLimitResult {
            policy: policy.0,
            allowed: decision.allowed,
            remaining: decision.remaining,
            retry_after_seconds: decision.retry_after_seconds,
        };
        Ok(if decision.allowed {
            RateLimitCheckResponse::Allowed(Json(result))
        } else {
            RateLimitCheckResponse::Limited(Json(result), decision.retry_after_seconds)
        })
    }
}
