use poem::web::Data;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi};
use sluice_core::{ClaimOutcome, Services};

pub struct Api;

#[derive(Object)]
struct ClaimRequest {
    provider: String,
    event_id: String,
    event_type: String,
}

#[derive(Object)]
struct ClaimResult {
    provider: String,
    event_id: String,
    /// Whether the caller should apply the event's side effect
    claimed: bool,
}

#[derive(ApiResponse)]
enum ClaimResponse {
    #[oai(status = 201)]
    Claimed(Json<ClaimResult>),
    #[oai(status = 200)]
    Duplicate(Json<ClaimResult>),
}

#[OpenApi]
impl Api {
    #[oai(path = "/events/claim", method = "post", operation_id = "claim_event")]
    async fn api_claim_event(
        &self,
        services: Data<&Services>,
        body: Json<ClaimRequest>,
    ) -> poem::Result<ClaimResponse> {
        let outcome = services
            .idempotency
            .claim(&body.provider, &body.event_id, &body.event_type)
            .await?;
        let body = body.0;
        let result = ClaimResult {
            provider: body.provider,
            event_id: body.event_id,
            claimed: outcome.should_process(),
        };
        Ok(match outcome {
            ClaimOutcome::Claimed => ClaimResponse::Claimed(Json(result)),
            ClaimOutcome::Duplicate => ClaimResponse::Duplicate(Json(result)),
        })
    }
}
