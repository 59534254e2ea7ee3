pub mod api;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use poem::listener::TcpListener;
use poem::{Endpoint, EndpointExt, Route, Server};
use poem_openapi::{OpenApi, OpenApiService};
use sluice_core::Services;
use tracing::*;

pub fn openapi_service() -> OpenApiService<impl OpenApi, ()> {
    OpenApiService::new(api::get(), "Sluice", env!("CARGO_PKG_VERSION")).server("/api")
}

pub struct ApiServer {
    services: Services,
}

impl ApiServer {
    pub fn new(services: &Services) -> Self {
        ApiServer {
            services: services.clone(),
        }
    }

    pub fn endpoint(&self) -> impl Endpoint {
        Route::new()
            .nest("/api", openapi_service())
            .data(self.services.clone())
    }

    pub async fn run(self, address: SocketAddr) -> Result<()> {
        let app = self.endpoint();
        info!(?address, "Listening");
        Server::new(TcpListener::bind(address))
            .run(app)
            .await
            .context("Failed to start API server")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use poem::http::StatusCode;
    use poem::test::TestClient;
    use serde_json::json;
    use sluice_common::{
        QuotaConfig, RateLimitPolicyConfig, ResourceClassConfig, SluiceConfig, SluiceConfigStore,
        StoreBackend, StoreConfig,
    };

    use super::*;

    async fn client() -> TestClient<impl Endpoint> {
        let config = SluiceConfig {
            store: SluiceConfigStore {
                store: StoreConfig {
                    backend: StoreBackend::Memory,
                    ..Default::default()
                },
                resource_classes: vec![ResourceClassConfig {
                    name: "compile".to_owned(),
                    limit: 1,
                    lease_ttl: Duration::from_secs(300),
                    stale_after: Duration::from_secs(900),
                }],
                rate_limits: BTreeMap::from([(
                    "generate".to_owned(),
                    RateLimitPolicyConfig {
                        limit: 1,
                        window: Duration::from_secs(60),
                    },
                )]),
                quota: QuotaConfig {
                    subject_cap: 100,
                    scope_cap: 5,
                    scope_caps: BTreeMap::new(),
                },
                ..Default::default()
            },
            paths_relative_to: PathBuf::from("."),
        };
        let services = Services::new(config).await.unwrap();
        TestClient::new(ApiServer::new(&services).endpoint())
    }

    #[tokio::test]
    async fn test_lease_lifecycle() {
        let cli = client().await;

        let resp = cli
            .post("/api/admission/compile/leases")
            .body_json(&json!({ "owner": "u1" }))
            .send()
            .await;
        resp.assert_status(StatusCode::CREATED);
        let lease_id = resp
            .json()
            .await
            .value()
            .object()
            .get("lease_id")
            .string()
            .to_owned();

        let resp = cli
            .post("/api/admission/compile/leases")
            .body_json(&json!({ "owner": "u2" }))
            .send()
            .await;
        resp.assert_status(StatusCode::TOO_MANY_REQUESTS);
        resp.assert_header("Retry-After", "300");

        cli.post(format!("/api/leases/{lease_id}/renew"))
            .send()
            .await
            .assert_status_is_ok();

        cli.delete(format!("/api/leases/{lease_id}"))
            .send()
            .await
            .assert_status(StatusCode::NO_CONTENT);
        // releasing twice is harmless
        cli.delete(format!("/api/leases/{lease_id}"))
            .send()
            .await
            .assert_status(StatusCode::NO_CONTENT);

        cli.post(format!("/api/leases/{lease_id}/renew"))
            .send()
            .await
            .assert_status(StatusCode::NOT_FOUND);

        let resp = cli.get("/api/admission/compile").send().await;
        resp.assert_status_is_ok();
        resp.json()
            .await
            .value()
            .object()
            .get("active")
            .assert_i64(0);
    }

    #[tokio::test]
    async fn test_unknown_class_is_not_found() {
        let cli = client().await;
        cli.get("/api/admission/render")
            .send()
            .await
            .assert_status(StatusCode::NOT_FOUND);
        cli.post("/api/rate-limits/unknown/check")
            .body_json(&json!({ "subject": "u1" }))
            .send()
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rate_limit_sets_retry_after() {
        let cli = client().await;
        cli.post("/api/rate-limits/generate/check")
            .body_json(&json!({ "subject": "u1" }))
            .send()
            .await
            .assert_status_is_ok();

        let resp = cli
            .post("/api/rate-limits/generate/check")
            .body_json(&json!({ "subject": "u1" }))
            .send()
            .await;
        resp.assert_status(StatusCode::TOO_MANY_REQUESTS);
        resp.assert_header("Retry-After", "60");
    }

    #[tokio::test]
    async fn test_duplicate_event_is_a_noop() {
        let cli = client().await;
        let event = json!({
            "provider": "stripe",
            "event_id": "evt_123",
            "event_type": "invoice.paid",
        });
        cli.post("/api/events/claim")
            .body_json(&event)
            .send()
            .await
            .assert_status(StatusCode::CREATED);
        let resp = cli.post("/api/events/claim").body_json(&event).send().await;
        resp.assert_status_is_ok();
        resp.json()
            .await
            .value()
            .object()
            .get("claimed")
            .assert_bool(false);
    }

    #[tokio::test]
    async fn test_exhausted_quota_is_payment_required() {
        let cli = client().await;
        cli.post("/api/quota/u1/2026-10/usage")
            .body_json(&json!({ "amount": 5 }))
            .send()
            .await
            .assert_status(StatusCode::CREATED);

        let resp = cli.get("/api/quota/u1/2026-10").send().await;
        resp.assert_status(StatusCode::PAYMENT_REQUIRED);
        resp.json()
            .await
            .value()
            .object()
            .get("exhausted")
            .assert_string("scope");

        cli.post("/api/quota/u1/2026-10/usage")
            .body_json(&json!({ "amount": 1 }))
            .send()
            .await
            .assert_status(StatusCode::PAYMENT_REQUIRED);
        cli.post("/api/quota/u1/2026-11/usage")
            .body_json(&json!({ "amount": 0 }))
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }
}
