use chrono::{DateTime, Utc};
use poem::web::Data;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi};
use sluice_core::store::LeaseRecord;
use sluice_core::{Admission, Services};
use sluice_db_entities::Lease::LeaseState;
use uuid::Uuid;

use super::retry_after_header;

pub struct Api;

#[derive(Object)]
struct AcquireRequest {
    owner: String,
}

#[derive(Object)]
struct LeaseGrantInfo {
    lease_id: Uuid,
    resource_class: String,
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Object)]
struct CapacityDenialInfo {
    resource_class: String,
    active: u32,
    limit: u32,
    estimated_wait_ms: u64,
}

#[derive(Object)]
struct LeaseInfo {
    id: Uuid,
    owner: String,
    state: LeaseState,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<LeaseRecord> for LeaseInfo {
    fn from(lease: LeaseRecord) -> Self {
        Self {
            id: lease.id,
            owner: lease.owner,
            state: lease.state,
            acquired_at: lease.acquired_at,
            expires_at: lease.expires_at,
        }
    }
}

#[derive(Object)]
struct ClassStatusInfo {
    resource_class: String,
    limit: u32,
    active: u32,
    leases: Vec<LeaseInfo>,
}

#[derive(Object)]
struct RenewedLease {
    lease_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(ApiResponse)]
enum AcquireResponse {
    #[oai(status = 201)]
    Granted(Json<LeaseGrantInfo>),
    #[oai(status = 429)]
    Denied(
        Json<CapacityDenialInfo>,
        #[oai(header = "Retry-After")] u64,
    ),
}

#[derive(ApiResponse)]
enum ReleaseResponse {
    #[oai(status = 204)]
    Released,
}

#[derive(ApiResponse)]
enum RenewResponse {
    #[oai(status = 200)]
    Ok(Json<RenewedLease>),
    #[oai(status = 404)]
    NotFound,
}

#[derive(ApiResponse)]
enum StatusResponse {
    #[oai(status = 200)]
    Ok(Json<ClassStatusInfo>),
}

#[OpenApi]
impl Api {
    #[oai(
        path = "/admission/:class/leases",
        method = "post",
        operation_id = "acquire_lease"
    )]
    async fn api_acquire_lease(
        &self,
        services: Data<&Services>,
        class: Path<String>,
        body: Json<AcquireRequest>,
    ) -> poem::Result<AcquireResponse> {
        let admission = services.admission.try_acquire(&class, &body.owner).await?;
        Ok(match admission {
            Admission::Granted(grant) => AcquireResponse::Granted(Json(LeaseGrantInfo {
                lease_id: grant.lease_id,
                resource_class: grant.resource_class,
                owner: grant.owner,
                expires_at: grant.expires_at,
            })),
            Admission::Denied(denial) => {
                let estimated_wait_ms =
                    u64::try_from(denial.estimated_wait.as_millis()).unwrap_or(u64::MAX);
                AcquireResponse::Denied(
                    Json(CapacityDenialInfo {
                        resource_class: denial.resource_class,
                        active: denial.active,
                        limit: denial.limit,
                        estimated_wait_ms,
                    }),
                    retry_after_header(estimated_wait_ms),
                )
            }
        })
    }

    #[oai(path = "/leases/:id", method = "delete", operation_id = "release_lease")]
    async fn api_release_lease(
        &self,
        services: Data<&Services>,
        id: Path<Uuid>,
    ) -> poem::Result<ReleaseResponse> {
        services.admission.release(id.0).await?;
        Ok(ReleaseResponse::Released)
    }

    #[oai(path = "/leases/:id/renew", method = "post", operation_id = "renew_lease")]
    async fn api_renew_lease(
        &self,
        services: Data<&Services>,
        id: Path<Uuid>,
    ) -> poem::Result<RenewResponse> {
        Ok(match services.admission.renew(id.0).await? {
            Some(expires_at) => RenewResponse::Ok(Json(RenewedLease {
                lease_id: id.0,
                expires_at,
            })),
            None => RenewResponse::NotFound,
        })
    }

    #[oai(
        path = "/admission/:class",
        method = "get",
        operation_id = "get_admission_status"
    )]
    async fn api_get_status(
        &self,
        services: Data<&Services>,
        class: Path<String>,
    ) -> poem::Result<StatusResponse> {
        let status = services.admission.status(&class).await?;
        Ok(StatusResponse::Ok(Json(ClassStatusInfo {
            resource_class: status.resource_class,
            limit: status.limit,
            active: status.active,
            leases: status.leases.into_iter().map(Into::into).collect(),
        })))
    }
}
