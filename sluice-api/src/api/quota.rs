use poem::web::Data;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Enum, Object, OpenApi};
use sluice_core::{BudgetCheck, QuotaScope, Services, UsageOutcome};

pub struct Api;

#[derive(Enum)]
#[oai(rename_all = "snake_case")]
enum ExhaustedCap {
    Scope,
    Subject,
}

#[derive(Object)]
struct BudgetInfo {
    subject: String,
    scope: String,
    allowed: bool,
    used: i64,
    cap: i64,
    subject_used: i64,
    subject_cap: i64,
    remaining: i64,
    exhausted: Option<ExhaustedCap>,
    message: Option<String>,
}

impl From<BudgetCheck> for BudgetInfo {
    fn from(check: BudgetCheck) -> Self {
        let message = check.message();
        Self {
            exhausted: check.reason.map(|reason| match reason {
                QuotaScope::Scope => ExhaustedCap::Scope,
                QuotaScope::Subject => ExhaustedCap::Subject,
            }),
            message,
            subject: check.subject,
            scope: check.scope,
            allowed: check.allowed,
            used: check.used,
            cap: check.cap,
            subject_used: check.subject_used,
            subject_cap: check.subject_cap,
            remaining: check.remaining,
        }
    }
}

#[derive(Object)]
struct UsageRequest {
    amount: i64,
}

#[derive(ApiResponse)]
enum BudgetResponse {
    #[oai(status = 200)]
    Ok(Json<BudgetInfo>),
    #[oai(status = 402)]
    Exhausted(Json<BudgetInfo>),
}

#[derive(ApiResponse)]
enum UsageResponse {
    #[oai(status = 201)]
    Recorded(Json<BudgetInfo>),
    #[oai(status = 402)]
    Refused(Json<BudgetInfo>),
}

#[OpenApi]
impl Api {
    #[oai(
        path = "/quota/:subject/:scope",
        method = "get",
        operation_id = "check_budget"
    )]
    async fn api_check_budget(
        &self,
        services: Data<&Services>,
        subject: Path<String>,
        scope: Path<String>,
    ) -> poem::Result<BudgetResponse> {
        let check = services.quota.check_budget(&subject, &scope).await?;
        Ok(if check.allowed {
            BudgetResponse::Ok(Json(check.into()))
        } else {
            BudgetResponse::Exhausted(Json(check.into()))
        })
    }

    #[oai(
        path = "/quota/:subject/:scope/usage",
        method = "post",
        operation_id = "record_usage"
    )]
    async fn api_record_usage(
        &self,
        services: Data<&Services>,
        subject: Path<String>,
        scope: Path<String>,
        body: Json<UsageRequest>,
    ) -> poem::Result<UsageResponse> {
        Ok(
            match services
                .quota
                .record_usage(&subject, &scope, body.amount)
                .await?
            {
                UsageOutcome::Recorded(check) => UsageResponse::Recorded(Json(check.into())),
                UsageOutcome::Refused(check) => UsageResponse::Refused(Json(check.into())),
            },
        )
    }
}
