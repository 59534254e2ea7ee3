use std::error::Error;

use poem::error::ResponseError;
use poem::http::StatusCode;
use sea_orm::DbErr;

#[derive(thiserror::Error, Debug)]
pub enum SluiceError {
    #[error("database error: {0}")]
    DatabaseError(DbErr),
    #[error("backing store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("resource class {0} is not configured")]
    UnknownResourceClass(String),
    #[error("rate limit policy {0} is not configured")]
    UnknownRateLimitPolicy(String),
    #[error("usage amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<DbErr> for SluiceError {
    fn from(err: DbErr) -> Self {
        match err {
            // Connection-level failures mean the store itself is gone,
            // everything else is a query against a reachable store.
            DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => {
                Self::StoreUnavailable(err.to_string())
            }
            DbErr::Exec(_) | DbErr::Query(_) if broke_on_io(&err) => {
                Self::StoreUnavailable(err.to_string())
            }
            err => Self::DatabaseError(err),
        }
    }
}

/// A pooled connection that dies mid-statement surfaces as a query
/// error with an I/O error somewhere in its source chain.
fn broke_on_io(err: &DbErr) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        source = cause.source();
    }
    false
}

impl ResponseError for SluiceError {
    fn status(&self) -> StatusCode {
        match self {
            Self::UnknownResourceClass(_) | Self::UnknownRateLimitPolicy(_) => {
                StatusCode::NOT_FOUND
            }
            Self::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl SluiceError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }

    /// Whether a degradation policy may kick in for this error.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use sea_orm::{sqlx, ConnAcquireErr, RuntimeErr};

    use super::*;

    #[test]
    fn test_connection_errors_classify_as_unavailable() {
        let err: SluiceError = DbErr::ConnectionAcquire(ConnAcquireErr::Timeout).into();
        assert!(err.is_store_unavailable());
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err: SluiceError = DbErr::Conn(RuntimeErr::Internal("refused".into())).into();
        assert!(err.is_store_unavailable());
    }

    #[test]
    fn test_broken_connection_mid_query_is_unavailable() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer");
        let err: SluiceError = DbErr::Query(RuntimeErr::SqlxError(sqlx::Error::Io(reset))).into();
        assert!(err.is_store_unavailable());

        let err: SluiceError =
            DbErr::Exec(RuntimeErr::SqlxError(sqlx::Error::Protocol("bad packet".into()))).into();
        assert!(!err.is_store_unavailable());
    }

    #[test]
    fn test_query_errors_are_not_unavailable() {
        let err: SluiceError = DbErr::RecordNotFound("lease".into()).into();
        assert!(!err.is_store_unavailable());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_unknown_class_maps_to_not_found() {
        let err = SluiceError::UnknownResourceClass("render".into());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
