use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use topup_catalog::{CodeError, PackageError, RoutingError};
use topup_core::ErrorKind;
use topup_order::OrderError;

#[derive(Debug)]
pub enum AppError {
    ValidationError(String, Option<ErrorKind>),
    NotFoundError(String),
    ConflictError(String, Option<ErrorKind>),
    /// Rejected input with per-item details, e.g. malformed import lines.
    Unprocessable {
        message: String,
        kind: Option<ErrorKind>,
        details: Value,
    },
    InternalServerError(String),
    Anyhow(anyhow::Error),
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into(), None)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, kind, details) = match self {
            AppError::ValidationError(msg, kind) => (StatusCode::BAD_REQUEST, msg, kind, None),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg, None, None),
            AppError::ConflictError(msg, kind) => (StatusCode::CONFLICT, msg, kind, None),
            AppError::Unprocessable {
                message,
                kind,
                details,
            } => (StatusCode::UNPROCESSABLE_ENTITY, message, kind, Some(details)),
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                    Some(ErrorKind::Internal),
                    None,
                )
            }
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                    Some(ErrorKind::Internal),
                    None,
                )
            }
        };

        let mut body = json!({ "error": message });
        if let Some(kind) = kind {
            body["kind"] = json!(kind);
        }
        if let Some(Value::Object(extra)) = details {
            for (key, value) in extra {
                body[key] = value;
            }
        }

        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Anyhow(err)
    }
}

impl From<RoutingError> for AppError {
    fn from(err: RoutingError) -> Self {
        AppError::ValidationError(err.to_string(), Some(err.kind()))
    }
}

impl From<PackageError> for AppError {
    fn from(err: PackageError) -> Self {
        match err {
            PackageError::NotFound(_) => AppError::NotFoundError(err.to_string()),
            PackageError::NotAvailable(_) => AppError::bad_request(err.to_string()),
        }
    }
}

impl From<CodeError> for AppError {
    fn from(err: CodeError) -> Self {
        let kind = err.kind();
        match err {
            CodeError::NotFound(_) | CodeError::GroupNotFound(_) => {
                AppError::NotFoundError(err.to_string())
            }
            CodeError::InvalidGroup(_) => AppError::bad_request(err.to_string()),
            CodeError::Import(import) => AppError::Unprocessable {
                message: import.to_string(),
                kind: Some(import.kind()),
                details: json!({ "rejectedLines": import.lines }),
            },
            CodeError::Storage(_) => AppError::InternalServerError(err.to_string()),
            CodeError::Exhausted(_)
            | CodeError::InvalidTransition { .. }
            | CodeError::GroupExists(_)
            | CodeError::GroupInactive(_) => AppError::ConflictError(err.to_string(), kind),
        }
    }
}

impl From<OrderError> for AppError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::NotFound(_) => AppError::NotFoundError(err.to_string()),
            OrderError::InvalidQuantity(_) | OrderError::InvalidCursor(_) => {
                AppError::bad_request(err.to_string())
            }
            OrderError::Package(e) => e.into(),
            OrderError::Code(e) => e.into(),
            OrderError::Routing(e) => e.into(),
            OrderError::Internal(msg) => AppError::InternalServerError(msg),
        }
    }
}
