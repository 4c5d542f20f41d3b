use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;

use crate::error::{EngineError, StoreError};

pub mod appointments;
pub mod schedule;

impl ResponseError for EngineError {
    fn status_code(&self) -> StatusCode {
        match self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidTransition { .. } | EngineError::ScheduleConflict { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            EngineError::Store(err) => {
                log::error!("Store failure: {err}");
                json!({ "error": "internal error" })
            }
            EngineError::InvalidTransition { current, verb } => json!({
                "error": self.to_string(),
                "current_status": current,
                "verb": verb,
            }),
            EngineError::ScheduleConflict { conflicting_id } => json!({
                "error": self.to_string(),
                "conflicting_id": conflicting_id,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

impl ResponseError for StoreError {
    fn error_response(&self) -> HttpResponse {
        log::error!("Store failure: {self}");
        HttpResponse::InternalServerError().json(json!({ "error": "internal error" }))
    }
}
