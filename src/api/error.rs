//! Mapping of task errors and outcomes onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

use crate::task::{Outcome, TaskError};

pub const NOT_COMPLETED: &str = "Task not completed";

impl TaskError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TaskError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            TaskError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskError::Validation(_) => StatusCode::BAD_REQUEST,
            TaskError::ExternalService(_) | TaskError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Outcome::Completed(view) => (StatusCode::OK, Json(view)).into_response(),
            Outcome::Pending(_) => (StatusCode::PRECONDITION_FAILED, NOT_COMPLETED).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_stable_codes() {
        let cases = [
            (TaskError::Unauthorized("x".into()), 401),
            (TaskError::NotFound("x".into()), 404),
            (TaskError::Validation("x".into()), 400),
            (TaskError::ExternalService("x".into()), 500),
            (TaskError::Internal("x".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(err.status_code().as_u16(), code, "{:?}", err);
            assert_eq!(err.into_response().status().as_u16(), code);
        }
    }
}
