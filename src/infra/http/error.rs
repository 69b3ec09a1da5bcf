use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::application::{
    compile::{CompilationFailure, FailureClass},
    error::ErrorReport,
};

/// Public error messages that originate in the HTTP adapter itself.
pub mod messages {
    pub const MISSING_AUTHORIZATION: &str = "missing Authorization header";
    pub const INVALID_AUTHORIZATION: &str = "invalid Authorization format";
    pub const INVALID_API_KEY: &str = "invalid API key";
    pub const INVALID_FORM: &str = "invalid form";
    pub const EMPTY_BODY: &str = "empty body";
    pub const BODY_READ_FAILED: &str = "failed to read request body";
    pub const INVALID_BODY_ENCODING: &str = "body must be UTF-8 text";
    pub const INVALID_IMAGES_JSON: &str = "invalid images json";
    pub const BODY_TOO_LARGE: &str = "request body too large";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// JSON error response `{error, detail?}` with an attached `ErrorReport`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    source: &'static str,
    message: &'static str,
    detail: Option<String>,
    diagnostic: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, source: &'static str, message: &'static str) -> Self {
        Self {
            status,
            source,
            message,
            detail: None,
            diagnostic: None,
        }
    }

    pub fn bad_request(source: &'static str, message: &'static str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, source, message)
    }

    pub fn unauthorized(message: &'static str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "infra::http::auth", message)
    }

    /// Detail returned to the client.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Detail recorded for logs only.
    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<CompilationFailure> for ApiError {
    fn from(failure: CompilationFailure) -> Self {
        let status = match failure.class {
            FailureClass::Input | FailureClass::Asset | FailureClass::Compilation => {
                StatusCode::BAD_REQUEST
            }
            FailureClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            FailureClass::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        let error = ApiError::new(status, "application::compile", failure.label)
            .with_diagnostic(format!("{}: {failure}", failure.class.as_str()));

        // Internal and availability details stay in the logs.
        match failure.detail {
            Some(detail) if failure.class.is_client_fault() => error.with_detail(detail),
            _ => error,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let diagnostic = self
            .diagnostic
            .or_else(|| self.detail.clone())
            .map(|text| format!("{}: {text}", self.message))
            .unwrap_or_else(|| self.message.to_string());
        let body = ApiErrorBody {
            error: self.message.to_string(),
            detail: self.detail,
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(self.source, self.status, diagnostic).attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::compile::labels;

    #[test]
    fn client_faults_expose_detail() {
        let failure = CompilationFailure::new(FailureClass::Compilation, labels::RENDER_FAILED)
            .with_detail("! Undefined control sequence.");
        let error = ApiError::from(failure);

        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error.detail.as_deref(), Some("! Undefined control sequence."));
    }

    #[test]
    fn internal_faults_hide_detail() {
        let failure = CompilationFailure::new(FailureClass::Internal, labels::CANNOT_READ_OUTPUT)
            .with_detail("/tmp/texrender/abc/abc.pdf: No such file");
        let error = ApiError::from(failure);

        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.detail, None);
        assert!(
            error
                .diagnostic
                .as_deref()
                .is_some_and(|text| text.contains("No such file"))
        );
    }

    #[test]
    fn deadline_maps_to_service_unavailable() {
        let failure =
            CompilationFailure::new(FailureClass::Unavailable, labels::DEADLINE_EXCEEDED);
        assert_eq!(
            ApiError::from(failure).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn response_carries_error_report() {
        let response = ApiError::unauthorized(messages::INVALID_API_KEY).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");
        assert_eq!(report.source, "infra::http::auth");
    }
}
