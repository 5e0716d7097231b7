use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    config::LoadError,
    infra::{error::InfraError, origin::OriginError},
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Error returned by admin handlers: a fixed public message plus a logged report.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

/// Outcomes that end a proxied request without an origin response.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("failed to read request body: {0}")]
    Body(String),
    #[error(transparent)]
    Upstream(#[from] OriginError),
    #[error("origin fetch aborted before completion")]
    FetchAborted,
}

impl ProxyError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Upstream(err) => err.status(),
            Self::FetchAborted => StatusCode::BAD_GATEWAY,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            Self::BadRequest(_) | Self::Body(_) => "Bad request",
            Self::PayloadTooLarge { .. } => "Request body too large",
            Self::Upstream(OriginError::Timeout { .. }) => "Origin timed out",
            Self::Upstream(_) | Self::FetchAborted => "Origin unavailable",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let report = ErrorReport::from_error("application::proxy", status, &self);
        let mut response = (status, self.presentation_message()).into_response();
        report.attach(&mut response);
        response
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use crate::infra::origin::TimeoutPhase;

    use super::*;

    #[test]
    fn proxy_errors_map_to_statuses() {
        assert_eq!(
            ProxyError::bad_request("no path").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::PayloadTooLarge { limit: 8 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ProxyError::from(OriginError::Connect("refused".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::from(OriginError::Timeout {
                phase: TimeoutPhase::BetweenBytes
            })
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn proxy_error_response_carries_report() {
        let response = ProxyError::from(OriginError::Connect("refused".into())).into_response();
        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("error report");
        assert_eq!(report.status, StatusCode::BAD_GATEWAY);
        assert_eq!(report.messages[0], "origin unreachable: refused");
    }
}
