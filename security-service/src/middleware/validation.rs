use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde_json::json;
use std::ops::ControlFlow;
use std::sync::Arc;

use super::pipeline::{Interceptor, StageContext};
use crate::config::ValidationMode;
use crate::services::input_validator::{InputValidator, RequestTarget, ValidationViolation};

/// Scans URL, query, headers and body before anything else sees them.
pub struct ValidationStage {
    validator: Arc<InputValidator>,
}

impl ValidationStage {
    pub fn new(validator: Arc<InputValidator>) -> Self {
        Self { validator }
    }

    /// Apply the configured mode: reject, or log and carry on.
    fn outcome(
        &self,
        request: Request,
        violation: ValidationViolation,
    ) -> ControlFlow<Response, Request> {
        let fields: Vec<String> = violation.field_errors().into_keys().collect();
        tracing::warn!(
            method = %request.method(),
            path = %request.uri().path(),
            violation = violation.kind(),
            fields = ?fields,
            "Input validation failed"
        );
        metrics::counter!("input_validation_violations_total", "kind" => violation.kind())
            .increment(1);

        match self.validator.mode() {
            ValidationMode::LogOnly => ControlFlow::Continue(request),
            ValidationMode::Block => ControlFlow::Break(rejection(&violation)),
        }
    }
}

fn rejection(violation: &ValidationViolation) -> Response {
    let errors = violation.field_errors();
    let body = if errors.is_empty() {
        json!({ "detail": violation.detail() })
    } else {
        json!({ "detail": violation.detail(), "errors": errors })
    };
    (violation.status(), Json(body)).into_response()
}

#[async_trait]
impl Interceptor for ValidationStage {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn intercept(
        &self,
        request: Request,
        _ctx: &mut StageContext,
    ) -> ControlFlow<Response, Request> {
        let (parts, body) = request.into_parts();
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let target = RequestTarget {
            method: parts.method.as_str(),
            path: parts.uri.path(),
            content_type: &content_type,
        };

        let uri = parts.uri.to_string();
        let checked = self
            .validator
            .check_url(&uri)
            .and_then(|_| self.validator.check_query(&target, parts.uri.query()))
            .and_then(|_| self.validator.check_headers(&target, &parts.headers));
        if let Err(violation) = checked {
            let request = Request::from_parts(parts, body);
            return self.outcome(request, violation);
        }

        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Err(violation) = self.validator.check_declared_length(declared) {
            // Never read an oversized body, even in log-only mode.
            if self.validator.mode() == ValidationMode::LogOnly {
                tracing::warn!(declared = ?declared, "Oversized body passed through unread");
            }
            let request = Request::from_parts(parts, body);
            return self.outcome(request, violation);
        }

        let bytes = match Limited::new(body, self.validator.max_body_size()).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let violation = if e.downcast_ref::<LengthLimitError>().is_some() {
                    ValidationViolation::BodyTooLarge
                } else {
                    ValidationViolation::MalformedBody
                };
                // The body is consumed; a request let through in log-only
                // mode continues without one.
                let request = Request::from_parts(parts, Body::empty());
                return self.outcome(request, violation);
            }
        };

        let checked = self.validator.check_body(&target, &bytes);
        let request = Request::from_parts(parts, Body::from(bytes));

        match checked {
            Ok(()) => ControlFlow::Continue(request),
            Err(violation) => self.outcome(request, violation),
        }
    }
}
