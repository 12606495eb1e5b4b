use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use service_core::error::AppError;
use std::collections::HashMap;
use std::ops::ControlFlow;

use super::pipeline::{Interceptor, StageContext};
use crate::services::token::TokenClaims;

struct RoleRequirement {
    prefix: String,
    roles: Vec<String>,
    challenge: Option<HeaderValue>,
}

/// Rejects authenticated requests whose token lacks the roles configured
/// for the path. Runs after authentication; requests without claims
/// (public paths) pass untouched.
pub struct RoleStage {
    /// Longest prefix first.
    requirements: Vec<RoleRequirement>,
}

impl RoleStage {
    pub fn new(required_roles: &HashMap<String, Vec<String>>) -> Self {
        let mut requirements: Vec<RoleRequirement> = required_roles
            .iter()
            .map(|(prefix, roles)| RoleRequirement {
                prefix: prefix.clone(),
                roles: roles.clone(),
                challenge: HeaderValue::from_str(&format!("Bearer scope=\"{}\"", roles.join(" ")))
                    .ok(),
            })
            .collect();
        requirements.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Self { requirements }
    }

    fn requirement_for(&self, path: &str) -> Option<&RoleRequirement> {
        self.requirements
            .iter()
            .find(|r| path.starts_with(r.prefix.as_str()))
    }
}

#[async_trait]
impl Interceptor for RoleStage {
    fn name(&self) -> &'static str {
        "roles"
    }

    async fn intercept(
        &self,
        request: Request,
        _ctx: &mut StageContext,
    ) -> ControlFlow<Response, Request> {
        let Some(requirement) = self.requirement_for(request.uri().path()) else {
            return ControlFlow::Continue(request);
        };
        let Some(claims) = request.extensions().get::<TokenClaims>() else {
            return ControlFlow::Continue(request);
        };

        let missing: Vec<&str> = requirement
            .roles
            .iter()
            .filter(|role| !claims.roles.contains(*role))
            .map(String::as_str)
            .collect();
        let sub = claims.sub.clone();
        if missing.is_empty() {
            return ControlFlow::Continue(request);
        }

        tracing::warn!(
            sub = %sub,
            path = %request.uri().path(),
            missing = ?missing,
            "Bearer lacks required roles"
        );

        let mut response = AppError::Forbidden(format!(
            "Not enough permissions. Required: {}",
            requirement.roles.join(" ")
        ))
        .into_response();
        if let Some(challenge) = &requirement.challenge {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, challenge.clone());
        }

        ControlFlow::Break(response)
    }
}
