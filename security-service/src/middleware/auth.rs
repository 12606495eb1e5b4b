use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request},
    http::{header, request::Parts, HeaderMap, Uri},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use std::ops::ControlFlow;
use std::sync::Arc;

use super::pipeline::{Interceptor, StageContext};
use crate::config::JwtConfig;
use crate::services::error::AuthError;
use crate::services::token::{TokenClaims, TokenService};

/// Raw bearer credential of an authenticated request, kept for handlers
/// that act on the token itself (logout).
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

/// Authenticates every non-public request and attaches its claims.
pub struct AuthStage {
    tokens: Arc<TokenService>,
    public_paths: Vec<String>,
    public_path_prefixes: Vec<String>,
    query_param: Option<String>,
    cookie_name: Option<String>,
}

impl AuthStage {
    pub fn new(tokens: Arc<TokenService>, config: &JwtConfig) -> Self {
        Self {
            tokens,
            public_paths: config.public_paths.clone(),
            public_path_prefixes: config.public_path_prefixes.clone(),
            query_param: config.token_query_param.clone(),
            cookie_name: config.token_cookie_name.clone(),
        }
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| p == path)
            || self
                .public_path_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// `Authorization: Bearer`, then the query parameter, then the cookie.
    fn extract_token(&self, headers: &HeaderMap, uri: &Uri) -> Option<String> {
        if let Some(token) = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            return Some(token.to_string());
        }

        if let (Some(param), Some(query)) = (&self.query_param, uri.query()) {
            let found = serde_urlencoded::from_str::<Vec<(String, String)>>(query)
                .ok()
                .and_then(|pairs| pairs.into_iter().find(|(k, _)| k == param))
                .map(|(_, v)| v)
                .filter(|v| !v.is_empty());
            if found.is_some() {
                return found;
            }
        }

        self.cookie_name.as_ref().and_then(|name| {
            CookieJar::from_headers(headers)
                .get(name)
                .map(|c| c.value().to_string())
                .filter(|v| !v.is_empty())
        })
    }
}

#[async_trait]
impl Interceptor for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn intercept(
        &self,
        mut request: Request,
        _ctx: &mut StageContext,
    ) -> ControlFlow<Response, Request> {
        if self.is_public(request.uri().path()) {
            return ControlFlow::Continue(request);
        }

        let Some(token) = self.extract_token(request.headers(), request.uri()) else {
            tracing::debug!(path = %request.uri().path(), "Missing credential");
            return ControlFlow::Break(AppError::from(AuthError::MissingCredential).into_response());
        };

        match self.tokens.verify_access(&token).await {
            Ok(claims) => {
                request.extensions_mut().insert(claims);
                request.extensions_mut().insert(BearerToken(token));
                ControlFlow::Continue(request)
            }
            Err(e) => {
                tracing::warn!(
                    path = %request.uri().path(),
                    reason = %e,
                    "Rejected bearer credential"
                );
                ControlFlow::Break(AppError::from(e).into_response())
            }
        }
    }
}

/// Extractor for the claims of an authenticated request.
pub struct AuthUser(pub TokenClaims);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TokenClaims>()
            .cloned()
            .map(AuthUser)
            .ok_or_else(|| AuthError::MissingCredential.into())
    }
}
