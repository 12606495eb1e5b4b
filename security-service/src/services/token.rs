use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{AuthError, JwksError, TokenError};
use super::jwks::{HttpJwksFetcher, JwksKeySource};
use super::redis::RevocationStore;
use crate::config::JwtConfig;
use crate::utils::secure_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Authorizes resource access.
    Access,
    /// Only mints new access tokens.
    Refresh,
}

/// Identity carried by a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub username: Option<String>,
    pub roles: Vec<String>,
}

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
            roles: Vec::new(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user ID)
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, alias = "scopes")]
    pub roles: Vec<String>,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// JWT ID
    pub jti: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
}

/// `aud` is a string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl TokenClaims {
    pub fn subject(&self) -> Subject {
        Subject {
            id: self.sub.clone(),
            username: self.username.clone(),
            roles: self.roles.clone(),
        }
    }
}

/// Token response returned to client
#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Result of exchanging a refresh token. `refresh_token` is only present
/// when rotation was requested.
#[derive(Debug, Serialize)]
pub struct RefreshOutcome {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: i64,
}

/// Where signature verification keys come from.
#[derive(Clone)]
enum VerificationKeys {
    Static(DecodingKey),
    Jwks(Arc<JwksKeySource>),
}

/// Issues, verifies, refreshes and revokes bearer tokens.
#[derive(Clone)]
pub struct TokenService {
    /// `None` in verify-only deployments (RS256 without a private key).
    encoding_key: Option<EncodingKey>,
    verification: VerificationKeys,
    algorithm: Algorithm,
    key_id: Option<String>,
    issuer: Option<String>,
    audience: Option<String>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    revocations: Arc<dyn RevocationStore>,
}

impl TokenService {
    pub fn new(
        config: &JwtConfig,
        revocations: Arc<dyn RevocationStore>,
    ) -> Result<Self, anyhow::Error> {
        let algorithm = Algorithm::from_str(&config.algorithm.to_uppercase())
            .map_err(|e| anyhow::anyhow!("Unsupported JWT algorithm {}: {}", config.algorithm, e))?;

        let (encoding_key, verification) = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = config
                    .secret
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("jwt.secret is required for {:?}", algorithm))?;
                let bytes = secret.expose_secret().as_bytes();
                (
                    Some(EncodingKey::from_secret(bytes)),
                    VerificationKeys::Static(DecodingKey::from_secret(bytes)),
                )
            }
            Algorithm::RS256 => {
                let encoding_key = load_rsa_private_key(config)?;
                let verification = match &config.jwks_url {
                    Some(url) => {
                        let fetcher = HttpJwksFetcher::new(url.clone())
                            .map_err(|e| anyhow::anyhow!("Failed to set up JWKS source: {}", e))?;
                        VerificationKeys::Jwks(Arc::new(JwksKeySource::new(
                            Arc::new(fetcher),
                            std::time::Duration::from_secs(config.jwks_cache_ttl_seconds),
                        )))
                    }
                    None => VerificationKeys::Static(load_rsa_public_key(config)?),
                };
                (encoding_key, verification)
            }
            other => anyhow::bail!("Unsupported JWT algorithm: {:?}", other),
        };

        tracing::info!(
            algorithm = ?algorithm,
            jwks = config.jwks_url.is_some(),
            can_issue = encoding_key.is_some(),
            "Token service initialized"
        );

        Ok(Self {
            encoding_key,
            verification,
            algorithm,
            key_id: config.key_id.clone(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl: Duration::minutes(config.access_token_expiry_minutes),
            refresh_ttl: Duration::days(config.refresh_token_expiry_days),
            revocations,
        })
    }

    /// Verify against `source` instead of the configured keys.
    pub fn with_jwks(mut self, source: Arc<JwksKeySource>) -> Self {
        self.verification = VerificationKeys::Jwks(source);
        self
    }

    pub fn jwks(&self) -> Option<&Arc<JwksKeySource>> {
        match &self.verification {
            VerificationKeys::Jwks(source) => Some(source),
            VerificationKeys::Static(_) => None,
        }
    }

    /// Sign a token for `subject`. `ttl` overrides the per-type default.
    pub fn issue(
        &self,
        subject: &Subject,
        token_type: TokenType,
        ttl: Option<Duration>,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        });

        let claims = TokenClaims {
            sub: subject.id.clone(),
            username: subject.username.clone(),
            roles: subject.roles.clone(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type,
            iss: self.issuer.clone(),
            aud: self.audience.clone().map(Audience::One),
        };

        let encoding_key = self.encoding_key.as_ref().ok_or_else(|| {
            TokenError::Signing(anyhow::anyhow!("No signing key configured"))
        })?;

        let mut header = Header::new(self.algorithm);
        header.kid = self.key_id.clone();

        encode(&header, &claims, encoding_key)
            .map_err(|e| TokenError::Signing(anyhow::anyhow!("Failed to encode token: {}", e)))
    }

    pub fn issue_pair(&self, subject: &Subject) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access_token: self.issue(subject, TokenType::Access, None)?,
            refresh_token: self.issue(subject, TokenType::Refresh, None)?,
            token_type: "bearer".to_string(),
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    /// Check signature, expiry and the revocation list.
    ///
    /// A revocation store fault is logged and treated as "not revoked";
    /// signature and expiry failures always reject.
    pub async fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let claims = self.decode(token, true).await?;

        match self.revocations.is_revoked(&secure_hash(token)).await {
            Ok(true) => {
                tracing::warn!(jti = %claims.jti, "Rejected revoked token");
                Err(AuthError::Revoked)
            }
            Ok(false) => Ok(claims),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    jti = %claims.jti,
                    "Revocation check failed, accepting token as not revoked"
                );
                Ok(claims)
            }
        }
    }

    /// [`verify`](Self::verify) for resource access: refresh tokens are not
    /// bearer credentials.
    pub async fn verify_access(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let claims = self.verify(token).await?;
        if claims.token_type != TokenType::Access {
            tracing::warn!(jti = %claims.jti, "Refresh token presented as bearer credential");
            return Err(AuthError::InvalidSignature);
        }
        Ok(claims)
    }

    /// Exchange a refresh token for a new access token. With `rotate` the
    /// presented refresh token is revoked and a replacement issued.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        rotate: bool,
    ) -> Result<RefreshOutcome, TokenError> {
        let claims = self.verify(refresh_token).await?;
        if claims.token_type != TokenType::Refresh {
            tracing::warn!(jti = %claims.jti, "Access token presented for refresh");
            return Err(AuthError::InvalidSignature.into());
        }

        let subject = claims.subject();
        let access_token = self.issue(&subject, TokenType::Access, None)?;

        let refresh_token = if rotate {
            self.revoke(refresh_token).await?;
            Some(self.issue(&subject, TokenType::Refresh, None)?)
        } else {
            None
        };

        tracing::info!(sub = %subject.id, rotated = rotate, "Refreshed access token");

        Ok(RefreshOutcome {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    /// Add `token` to the revocation list until it would have expired
    /// anyway. Idempotent; an already-expired token is a no-op.
    pub async fn revoke(&self, token: &str) -> Result<(), TokenError> {
        let claims = self.decode(token, false).await?;
        let remaining = claims.exp - Utc::now().timestamp();

        if remaining <= 0 {
            tracing::debug!(jti = %claims.jti, "Skipping revocation of expired token");
            return Ok(());
        }

        self.revocations
            .revoke(&secure_hash(token), remaining as u64)
            .await?;

        tracing::info!(jti = %claims.jti, ttl_seconds = remaining, "Token revoked");
        Ok(())
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    async fn decoding_key(&self, token: &str) -> Result<DecodingKey, AuthError> {
        let source = match &self.verification {
            VerificationKeys::Static(key) => return Ok(key.clone()),
            VerificationKeys::Jwks(source) => source,
        };

        let kid = decode_header(token)
            .ok()
            .and_then(|header| header.kid)
            .ok_or(AuthError::InvalidSignature)?;

        source.decoding_key(&kid).await.map_err(|e| match e {
            JwksError::UnknownKey(_) => {
                tracing::debug!(kid = %kid, "Token signed with unknown key");
                AuthError::InvalidSignature
            }
            JwksError::Fetch(_) => AuthError::KeySourceUnavailable,
        })
    }

    async fn decode(&self, token: &str, validate_exp: bool) -> Result<TokenClaims, AuthError> {
        let decoding_key = self.decoding_key(token).await?;

        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = validate_exp;
        validation.leeway = 0;
        if !validate_exp {
            validation.required_spec_claims.clear();
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        decode::<TokenClaims>(token, &decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => {
                    tracing::debug!(error = %e, "Token failed validation");
                    AuthError::InvalidSignature
                }
            })
    }
}

fn load_rsa_private_key(config: &JwtConfig) -> Result<Option<EncodingKey>, anyhow::Error> {
    let Some(private_key_path) = config.private_key_path.as_deref() else {
        return Ok(None);
    };

    let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
        anyhow::anyhow!("Failed to read private key from {}: {}", private_key_path, e)
    })?;
    let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

    Ok(Some(encoding_key))
}

fn load_rsa_public_key(config: &JwtConfig) -> Result<DecodingKey, anyhow::Error> {
    let public_key_path = config
        .public_key_path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("jwt.public_key_path or jwt.jwks_url is required for RS256"))?;

    let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
        anyhow::anyhow!("Failed to read public key from {}: {}", public_key_path, e)
    })?;
    let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

    Ok(decoding_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::error::StoreError;
    use crate::services::jwks::JwksFetcher;
    use crate::services::redis::InMemoryStore;
    use async_trait::async_trait;
    use jsonwebtoken::jwk::JwkSet;
    use secrecy::Secret;

    const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

    struct FixtureJwks {
        reachable: bool,
    }

    #[async_trait]
    impl JwksFetcher for FixtureJwks {
        async fn fetch(&self) -> Result<JwkSet, JwksError> {
            if !self.reachable {
                return Err(JwksError::Fetch("connection refused".to_string()));
            }
            serde_json::from_str(include_str!("../../tests/fixtures/jwks.json"))
                .map_err(|e| JwksError::Fetch(e.to_string()))
        }
    }

    fn rs256_config(key_id: &str) -> JwtConfig {
        JwtConfig {
            algorithm: "RS256".to_string(),
            private_key_path: Some(format!("{}/rsa_private.pem", FIXTURES)),
            public_key_path: Some(format!("{}/rsa_public.pem", FIXTURES)),
            key_id: Some(key_id.to_string()),
            ..JwtConfig::default()
        }
    }

    fn jwks_source(reachable: bool) -> Arc<JwksKeySource> {
        Arc::new(JwksKeySource::new(
            Arc::new(FixtureJwks { reachable }),
            std::time::Duration::from_secs(60),
        ))
    }

    struct UnavailableStore;

    #[async_trait]
    impl RevocationStore for UnavailableStore {
        async fn revoke(&self, _: &str, _: u64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn is_revoked(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Timeout(250))
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn test_config() -> JwtConfig {
        JwtConfig {
            secret: Some(Secret::new("test-secret-with-enough-entropy".to_string())),
            ..JwtConfig::default()
        }
    }

    fn service_with(store: Arc<dyn RevocationStore>) -> Result<TokenService, anyhow::Error> {
        TokenService::new(&test_config(), store)
    }

    fn alice() -> Subject {
        Subject::new("user_123")
            .with_username("alice")
            .with_roles(["read", "write"])
    }

    #[tokio::test]
    async fn test_access_token_round_trip() -> Result<(), anyhow::Error> {
        let service = service_with(Arc::new(InMemoryStore::new()))?;

        let token = service.issue(&alice(), TokenType::Access, None)?;
        let claims = service.verify_access(&token).await?;

        assert_eq!(claims.sub, "user_123");
        assert_eq!(claims.username.as_deref(), Some("alice"));
        assert_eq!(claims.roles, vec!["read", "write"]);
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(claims.exp - claims.iat, 30 * 60);

        Ok(())
    }

    #[tokio::test]
    async fn test_expired_token_rejected() -> Result<(), anyhow::Error> {
        let service = service_with(Arc::new(InMemoryStore::new()))?;

        let token = service.issue(&alice(), TokenType::Access, Some(Duration::seconds(-10)))?;

        assert_eq!(service.verify(&token).await.unwrap_err(), AuthError::Expired);
        Ok(())
    }

    #[tokio::test]
    async fn test_tampered_or_foreign_token_rejected() -> Result<(), anyhow::Error> {
        let service = service_with(Arc::new(InMemoryStore::new()))?;
        let other = TokenService::new(
            &JwtConfig {
                secret: Some(Secret::new("a-completely-different-secret".to_string())),
                ..JwtConfig::default()
            },
            Arc::new(InMemoryStore::new()),
        )?;

        let foreign = other.issue(&alice(), TokenType::Access, None)?;
        assert_eq!(
            service.verify(&foreign).await.unwrap_err(),
            AuthError::InvalidSignature
        );
        assert_eq!(
            service.verify("not-a-jwt").await.unwrap_err(),
            AuthError::InvalidSignature
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_revoked_token_rejected() -> Result<(), anyhow::Error> {
        let service = service_with(Arc::new(InMemoryStore::new()))?;

        let token = service.issue(&alice(), TokenType::Access, None)?;
        assert!(service.verify(&token).await.is_ok());

        service.revoke(&token).await?;
        service.revoke(&token).await?;

        assert_eq!(service.verify(&token).await.unwrap_err(), AuthError::Revoked);
        Ok(())
    }

    #[tokio::test]
    async fn test_revoking_expired_token_is_noop() -> Result<(), anyhow::Error> {
        let service = service_with(Arc::new(UnavailableStore))?;

        // The store is down, so reaching it would fail.
        let token = service.issue(&alice(), TokenType::Access, Some(Duration::seconds(-10)))?;
        service.revoke(&token).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_token_is_not_a_bearer_credential() -> Result<(), anyhow::Error> {
        let service = service_with(Arc::new(InMemoryStore::new()))?;
        let pair = service.issue_pair(&alice())?;

        assert_eq!(pair.token_type, "bearer");
        assert_eq!(pair.expires_in, 30 * 60);
        assert_eq!(
            service.verify_access(&pair.refresh_token).await.unwrap_err(),
            AuthError::InvalidSignature
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_access_token_cannot_refresh() -> Result<(), anyhow::Error> {
        let service = service_with(Arc::new(InMemoryStore::new()))?;
        let pair = service.issue_pair(&alice())?;

        let err = service.refresh(&pair.access_token, false).await.unwrap_err();
        assert!(matches!(err, TokenError::Auth(AuthError::InvalidSignature)));

        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_keeps_subject() -> Result<(), anyhow::Error> {
        let service = service_with(Arc::new(InMemoryStore::new()))?;
        let pair = service.issue_pair(&alice())?;

        let outcome = service.refresh(&pair.refresh_token, false).await?;
        assert!(outcome.refresh_token.is_none());

        let claims = service.verify_access(&outcome.access_token).await?;
        assert_eq!(claims.subject(), alice());

        // Without rotation the refresh token stays usable.
        assert!(service.refresh(&pair.refresh_token, false).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_with_rotation_revokes_old_token() -> Result<(), anyhow::Error> {
        let service = service_with(Arc::new(InMemoryStore::new()))?;
        let pair = service.issue_pair(&alice())?;

        let outcome = service.refresh(&pair.refresh_token, true).await?;
        let replacement = outcome.refresh_token.expect("rotation issues a refresh token");

        let err = service.refresh(&pair.refresh_token, true).await.unwrap_err();
        assert!(matches!(err, TokenError::Auth(AuthError::Revoked)));
        assert!(service.refresh(&replacement, false).await.is_ok());

        Ok(())
    }

    #[tokio::test]
    async fn test_store_outage_treats_token_as_not_revoked() -> Result<(), anyhow::Error> {
        let service = service_with(Arc::new(UnavailableStore))?;

        let token = service.issue(&alice(), TokenType::Access, None)?;
        assert!(service.verify_access(&token).await.is_ok());

        let err = service.revoke(&token).await.unwrap_err();
        assert!(matches!(err, TokenError::Store(_)));

        Ok(())
    }

    #[tokio::test]
    async fn test_rs256_token_verifies_through_jwks() -> Result<(), anyhow::Error> {
        let service = TokenService::new(&rs256_config("test-key-1"), Arc::new(InMemoryStore::new()))?
            .with_jwks(jwks_source(true));

        let token = service.issue(&alice(), TokenType::Access, None)?;
        assert_eq!(decode_header(&token)?.kid.as_deref(), Some("test-key-1"));

        let claims = service.verify_access(&token).await?;
        assert_eq!(claims.sub, "user_123");
        assert!(service.jwks().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_jwks_rejects_unknown_or_missing_kid() -> Result<(), anyhow::Error> {
        let store = Arc::new(InMemoryStore::new());
        let verifier = TokenService::new(&rs256_config("test-key-1"), store.clone())?
            .with_jwks(jwks_source(true));

        let unknown = TokenService::new(&rs256_config("retired-key"), store.clone())?
            .issue(&alice(), TokenType::Access, None)?;
        assert_eq!(
            verifier.verify(&unknown).await.unwrap_err(),
            AuthError::InvalidSignature
        );

        let unlabelled = TokenService::new(
            &JwtConfig {
                key_id: None,
                ..rs256_config("unused")
            },
            store,
        )?
        .issue(&alice(), TokenType::Access, None)?;
        assert_eq!(
            verifier.verify(&unlabelled).await.unwrap_err(),
            AuthError::InvalidSignature
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_jwks_is_reported_as_unavailable() -> Result<(), anyhow::Error> {
        let service = TokenService::new(&rs256_config("test-key-1"), Arc::new(InMemoryStore::new()))?
            .with_jwks(jwks_source(false));

        let token = service.issue(&alice(), TokenType::Access, None)?;
        assert_eq!(
            service.verify(&token).await.unwrap_err(),
            AuthError::KeySourceUnavailable
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_only_service_cannot_issue() -> Result<(), anyhow::Error> {
        let store = Arc::new(InMemoryStore::new());
        let issuer = TokenService::new(&rs256_config("test-key-1"), store.clone())?;
        let verifier = TokenService::new(
            &JwtConfig {
                private_key_path: None,
                ..rs256_config("test-key-1")
            },
            store,
        )?;

        let token = issuer.issue(&alice(), TokenType::Access, None)?;
        assert!(verifier.verify_access(&token).await.is_ok());

        let err = verifier.issue(&alice(), TokenType::Access, None).unwrap_err();
        assert!(matches!(err, TokenError::Signing(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_issuer_and_audience_are_enforced() -> Result<(), anyhow::Error> {
        let scoped = |audience: &str| JwtConfig {
            issuer: Some("https://auth.example.com/".to_string()),
            audience: Some(audience.to_string()),
            ..test_config()
        };
        let store = Arc::new(InMemoryStore::new());
        let billing = TokenService::new(&scoped("billing"), store.clone())?;
        let reports = TokenService::new(&scoped("reports"), store.clone())?;
        let unscoped = TokenService::new(&test_config(), store)?;

        let token = billing.issue(&alice(), TokenType::Access, None)?;
        let claims = billing.verify_access(&token).await?;
        assert_eq!(claims.iss.as_deref(), Some("https://auth.example.com/"));
        assert_eq!(claims.aud, Some(Audience::One("billing".to_string())));

        assert_eq!(
            reports.verify(&token).await.unwrap_err(),
            AuthError::InvalidSignature
        );
        // Without a configured audience the claim is not checked.
        assert!(unscoped.verify(&token).await.is_ok());

        let bare = unscoped.issue(&alice(), TokenType::Access, None)?;
        assert_eq!(
            billing.verify(&bare).await.unwrap_err(),
            AuthError::InvalidSignature
        );
        Ok(())
    }

    #[test]
    fn test_audience_accepts_string_or_array() {
        let claims: TokenClaims = serde_json::from_value(serde_json::json!({
            "sub": "auth0|123",
            "aud": ["https://api.example.com", "https://tenant.auth0.com/userinfo"],
            "exp": 1,
            "iat": 0,
            "jti": "abc",
            "type": "access"
        }))
        .unwrap();

        assert!(matches!(claims.aud, Some(Audience::Many(ref list)) if list.len() == 2));
    }

    #[test]
    fn test_legacy_scopes_claim_accepted() {
        let claims: TokenClaims = serde_json::from_value(serde_json::json!({
            "sub": "user_123",
            "scopes": ["admin"],
            "exp": 1,
            "iat": 0,
            "jti": "abc",
            "type": "refresh"
        }))
        .unwrap();

        assert_eq!(claims.roles, vec!["admin"]);
        assert_eq!(claims.token_type, TokenType::Refresh);
    }
}
