pub mod attack_patterns;
pub mod encryptor;
pub mod error;
pub mod input_validator;
pub mod jwks;
pub mod key_manager;
pub mod rate_limiter;
pub mod redis;
pub mod token;

pub use attack_patterns::AttackCategory;
pub use encryptor::{EncryptedEnvelope, Encryptor};
pub use error::{AuthError, CryptoError, JwksError, StoreError, TokenError};
pub use input_validator::{InputValidator, ValidationRule, ValidationViolation};
pub use jwks::{HttpJwksFetcher, JwksFetcher, JwksKeySource};
pub use key_manager::KeyManager;
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use redis::{InMemoryStore, RateLimitStore, RedisStore, RevocationStore};
pub use token::{Audience, Subject, TokenClaims, TokenPair, TokenService, TokenType};
