pub mod admin;
pub mod auth;
pub mod pipeline;
pub mod rate_limit;
pub mod roles;
pub mod validation;

pub use admin::admin_auth_middleware;
pub use auth::{AuthStage, AuthUser, BearerToken};
pub use pipeline::{security_pipeline_middleware, Interceptor, SecurityPipeline, StageContext};
pub use rate_limit::RateLimitStage;
pub use roles::RoleStage;
pub use validation::ValidationStage;
