pub mod health;
pub mod keys;
pub mod metrics;
pub mod session;

pub use health::health_check;
pub use metrics::metrics;
