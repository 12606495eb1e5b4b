pub mod crypto;

pub use crypto::{constant_time_eq, secure_hash};
