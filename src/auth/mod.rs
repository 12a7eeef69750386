//! Registration auth: credential store, brute-force rate limiting, and
//! the download-token validator for public paths.

pub mod credentials;
pub mod rate_limit;
pub mod url_token;

pub use credentials::{AuthError, CredentialStore};
pub use rate_limit::RateLimiter;
