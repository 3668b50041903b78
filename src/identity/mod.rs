//! Admission key resolution from request identity.
//!
//! Turning a request into identity evidence (reading headers, cookies) and
//! verifying signatures belong to the surrounding HTTP layer. This module only
//! defines the boundary: given whatever evidence the request carried, produce
//! the key whose budget the request is charged against. Resolution never
//! fails; it degrades to a default key.

mod resolver;

pub use resolver::{
    Claims, CookieKeyResolver, KeyResolver, SubjectKeyResolver, TokenVerifier, VerifyError,
    TOKEN_COOKIE,
};
