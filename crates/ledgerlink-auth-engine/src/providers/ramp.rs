//! Ramp expense management.
//!
//! Client credentials go in the form body and the refresh token is not
//! always rotated.

use super::standard::{ClientAuthStyle, ProviderDescriptor, RevokeEncoding, StandardOAuthAdapter};
use super::{Provider, ProviderCredentials};

const AUTHORIZE_URL: &str = "https://app.ramp.com/v1/authorize";
const TOKEN_URL: &str = "https://api.ramp.com/developer/v1/token";
const REVOKE_URL: &str = "https://api.ramp.com/developer/v1/token/revoke";
const API_BASE_URL: &str = "https://api.ramp.com/developer/v1";

const SCOPES: &[&str] = &[
    "accounting:read",
    "accounting:write",
    "bills:read",
    "transactions:read",
    "reimbursements:read",
    "users:read",
];

pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        provider: Provider::Ramp,
        authorize_url: AUTHORIZE_URL.to_string(),
        token_url: TOKEN_URL.to_string(),
        revoke_url: REVOKE_URL.to_string(),
        api_base_url: API_BASE_URL.to_string(),
        scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
        auth_style: ClientAuthStyle::RequestBody,
        revoke_encoding: RevokeEncoding::Form,
        callback_extras: Vec::new(),
    }
}

pub fn adapter(credentials: ProviderCredentials) -> StandardOAuthAdapter {
    StandardOAuthAdapter::new(descriptor(), credentials)
}
