//! Intuit QuickBooks Online.
//!
//! Client credentials go in a Basic auth header, the revoke endpoint takes
//! JSON, and the callback carries the company id as `realmId`, which every
//! later API call needs.

use serde::{Deserialize, Serialize};

use super::standard::{ClientAuthStyle, ProviderDescriptor, RevokeEncoding, StandardOAuthAdapter};
use super::{Provider, ProviderCredentials};

const AUTHORIZE_URL: &str = "https://appcenter.intuit.com/connect/oauth2";
const TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";
const REVOKE_URL: &str = "https://developer.api.intuit.com/v2/oauth2/tokens/revoke";
const SANDBOX_API: &str = "https://sandbox-quickbooks.api.intuit.com/v3/company";
const PRODUCTION_API: &str = "https://quickbooks.api.intuit.com/v3/company";

/// Callback parameter naming the connected company.
pub const REALM_ID: &str = "realmId";

/// Which Intuit API host business calls go to. OAuth endpoints are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickBooksEnvironment {
    #[default]
    Sandbox,
    Production,
}

pub fn descriptor(environment: QuickBooksEnvironment) -> ProviderDescriptor {
    let api_base_url = match environment {
        QuickBooksEnvironment::Sandbox => SANDBOX_API,
        QuickBooksEnvironment::Production => PRODUCTION_API,
    };
    ProviderDescriptor {
        provider: Provider::QuickBooks,
        authorize_url: AUTHORIZE_URL.to_string(),
        token_url: TOKEN_URL.to_string(),
        revoke_url: REVOKE_URL.to_string(),
        api_base_url: api_base_url.to_string(),
        scopes: vec!["com.intuit.quickbooks.accounting".to_string()],
        auth_style: ClientAuthStyle::BasicHeader,
        revoke_encoding: RevokeEncoding::Json,
        callback_extras: vec![REALM_ID.to_string()],
    }
}

pub fn adapter(
    credentials: ProviderCredentials,
    environment: QuickBooksEnvironment,
) -> StandardOAuthAdapter {
    StandardOAuthAdapter::new(descriptor(environment), credentials)
}
