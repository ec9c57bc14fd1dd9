use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Identity, Role, Tier, UserId},
    error::{ApiError, ErrorCode},
};

/// Verification side of the external identity collaborator: the engine
/// trusts the `(user, role, tier)` tuple inside a signed token for the
/// lifetime of the connection and re-checks it only on reconnect.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityClaims {
    sub: i64,
    name: String,
    role: Role,
    tier: Tier,
    iat: i64,
    exp: i64,
}

pub fn mint_identity_token(
    cfg: &AuthConfig,
    identity: &Identity,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = IdentityClaims {
        sub: identity.user_id.0,
        name: identity.display_name.clone(),
        role: identity.role,
        tier: identity.tier,
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
}

pub fn verify_identity_token(cfg: &AuthConfig, token: &str) -> Result<Identity, ApiError> {
    let data = decode::<IdentityClaims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::new(ErrorCode::Unauthorized, "invalid identity token"))?;

    Ok(Identity {
        user_id: UserId(data.claims.sub),
        display_name: data.claims.name,
        role: data.claims.role,
        tier: data.claims.tier,
    })
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
