use crate::config::AuthPolicy;
use crate::error::{GatewayError, Result};
use http::HeaderMap;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::str::FromStr;

/// Identity established for an authenticated request
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Token subject, used for user-scoped cache partitioning
    pub subject: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
}

/// Validate the bearer token on a request against a policy.
///
/// Signature, expiry, and (when configured) issuer and audience are
/// all checked; any failure maps to a 401 at the edge.
pub fn validate_bearer(headers: &HeaderMap, policy: &AuthPolicy) -> Result<AuthContext> {
    let header = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::MissingCredentials)?;

    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or(GatewayError::MissingCredentials)?;

    let algorithm = Algorithm::from_str(&policy.algorithm).map_err(|_| {
        GatewayError::Config(format!("Unsupported JWT algorithm: {}", policy.algorithm))
    })?;

    let key = decoding_key(policy, algorithm)?;

    let mut validation = Validation::new(algorithm);
    if !policy.valid_issuers.is_empty() {
        validation.set_issuer(&policy.valid_issuers);
    }
    if policy.valid_audiences.is_empty() {
        validation.validate_aud = false;
    } else {
        validation.set_audience(&policy.valid_audiences);
    }

    let token_data = decode::<Claims>(token, &key, &validation)
        .map_err(|e| GatewayError::Unauthorized(describe_failure(&e).to_string()))?;

    Ok(AuthContext {
        subject: token_data.claims.sub,
    })
}

fn decoding_key(policy: &AuthPolicy, algorithm: Algorithm) -> Result<DecodingKey> {
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            let secret = policy.secret.as_ref().ok_or_else(|| {
                GatewayError::Config("Auth policy has no secret".to_string())
            })?;
            Ok(DecodingKey::from_secret(secret.as_bytes()))
        }
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => {
            let pem = public_key(policy)?;
            DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| GatewayError::Config(format!("Invalid RSA public key: {}", e)))
        }
        Algorithm::ES256 | Algorithm::ES384 => {
            let pem = public_key(policy)?;
            DecodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|e| GatewayError::Config(format!("Invalid EC public key: {}", e)))
        }
        Algorithm::EdDSA => {
            let pem = public_key(policy)?;
            DecodingKey::from_ed_pem(pem.as_bytes())
                .map_err(|e| GatewayError::Config(format!("Invalid Ed25519 public key: {}", e)))
        }
    }
}

fn public_key(policy: &AuthPolicy) -> Result<&String> {
    policy
        .public_key
        .as_ref()
        .ok_or_else(|| GatewayError::Config("Auth policy has no public key".to_string()))
}

/// Stable failure descriptions, also used as metric labels
pub fn describe_failure(error: &jsonwebtoken::errors::Error) -> &'static str {
    match error.kind() {
        ErrorKind::ExpiredSignature => "token expired",
        ErrorKind::InvalidSignature => "invalid signature",
        ErrorKind::InvalidIssuer => "invalid issuer",
        ErrorKind::InvalidAudience => "invalid audience",
        ErrorKind::ImmatureSignature => "token not yet valid",
        ErrorKind::InvalidToken => "malformed token",
        _ => "invalid token",
    }
}
