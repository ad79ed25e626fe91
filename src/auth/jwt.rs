//! JWT validation
//!
//! Tokens are issued elsewhere; this service only verifies them.

use crate::auth::Role;
use crate::error::AppError;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Reviewer identity, recorded on resolved changes and audit entries
    pub sub: String,
    pub role: Role,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: i64,
}

/// Decode and validate a JWT token
pub fn decode_token(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            AppError::Unauthorized("Token expired".to_string())
        }
        jsonwebtoken::errors::ErrorKind::InvalidToken => {
            AppError::Unauthorized("Invalid token".to_string())
        }
        _ => AppError::Unauthorized(format!("Token validation failed: {}", e)),
    })?;

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(sub: &str, role: Role, secret: &str, ttl: Duration) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: sub.to_string(),
            role,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_decode_valid_token() {
        let token = token("ana", Role::Admin, "s3cret", Duration::minutes(5));
        let claims = decode_token(&token, "s3cret").unwrap();
        assert_eq!(claims.sub, "ana");
        assert_eq!(claims.role, Role::Admin);
    }

    #[test]
    fn test_wrong_secret_and_expired_tokens_are_rejected() {
        let token_a = token("ana", Role::Admin, "s3cret", Duration::minutes(5));
        assert!(matches!(decode_token(&token_a, "other"), Err(AppError::Unauthorized(_))));

        let expired = token("ana", Role::Admin, "s3cret", Duration::minutes(-10));
        assert!(matches!(decode_token(&expired, "s3cret"), Err(AppError::Unauthorized(_))));
    }
}
