//! Bearer token authentication.
//!
//! Tokens are HS256 JWTs whose `sub` claim is the numeric user id. Browsers
//! cannot set headers on a websocket upgrade, so `?token=` is accepted too.

use std::future::{ready, Ready};

use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Validates signature and expiry and returns the user id.
    pub fn verify(&self, token: &str) -> AppResult<i64> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!(error = %e, "token rejected");
            AppError::Unauthorized
        })?;
        data.claims
            .sub
            .parse::<i64>()
            .map_err(|_| AppError::Unauthorized)
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Token from `Authorization: Bearer ...`, falling back to `?token=`.
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let from_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string);

    from_header.or_else(|| {
        web::Query::<TokenQuery>::from_query(req.query_string())
            .ok()
            .and_then(|q| q.into_inner().token)
    })
}

/// The caller's user id, taken from a verified token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub i64);

impl AuthenticatedUser {
    pub fn id(&self) -> i64 {
        self.0
    }
}

impl FromRequest for AuthenticatedUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let result = match req.app_data::<web::Data<AppState>>() {
            Some(state) => bearer_token(req)
                .ok_or(AppError::Unauthorized)
                .and_then(|token| state.auth.verify(&token))
                .map(AuthenticatedUser),
            None => Err(AppError::Internal("application state missing".into())),
        };
        ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, sub: &str, exp: usize) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &Claims {
                sub: sub.to_string(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> usize {
        (chrono::Utc::now().timestamp() + 3600) as usize
    }

    #[test]
    fn test_verify_valid_token() {
        let validator = JwtValidator::new("secret");
        assert_eq!(validator.verify(&token("secret", "42", far_future())).unwrap(), 42);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let validator = JwtValidator::new("secret");
        assert!(matches!(
            validator.verify(&token("other", "42", far_future())),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn test_non_numeric_subject_rejected() {
        let validator = JwtValidator::new("secret");
        assert!(validator.verify(&token("secret", "alice", far_future())).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let validator = JwtValidator::new("secret");
        assert!(validator.verify(&token("secret", "1", 1_000)).is_err());
    }

    #[test]
    fn test_bearer_token_sources() {
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer abc"))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("abc"));

        let req = TestRequest::with_uri("/ws/messages?token=xyz").to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("xyz"));

        let req = TestRequest::default().to_http_request();
        assert!(bearer_token(&req).is_none());
    }
}
