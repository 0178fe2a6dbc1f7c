use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::Serialize;

use pinpoint_core::error::GameError;
use pinpoint_core::identity::{Claims, Identity, TokenType};
use pinpoint_core::player::UserId;

use crate::error::AppError;
use crate::state::AppState;

/// Turns a bearer credential into a verified identity.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, GameError>;
}

/// HS256 verifier for tokens issued by the account service.
pub struct JwtVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
    issuer: Option<String>,
}

#[derive(Serialize)]
struct IssuedClaims<'a> {
    #[serde(flatten)]
    claims: &'a Claims,
    #[serde(skip_serializing_if = "Option::is_none")]
    iss: Option<&'a str>,
}

impl JwtVerifier {
    pub fn new(secret: &[u8], issuer: Option<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(ref iss) = issuer {
            // set_issuer alone lets tokens without an `iss` claim through.
            validation.set_required_spec_claims(&["exp", "iss"]);
            validation.set_issuer(&[iss.as_str()]);
        }
        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation,
            issuer,
        }
    }

    /// Mint a token with the same secret. Used by tests and dev tooling.
    pub fn mint(
        &self,
        user_id: UserId,
        username: &str,
        token_type: TokenType,
        ttl_secs: u64,
    ) -> Result<String, GameError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| GameError::Fatal(format!("clock before epoch: {e}")))?
            .as_secs();
        let claims = Claims {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            username: username.to_string(),
            token_type,
            exp: now + ttl_secs,
        };
        let issued = IssuedClaims {
            claims: &claims,
            iss: self.issuer.as_deref(),
        };
        encode(&Header::new(Algorithm::HS256), &issued, &self.encoding)
            .map_err(|e| GameError::Fatal(format!("failed to encode token: {e}")))
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, GameError> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => "token expired",
                    ErrorKind::InvalidSignature => "invalid signature",
                    ErrorKind::InvalidIssuer => "invalid issuer",
                    ErrorKind::MissingRequiredClaim(_) => "missing required claim",
                    _ => "invalid token",
                };
                GameError::Unauthorized(reason.to_string())
            })?;
        claims.into_identity()
    }
}

/// Extract a bearer token from the `Authorization` header.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Axum middleware that verifies the bearer token and inserts the caller's
/// [`Identity`] into request extensions.
pub async fn identity_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let verified = match bearer_from_headers(request.headers()) {
        Some(token) => state.verifier.verify(token),
        None => Err(GameError::Unauthorized("missing bearer token".to_string())),
    };
    match verified {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        },
        Err(e) => {
            tracing::debug!(error = %e, "Rejected REST request");
            AppError(e).into_response()
        },
    }
}
