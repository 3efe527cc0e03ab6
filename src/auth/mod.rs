/*!
 * # Authentication Module
 *
 * Access and refresh credentials for KodBank accounts.
 *
 * - Access tokens are short-lived HS256 JWTs verified statelessly.
 * - Refresh tokens are HS256 JWTs signed with a separate secret and tracked in the
 *   token ledger; they are single-use and rotated on every refresh.
 * - Presenting a refresh token that was already rotated away (or revoked) is treated
 *   as theft and revokes every session of the implicated account.
 */

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::entities::{account, Role};

pub mod password;
pub mod session;
pub mod token_ledger;
mod types;

pub use password::{Argon2PasswordHasher, PasswordHasher};
pub use session::SessionManager;
pub use token_ledger::TokenLedger;
pub use types::*;

/// Claims carried by access tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,        // Account ID
    pub username: String, // Account username
    pub role: Role,       // Account role
    pub jti: String,      // Unique token identifier
    pub iat: i64,         // Issued at time
    pub exp: i64,         // Expiration time
    pub nbf: i64,         // Not valid before time
    pub iss: String,      // Issuer
    pub aud: String,      // Audience
}

/// Claims carried by refresh tokens (minimal data)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Authenticated principal attached to a request after access-token verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub account_id: Uuid,
    pub username: String,
    pub role: Role,
    pub token_id: String,
}

impl AuthUser {
    /// Check if the account has a specific role
    pub fn has_role(&self, role: Role) -> bool {
        self.role == role
    }

    /// Check if the account is an admin
    pub fn is_admin(&self) -> bool {
        self.has_role(Role::Admin)
    }

    /// Managers and admins may operate on accounts other than their own
    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Manager | Role::Admin)
    }
}

impl From<AccessClaims> for AuthUser {
    fn from(claims: AccessClaims) -> Self {
        Self {
            account_id: claims.sub,
            username: claims.username,
            role: claims.role,
            token_id: claims.jti,
        }
    }
}

/// Authentication configuration, injected into the session manager at construction
#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_refresh_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub access_token_expiration: Duration,
    pub refresh_token_expiration: Duration,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("jwt_refresh_secret", &"<redacted>")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("access_token_expiration", &self.access_token_expiration)
            .field("refresh_token_expiration", &self.refresh_token_expiration)
            .finish()
    }
}

impl AuthConfig {
    pub fn new(
        jwt_secret: String,
        jwt_refresh_secret: String,
        jwt_issuer: String,
        jwt_audience: String,
        access_token_expiration: Duration,
        refresh_token_expiration: Duration,
    ) -> Self {
        Self {
            jwt_secret,
            jwt_refresh_secret,
            jwt_issuer,
            jwt_audience,
            access_token_expiration,
            refresh_token_expiration,
        }
    }

    fn validation(&self, validate_exp: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.jwt_issuer]);
        validation.set_audience(&[&self.jwt_audience]);
        validation.validate_exp = validate_exp;
        validation.leeway = 0;
        validation
    }

    fn lifetime(duration: Duration) -> Result<ChronoDuration, AuthError> {
        ChronoDuration::from_std(duration)
            .map_err(|_| AuthError::InternalError("Invalid token duration".to_string()))
    }

    /// Mint an access token for `account`, returning the token and its claims
    pub fn sign_access_token(
        &self,
        account: &account::Model,
        now: DateTime<Utc>,
    ) -> Result<(String, AccessClaims), AuthError> {
        let exp = now + Self::lifetime(self.access_token_expiration)?;
        let claims = AccessClaims {
            sub: account.id,
            username: account.username.clone(),
            role: account.role,
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            nbf: now.timestamp(),
            iss: self.jwt_issuer.clone(),
            aud: self.jwt_audience.clone(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenCreation(e.to_string()))?;

        Ok((token, claims))
    }

    /// Mint a refresh token for `account_id`; the caller persists it in the ledger
    pub fn sign_refresh_token(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        let exp = now + Self::lifetime(self.refresh_token_expiration)?;
        let claims = RefreshClaims {
            sub: account_id,
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: self.jwt_issuer.clone(),
            aud: self.jwt_audience.clone(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.jwt_refresh_secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenCreation(e.to_string()))?;

        Ok((token, exp))
    }

    /// Signature, issuer, audience and expiry check for access tokens
    pub fn decode_access_token(
        &self,
        token: &str,
    ) -> Result<AccessClaims, jsonwebtoken::errors::Error> {
        decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &self.validation(true),
        )
        .map(|data| data.claims)
    }

    /// Decode a refresh token. With `validate_exp == false` only authenticity is checked,
    /// which is what reuse detection needs for rotated-away tokens.
    pub fn decode_refresh_token(
        &self,
        token: &str,
        validate_exp: bool,
    ) -> Result<RefreshClaims, jsonwebtoken::errors::Error> {
        decode::<RefreshClaims>(
            token,
            &DecodingKey::from_secret(self.jwt_refresh_secret.as_bytes()),
            &self.validation(validate_exp),
        )
        .map(|data| data.claims)
    }
}

/// Token pair response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
}

/// Authentication error types
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Refresh token expired")]
    RefreshTokenExpired,

    #[error("Refresh token reuse detected; all sessions have been revoked")]
    TokenReuseDetected,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Token creation failed: {0}")]
    TokenCreation(String),

    #[error("Hash error: {0}")]
    HashError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl AuthError {
    /// Stable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "AUTH_INVALID_CREDENTIALS",
            Self::InvalidRefreshToken => "AUTH_INVALID_REFRESH_TOKEN",
            Self::RefreshTokenExpired => "AUTH_REFRESH_TOKEN_EXPIRED",
            Self::TokenReuseDetected => "AUTH_TOKEN_REUSE_DETECTED",
            Self::Unauthorized => "AUTH_UNAUTHORIZED",
            Self::TokenCreation(_)
            | Self::HashError(_)
            | Self::DatabaseError(_)
            | Self::InternalError(_) => "AUTH_INTERNAL_ERROR",
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::TokenCreation(_)
                | Self::HashError(_)
                | Self::DatabaseError(_)
                | Self::InternalError(_)
        )
    }

    /// Security events are logged and counted separately from ordinary failures
    pub fn is_security_event(&self) -> bool {
        matches!(self, Self::TokenReuseDetected)
    }

    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }

    pub fn to_response(&self) -> crate::errors::ErrorResponse {
        crate::errors::ErrorResponse::new(self.code(), self.public_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::AccountStatus;

    fn config() -> AuthConfig {
        AuthConfig::new(
            "access_signing_key_9f8e7d6c5b4a3210_for_unit_tests".into(),
            "refresh_signing_key_0a1b2c3d4e5f6789_for_unit_tests".into(),
            "kodbank".into(),
            "kodbank-api".into(),
            Duration::from_secs(900),
            Duration::from_secs(7 * 24 * 3600),
        )
    }

    fn account() -> account::Model {
        let now = Utc::now();
        account::Model {
            id: Uuid::new_v4(),
            username: "alice".into(),
            email: "alice@x.com".into(),
            password_hash: "opaque".into(),
            phone: None,
            balance_cents: 0,
            role: Role::Manager,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn access_token_round_trip() {
        let cfg = config();
        let acct = account();
        let (token, claims) = cfg.sign_access_token(&acct, Utc::now()).unwrap();
        let decoded = cfg.decode_access_token(&token).unwrap();
        assert_eq!(decoded, claims);

        let user = AuthUser::from(decoded);
        assert_eq!(user.account_id, acct.id);
        assert_eq!(user.username, "alice");
        assert!(user.is_staff());
        assert!(!user.is_admin());
    }

    #[test]
    fn expired_access_token_is_rejected() {
        let cfg = config();
        let (token, _) = cfg
            .sign_access_token(&account(), Utc::now() - ChronoDuration::hours(1))
            .unwrap();
        let err = cfg.decode_access_token(&token).unwrap_err();
        assert!(matches!(
            err.kind(),
            jsonwebtoken::errors::ErrorKind::ExpiredSignature
        ));
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let cfg = config();
        let (refresh, _) = cfg.sign_refresh_token(Uuid::new_v4(), Utc::now()).unwrap();
        assert!(cfg.decode_access_token(&refresh).is_err());
    }

    #[test]
    fn foreign_issuer_is_rejected() {
        let cfg = config();
        let mut other = config();
        other.jwt_issuer = "someone-else".into();
        let (token, _) = other.sign_refresh_token(Uuid::new_v4(), Utc::now()).unwrap();
        assert!(cfg.decode_refresh_token(&token, false).is_err());
    }

    #[test]
    fn expired_refresh_token_still_authenticates_without_expiry_check() {
        let cfg = config();
        let account_id = Uuid::new_v4();
        let (token, _) = cfg
            .sign_refresh_token(account_id, Utc::now() - ChronoDuration::days(30))
            .unwrap();
        assert!(cfg.decode_refresh_token(&token, true).is_err());
        let claims = cfg.decode_refresh_token(&token, false).unwrap();
        assert_eq!(claims.sub, account_id);
    }

    #[test]
    fn tampered_refresh_token_is_rejected() {
        let cfg = config();
        let (token, _) = cfg.sign_refresh_token(Uuid::new_v4(), Utc::now()).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(cfg.decode_refresh_token(&tampered, false).is_err());
    }

    #[test]
    fn each_refresh_token_is_unique() {
        let cfg = config();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let (a, _) = cfg.sign_refresh_token(id, now).unwrap();
        let (b, _) = cfg.sign_refresh_token(id, now).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn reuse_detection_is_a_security_event() {
        assert!(AuthError::TokenReuseDetected.is_security_event());
        assert!(!AuthError::InvalidRefreshToken.is_security_event());
        assert_eq!(
            AuthError::InternalError("boom".into()).public_message(),
            "Internal server error"
        );
    }
}
