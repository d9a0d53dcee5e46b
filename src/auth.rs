//! Credential hashing and the access/refresh token codec.
//!
//! Passwords are stored as bcrypt hashes. Tokens are HS256 JWTs signed with
//! the process-wide secret from [`TokenConfig`]; the codec is built once at
//! startup and shared read-only between requests.

use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::error::{AuthError, ConfigError};
use crate::models::{User, UserId};

/// bcrypt only looks at the first 72 bytes of its input.
pub const MAX_SECRET_BYTES: usize = 72;
pub const TOKEN_ISSUER: &str = "bulb-api";
pub const REFRESH_TOKEN_TTL_DAYS: i64 = 7;

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    hash_password_with_cost(password, DEFAULT_COST)
}

pub fn hash_password_with_cost(password: &str, cost: u32) -> Result<String, AuthError> {
    if password.len() > MAX_SECRET_BYTES {
        return Err(AuthError::SecretTooLong { limit: MAX_SECRET_BYTES });
    }
    Ok(hash(password, cost)?)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    // Such a secret could never have produced a stored hash.
    if password.len() > MAX_SECRET_BYTES {
        return Ok(false);
    }
    Ok(verify(password, hash)?)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccessClaims {
    pub sub: String, // user id
    pub email: String,
    pub kind: TokenKind,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

/// Refresh claims carry no profile data.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefreshClaims {
    pub sub: String, // user id
    pub kind: TokenKind,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl RefreshClaims {
    pub fn user_id(&self) -> Result<UserId, AuthError> {
        parse_subject(&self.sub)
    }
}

trait TimeBounded {
    fn kind(&self) -> TokenKind;
    fn expires_at(&self) -> i64;
}

impl TimeBounded for AccessClaims {
    fn kind(&self) -> TokenKind {
        self.kind
    }
    fn expires_at(&self) -> i64 {
        self.exp
    }
}

impl TimeBounded for RefreshClaims {
    fn kind(&self) -> TokenKind {
        self.kind
    }
    fn expires_at(&self) -> i64 {
        self.exp
    }
}

fn parse_subject(sub: &str) -> Result<UserId, AuthError> {
    sub.parse().map_err(|_| AuthError::TokenInvalid)
}

/// The authenticated principal of a single request.
///
/// Only [`TokenCodec::authenticate`] produces one, from a verified access
/// token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    user_id: UserId,
    email: String,
}

impl Identity {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    #[cfg(test)]
    pub(crate) fn for_tests(user_id: UserId, email: &str) -> Self {
        Self {
            user_id,
            email: email.to_string(),
        }
    }
}

impl TryFrom<AccessClaims> for Identity {
    type Error = AuthError;

    fn try_from(claims: AccessClaims) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: parse_subject(&claims.sub)?,
            email: claims.email,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Mints and verifies access/refresh tokens.
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    validation: Validation,
}

impl TokenCodec {
    pub fn new(config: &TokenConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        // Only HS256 is accepted; any other `alg` header fails decoding.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            access_ttl: Duration::hours(config.access_ttl_hours),
            validation,
        })
    }

    pub fn issue_pair(&self, user: &User) -> Result<TokenPair, AuthError> {
        self.issue_pair_at(user, Utc::now())
    }

    pub fn issue_pair_at(&self, user: &User, now: DateTime<Utc>) -> Result<TokenPair, AuthError> {
        let now = now.trunc_subsecs(0);
        let access_expires_at = now + self.access_ttl;
        let refresh_expires_at = now + Duration::days(REFRESH_TOKEN_TTL_DAYS);

        let access = AccessClaims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            kind: TokenKind::Access,
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: access_expires_at.timestamp(),
            iss: TOKEN_ISSUER.to_string(),
        };
        let refresh = RefreshClaims {
            sub: user.id.to_string(),
            kind: TokenKind::Refresh,
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: refresh_expires_at.timestamp(),
            iss: TOKEN_ISSUER.to_string(),
        };

        Ok(TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            access_expires_at,
            refresh_expires_at,
        })
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        self.verify_access_at(token, Utc::now())
    }

    pub fn verify_access_at(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, AuthError> {
        self.verify(token, TokenKind::Access, now)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        self.verify_refresh_at(token, Utc::now())
    }

    pub fn verify_refresh_at(&self, token: &str, now: DateTime<Utc>) -> Result<RefreshClaims, AuthError> {
        self.verify(token, TokenKind::Refresh, now)
    }

    /// Verifies an access token and turns it into the request identity.
    pub fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        Identity::try_from(self.verify_access(token)?)
    }

    fn sign<C: Serialize>(&self, claims: &C) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(AuthError::Encoding)
    }

    fn verify<C>(&self, token: &str, expected: TokenKind, now: DateTime<Utc>) -> Result<C, AuthError>
    where
        C: DeserializeOwned + TimeBounded,
    {
        // Signature and shape are checked before expiry, so a forged token is
        // never reported as merely expired.
        let data = decode::<C>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!(kind = ?e.kind(), "rejected token");
            AuthError::TokenInvalid
        })?;
        let claims = data.claims;

        if claims.kind() != expected {
            debug!(?expected, actual = ?claims.kind(), "token kind mismatch");
            return Err(AuthError::TokenInvalid);
        }
        if claims.expires_at() <= now.timestamp() {
            return Err(AuthError::TokenExpired);
        }
        Ok(claims)
    }
}

/// Extracts the token from an `Authorization` header value.
///
/// Anything other than exactly `Bearer <token>` is rejected.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingBearer)?;
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Ok(token),
        _ => Err(AuthError::MissingBearer),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn codec(secret: &str) -> TokenCodec {
        TokenCodec::new(&TokenConfig {
            secret: secret.to_string(),
            access_ttl_hours: 24,
        })
        .expect("valid token config")
    }

    pub(crate) fn user(id: UserId, email: &str) -> User {
        let now = Utc::now();
        User {
            id,
            name: "Test".to_string(),
            surname: "User".to_string(),
            email: email.to_string(),
            password_hash: String::new(),
            phone: String::new(),
            image_url: String::new(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn password_round_trip() {
        let hashed = hash_password_with_cost("abcdef", 4).unwrap();
        assert_ne!(hashed, "abcdef");
        assert!(verify_password("abcdef", &hashed).unwrap());
        assert!(!verify_password("abcdeg", &hashed).unwrap());
    }

    #[test]
    fn overlong_secret_is_rejected() {
        let long = "x".repeat(MAX_SECRET_BYTES + 1);
        assert!(matches!(
            hash_password(&long),
            Err(AuthError::SecretTooLong { limit: MAX_SECRET_BYTES })
        ));
    }

    #[test]
    fn access_token_valid_until_expiry() {
        let codec = codec("secret");
        let now = Utc::now();
        let pair = codec.issue_pair_at(&user(7, "u@x.com"), now).unwrap();
        assert!(pair.access_expires_at > now - Duration::seconds(1));
        assert_eq!(pair.refresh_expires_at - pair.access_expires_at, Duration::days(6));

        let claims = codec.verify_access_at(&pair.access_token, now).unwrap();
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.email, "u@x.com");
        assert_eq!(claims.iss, TOKEN_ISSUER);
        assert!(claims.exp > claims.iat);

        let just_before = pair.access_expires_at - Duration::seconds(1);
        assert!(codec.verify_access_at(&pair.access_token, just_before).is_ok());

        for at in [pair.access_expires_at, pair.access_expires_at + Duration::hours(1)] {
            assert!(matches!(
                codec.verify_access_at(&pair.access_token, at),
                Err(AuthError::TokenExpired)
            ));
        }
    }

    #[test]
    fn refresh_lifetime_ignores_access_ttl() {
        let codec = TokenCodec::new(&TokenConfig {
            secret: "secret".to_string(),
            access_ttl_hours: 1,
        })
        .unwrap();
        let now = Utc::now().trunc_subsecs(0);
        let pair = codec.issue_pair_at(&user(5, "t@x.com"), now).unwrap();
        assert_eq!(pair.access_expires_at - now, Duration::hours(1));
        assert_eq!(pair.refresh_expires_at - now, Duration::days(REFRESH_TOKEN_TTL_DAYS));

        let claims = codec.verify_refresh_at(&pair.refresh_token, now).unwrap();
        assert_eq!(claims.exp - claims.iat, Duration::days(7).num_seconds());
    }

    #[test]
    fn refresh_token_outlives_access_token() {
        let codec = codec("secret");
        let now = Utc::now();
        let pair = codec.issue_pair_at(&user(3, "r@x.com"), now).unwrap();
        let later = now + Duration::days(3);

        assert!(matches!(
            codec.verify_access_at(&pair.access_token, later),
            Err(AuthError::TokenExpired)
        ));
        let claims = codec.verify_refresh_at(&pair.refresh_token, later).unwrap();
        assert_eq!(claims.user_id().unwrap(), 3);

        assert!(matches!(
            codec.verify_refresh_at(&pair.refresh_token, now + Duration::days(7)),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn wrong_key_is_invalid_not_expired() {
        let pair = codec("one").issue_pair(&user(1, "a@x.com")).unwrap();
        let other = codec("two");
        assert!(matches!(other.verify_access(&pair.access_token), Err(AuthError::TokenInvalid)));

        // Even once past expiry the signature failure wins.
        let late = Utc::now() + Duration::days(30);
        assert!(matches!(
            other.verify_access_at(&pair.access_token, late),
            Err(AuthError::TokenInvalid)
        ));
    }

    #[test]
    fn other_algorithms_are_rejected() {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: "1".to_string(),
            email: "a@x.com".to_string(),
            kind: TokenKind::Access,
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + 3600,
            iss: TOKEN_ISSUER.to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(codec("secret").verify_access(&token), Err(AuthError::TokenInvalid)));
    }

    #[test]
    fn token_kinds_are_not_interchangeable() {
        let codec = codec("secret");
        let pair = codec.issue_pair(&user(1, "a@x.com")).unwrap();
        assert!(matches!(codec.verify_access(&pair.refresh_token), Err(AuthError::TokenInvalid)));
        assert!(matches!(codec.verify_refresh(&pair.access_token), Err(AuthError::TokenInvalid)));
    }

    #[test]
    fn garbage_is_invalid() {
        let codec = codec("secret");
        for token in ["", "abc", "a.b.c"] {
            assert!(matches!(codec.verify_access(token), Err(AuthError::TokenInvalid)));
        }
    }

    #[test]
    fn token_ids_are_fresh_per_issuance() {
        let codec = codec("secret");
        let u = user(1, "a@x.com");
        let first = codec.issue_pair(&u).unwrap();
        let second = codec.issue_pair(&u).unwrap();
        let a = codec.verify_access(&first.access_token).unwrap();
        let b = codec.verify_access(&second.access_token).unwrap();
        let r = codec.verify_refresh(&first.refresh_token).unwrap();
        assert_ne!(a.jti, b.jti);
        assert_ne!(a.jti, r.jti);
    }

    #[test]
    fn authenticate_yields_identity() {
        let codec = codec("secret");
        let pair = codec.issue_pair(&user(42, "id@x.com")).unwrap();
        let identity = codec.authenticate(&pair.access_token).unwrap();
        assert_eq!(identity.user_id(), 42);
        assert_eq!(identity.email(), "id@x.com");
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        for header in [None, Some(""), Some("Bearer"), Some("Bearer "), Some("Basic abc"), Some("bearer abc"), Some("Bearer a b")] {
            assert!(matches!(bearer_token(header), Err(AuthError::MissingBearer)));
        }
    }
}
