//! Registration, login, token refresh and profile updates.
//!
//! These calls hash or verify passwords and are CPU-heavy; async callers run
//! them on the blocking pool.

use bcrypt::DEFAULT_COST;
use std::sync::{Arc, OnceLock};
use tracing::info;

use crate::auth::{hash_password_with_cost, verify_password, Identity, TokenCodec, TokenPair};
use crate::error::{AuthError, StorageError};
use crate::models::{NewUser, User};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub password: String,
    pub phone: String,
}

#[derive(Debug, Clone)]
pub struct ProfileUpdate {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub phone: String,
    pub description: String,
    /// A new password; `None` keeps the current hash.
    pub password: Option<String>,
}

// Verified against on unknown emails so a miss costs as much as a wrong password.
const DUMMY_PASSWORD: &str = "bulb-dummy-password";

fn email_conflict(err: StorageError) -> AuthError {
    match err {
        StorageError::EmailTaken => AuthError::EmailAlreadyExists,
        other => AuthError::Storage(other),
    }
}

#[derive(Clone)]
pub struct Accounts {
    storage: Storage,
    tokens: Arc<TokenCodec>,
    hash_cost: u32,
    dummy_hash: Arc<OnceLock<String>>,
}

impl Accounts {
    pub fn new(storage: Storage, tokens: Arc<TokenCodec>) -> Self {
        Self {
            storage,
            tokens,
            hash_cost: DEFAULT_COST,
            dummy_hash: Arc::new(OnceLock::new()),
        }
    }

    /// Overrides the bcrypt work factor used for new password hashes.
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self.dummy_hash = Arc::new(OnceLock::new());
        self
    }

    pub fn tokens(&self) -> &TokenCodec {
        &self.tokens
    }

    fn dummy_hash(&self) -> Result<&str, AuthError> {
        if let Some(hash) = self.dummy_hash.get() {
            return Ok(hash);
        }
        let hash = hash_password_with_cost(DUMMY_PASSWORD, self.hash_cost)?;
        Ok(self.dummy_hash.get_or_init(|| hash))
    }

    pub fn register(&self, registration: Registration) -> Result<(User, TokenPair), AuthError> {
        if self.storage.find_user_by_email(&registration.email)?.is_some() {
            return Err(AuthError::EmailAlreadyExists);
        }
        let password_hash = hash_password_with_cost(&registration.password, self.hash_cost)?;
        let user = self
            .storage
            .create_user(NewUser {
                name: registration.name,
                surname: registration.surname,
                email: registration.email,
                password_hash,
                phone: registration.phone,
            })
            .map_err(email_conflict)?;

        let pair = self.tokens.issue_pair(&user)?;
        info!(user_id = user.id, "user registered");
        Ok((user, pair))
    }

    /// Unknown email and wrong password both yield `InvalidCredentials`.
    pub fn login(&self, email: &str, password: &str) -> Result<(User, TokenPair), AuthError> {
        let Some(user) = self.storage.find_user_by_email(email)? else {
            verify_password(password, self.dummy_hash()?)?;
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(password, &user.password_hash)? {
            info!(user_id = user.id, "login rejected");
            return Err(AuthError::InvalidCredentials);
        }
        let pair = self.tokens.issue_pair(&user)?;
        info!(user_id = user.id, "user logged in");
        Ok((user, pair))
    }

    /// Exchanges a refresh token for a new pair. The user is re-read so the
    /// new access token carries the email currently on file.
    pub fn refresh(&self, refresh_token: &str) -> Result<(User, TokenPair), AuthError> {
        let claims = self.tokens.verify_refresh(refresh_token)?;
        let user = self
            .storage
            .find_user_by_id(claims.user_id()?)?
            .ok_or(AuthError::TokenInvalid)?;
        let pair = self.tokens.issue_pair(&user)?;
        info!(user_id = user.id, "tokens refreshed");
        Ok((user, pair))
    }

    pub fn profile(&self, identity: &Identity) -> Result<User, AuthError> {
        self.storage
            .find_user_by_id(identity.user_id())?
            .ok_or(AuthError::ResourceNotFound)
    }

    pub fn update_profile(&self, identity: &Identity, update: ProfileUpdate) -> Result<User, AuthError> {
        let mut user = self.profile(identity)?;

        if update.email != user.email && self.storage.find_user_by_email(&update.email)?.is_some() {
            return Err(AuthError::EmailAlreadyExists);
        }
        if let Some(password) = update.password.as_deref() {
            user.password_hash = hash_password_with_cost(password, self.hash_cost)?;
        }
        user.name = update.name;
        user.surname = update.surname;
        user.email = update.email;
        user.phone = update.phone;
        user.description = update.description;

        let saved = self
            .storage
            .update_user(&user)
            .map_err(email_conflict)?
            .ok_or(AuthError::ResourceNotFound)?;
        info!(user_id = saved.id, "profile updated");
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::codec;
    use crate::storage::tests::temp_storage;

    fn registration(email: &str, password: &str) -> Registration {
        Registration {
            name: "Uma".to_string(),
            surname: "Xu".to_string(),
            email: email.to_string(),
            password: password.to_string(),
            phone: String::new(),
        }
    }

    fn accounts() -> (tempfile::TempDir, Accounts) {
        let (dir, storage) = temp_storage();
        (dir, Accounts::new(storage, Arc::new(codec("test-secret"))).with_hash_cost(4))
    }

    #[test]
    fn register_then_login() {
        let (_dir, accounts) = accounts();
        let (user, pair) = accounts.register(registration("u@x.com", "abcdef")).unwrap();
        assert!(!pair.access_token.is_empty());
        assert_ne!(user.password_hash, "abcdef");

        let (logged_in, pair) = accounts.login("u@x.com", "abcdef").unwrap();
        assert_eq!(logged_in.id, user.id);
        assert!(!pair.refresh_token.is_empty());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let (_dir, accounts) = accounts();
        accounts.register(registration("u@x.com", "abcdef")).unwrap();
        assert!(matches!(
            accounts.register(registration("u@x.com", "other1")),
            Err(AuthError::EmailAlreadyExists)
        ));
    }

    #[test]
    fn bad_logins_are_indistinguishable() {
        let (_dir, accounts) = accounts();
        accounts.register(registration("u@x.com", "abcdef")).unwrap();
        let wrong_password = accounts.login("u@x.com", "nope!!").unwrap_err();
        let unknown_email = accounts.login("who@x.com", "abcdef").unwrap_err();
        assert!(matches!(wrong_password, AuthError::InvalidCredentials));
        assert!(matches!(unknown_email, AuthError::InvalidCredentials));
        assert_eq!(wrong_password.to_string(), unknown_email.to_string());
    }

    #[test]
    fn unknown_email_still_runs_bcrypt() {
        let (_dir, accounts) = accounts();
        assert!(accounts.dummy_hash.get().is_none());

        assert!(matches!(accounts.login("ghost@x.com", "abcdef"), Err(AuthError::InvalidCredentials)));
        let dummy = accounts.dummy_hash.get().expect("dummy hash computed on miss");
        assert!(dummy.starts_with("$2"));
        assert!(dummy.contains("$04$"));

        // Reused on later misses.
        accounts.login("ghost2@x.com", "abcdef").unwrap_err();
        assert_eq!(accounts.dummy_hash.get(), Some(dummy));
    }

    #[test]
    fn refresh_reflects_current_email() {
        let (_dir, accounts) = accounts();
        let (user, pair) = accounts.register(registration("old@x.com", "abcdef")).unwrap();
        let identity = Identity::for_tests(user.id, "old@x.com");

        accounts
            .update_profile(
                &identity,
                ProfileUpdate {
                    name: user.name.clone(),
                    surname: user.surname.clone(),
                    email: "new@x.com".to_string(),
                    phone: String::new(),
                    description: "likes dares".to_string(),
                    password: None,
                },
            )
            .unwrap();

        let (_, refreshed) = accounts.refresh(&pair.refresh_token).unwrap();
        let claims = accounts.tokens.verify_access(&refreshed.access_token).unwrap();
        assert_eq!(claims.email, "new@x.com");

        // The password survives a profile update without one.
        assert!(accounts.login("new@x.com", "abcdef").is_ok());
    }

    #[test]
    fn refresh_rejects_access_tokens() {
        let (_dir, accounts) = accounts();
        let (_, pair) = accounts.register(registration("u@x.com", "abcdef")).unwrap();
        assert!(matches!(accounts.refresh(&pair.access_token), Err(AuthError::TokenInvalid)));
    }

    #[test]
    fn password_change_replaces_credential() {
        let (_dir, accounts) = accounts();
        let (user, _) = accounts.register(registration("u@x.com", "abcdef")).unwrap();
        let identity = Identity::for_tests(user.id, "u@x.com");
        accounts
            .update_profile(
                &identity,
                ProfileUpdate {
                    name: user.name,
                    surname: user.surname,
                    email: user.email,
                    phone: String::new(),
                    description: String::new(),
                    password: Some("ghijkl".to_string()),
                },
            )
            .unwrap();

        assert!(matches!(accounts.login("u@x.com", "abcdef"), Err(AuthError::InvalidCredentials)));
        assert!(accounts.login("u@x.com", "ghijkl").is_ok());
    }
}
