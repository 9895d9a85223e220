//! Registration, login and bearer sessions.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use mailroom_mime::Mailbox;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::time::Duration;
use tracing::{debug, info};

use crate::user::{User, UserRepository};
use crate::{Error, Result};

/// Shortest accepted password, in characters.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Session and password-hashing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthConfig {
    /// How long a login stays valid.
    pub session_ttl: Duration,
    /// Argon2 memory cost in KiB.
    pub password_memory_kib: u32,
    /// Argon2 iterations.
    pub password_iterations: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(7 * 24 * 3600),
            password_memory_kib: Params::DEFAULT_M_COST,
            password_iterations: Params::DEFAULT_T_COST,
        }
    }
}

/// A freshly issued login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Bearer token; only its digest is stored.
    pub token: String,
    /// When the token stops working.
    pub expires_at: DateTime<Utc>,
    /// The logged-in user.
    pub user: User,
}

/// The caller behind a valid bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// The user.
    pub user: User,
    /// Digest of the presented token.
    pub token_hash: String,
}

/// Registration, login and token checks.
#[derive(Debug, Clone)]
pub struct AuthService {
    users: UserRepository,
    session_ttl: chrono::Duration,
    params: Params,
}

impl AuthService {
    /// Creates the service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the hashing cost is out of range.
    pub fn new(users: UserRepository, config: AuthConfig) -> Result<Self> {
        let params = Params::new(
            config.password_memory_kib,
            config.password_iterations,
            Params::DEFAULT_P_COST,
            None,
        )
        .map_err(|e| Error::Validation(format!("password hashing cost: {e}")))?;
        let session_ttl = chrono::Duration::from_std(config.session_ttl)
            .map_err(|_| Error::Validation("session lifetime is too long".into()))?;
        Ok(Self {
            users,
            session_ttl,
            params,
        })
    }

    /// Registers a new account.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed address or short
    /// password and [`Error::Conflict`] if the address is taken.
    pub async fn register(&self, email: &str, password: &str, display_name: &str) -> Result<User> {
        let mailbox = Mailbox::bare(email.trim())
            .map_err(|_| Error::Validation(format!("{:?} is not an email address", email.trim())))?;
        check_password(password)?;

        let display_name = match display_name.trim() {
            "" => mailbox
                .address
                .split('@')
                .next()
                .unwrap_or_default()
                .to_string(),
            name => name.to_string(),
        };
        let hash = self.hash(password).await?;
        let user = self.users.create(&mailbox.address, &display_name, &hash).await?;
        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Checks credentials and issues a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] if the address or password is wrong.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let rejected = || Error::Unauthorized("invalid email or password".into());
        let (user, hash) = self.users.credentials(email).await?.ok_or_else(rejected)?;
        if !self.verify(password, hash).await? {
            debug!(user_id = %user.id, "password mismatch");
            return Err(rejected());
        }

        let token = new_token();
        let expires_at = Utc::now() + self.session_ttl;
        self.users
            .create_session(&token_digest(&token), user.id, expires_at)
            .await?;
        self.users.touch_login(user.id).await?;
        info!(user_id = %user.id, "user logged in");

        let user = self.users.get(user.id).await?.unwrap_or(user);
        Ok(Session {
            token,
            expires_at,
            user,
        })
    }

    /// Resolves a bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] for an unknown or expired token.
    /// Expired sessions are purged.
    pub async fn authenticate(&self, token: &str) -> Result<Principal> {
        let token_hash = token_digest(token.trim());
        let (user_id, expires_at) = self
            .users
            .session(&token_hash)
            .await?
            .ok_or_else(|| Error::Unauthorized("invalid session".into()))?;

        let now = Utc::now();
        if expires_at <= now {
            let purged = self.users.purge_expired_sessions(now).await?;
            debug!(purged, "expired sessions removed");
            return Err(Error::Unauthorized("session expired".into()));
        }

        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| Error::Unauthorized("invalid session".into()))?;
        Ok(Principal { user, token_hash })
    }

    /// Ends the caller's session.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn logout(&self, principal: &Principal) -> Result<()> {
        self.users.delete_session(&principal.token_hash).await
    }

    /// Changes the caller's password and ends every other session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] if `current` is wrong and
    /// [`Error::Validation`] if `new` is too short.
    pub async fn change_password(
        &self,
        principal: &Principal,
        current: &str,
        new: &str,
    ) -> Result<()> {
        let hash = self
            .users
            .password_hash(principal.user.id)
            .await?
            .ok_or_else(|| Error::not_found("user", principal.user.id))?;
        if !self.verify(current, hash).await? {
            return Err(Error::Unauthorized("current password is wrong".into()));
        }
        check_password(new)?;

        let hash = self.hash(new).await?;
        self.users.set_password_hash(principal.user.id, &hash).await?;
        let revoked = self
            .users
            .delete_other_sessions(principal.user.id, &principal.token_hash)
            .await?;
        info!(user_id = %principal.user.id, revoked, "password changed");
        Ok(())
    }

    async fn hash(&self, password: &str) -> Result<String> {
        let hasher = self.hasher();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
                .map_err(|e| Error::PasswordHash(e.to_string()))?;
            hasher
                .hash_password(password.as_bytes(), &salt)
                .map(|h| h.to_string())
                .map_err(|e| Error::PasswordHash(e.to_string()))
        })
        .await
        .map_err(|e| Error::PasswordHash(e.to_string()))?
    }

    async fn verify(&self, password: &str, hash: String) -> Result<bool> {
        let hasher = self.hasher();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&hash).map_err(|e| Error::PasswordHash(e.to_string()))?;
            Ok(hasher.verify_password(password.as_bytes(), &parsed).is_ok())
        })
        .await
        .map_err(|e| Error::PasswordHash(e.to_string()))?
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

fn check_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// 32 random bytes, base64url.
fn new_token() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}

/// Hex SHA-256 of a token, the form sessions are stored under.
pub(crate) fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn service(ttl: Duration) -> (AuthService, UserRepository) {
        let db = Database::in_memory().await.unwrap();
        let users = UserRepository::new(&db);
        let config = AuthConfig {
            session_ttl: ttl,
            password_memory_kib: 64,
            password_iterations: 1,
        };
        (AuthService::new(users.clone(), config).unwrap(), users)
    }

    #[test]
    fn digest_is_sha256_hex() {
        assert_eq!(
            token_digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(new_token().len(), 43);
    }

    #[tokio::test]
    async fn register_login_authenticate_logout() {
        let (auth, _) = service(Duration::from_secs(3600)).await;
        let user = auth.register(" ada@example.com ", "correct horse", "").await.unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.display_name, "ada");

        assert!(matches!(
            auth.login("ada@example.com", "wrong password").await,
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            auth.login("nobody@example.com", "correct horse").await,
            Err(Error::Unauthorized(_))
        ));

        let session = auth.login("ADA@example.com", "correct horse").await.unwrap();
        assert!(session.user.last_login_at.is_some());
        let principal = auth.authenticate(&session.token).await.unwrap();
        assert_eq!(principal.user.id, user.id);

        auth.logout(&principal).await.unwrap();
        assert!(matches!(
            auth.authenticate(&session.token).await,
            Err(Error::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn registration_rules() {
        let (auth, _) = service(Duration::from_secs(3600)).await;
        assert!(matches!(
            auth.register("not-an-address", "long enough", "x").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            auth.register("ada@example.com", "short", "x").await,
            Err(Error::Validation(_))
        ));
        auth.register("ada@example.com", "long enough", "Ada").await.unwrap();
        assert!(matches!(
            auth.register("Ada@Example.com", "long enough", "Ada").await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn expired_sessions_are_rejected_and_purged() {
        let (auth, users) = service(Duration::from_millis(1)).await;
        auth.register("ada@example.com", "long enough", "Ada").await.unwrap();
        let session = auth.login("ada@example.com", "long enough").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            auth.authenticate(&session.token).await,
            Err(Error::Unauthorized(_))
        ));
        assert!(users.session(&token_digest(&session.token)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn password_change_revokes_other_sessions() {
        let (auth, _) = service(Duration::from_secs(3600)).await;
        auth.register("ada@example.com", "first password", "Ada").await.unwrap();
        let laptop = auth.login("ada@example.com", "first password").await.unwrap();
        let phone = auth.login("ada@example.com", "first password").await.unwrap();
        let principal = auth.authenticate(&laptop.token).await.unwrap();

        assert!(matches!(
            auth.change_password(&principal, "wrong", "second password").await,
            Err(Error::Unauthorized(_))
        ));
        auth.change_password(&principal, "first password", "second password")
            .await
            .unwrap();

        assert!(auth.authenticate(&laptop.token).await.is_ok());
        assert!(auth.authenticate(&phone.token).await.is_err());
        assert!(auth.login("ada@example.com", "first password").await.is_err());
        auth.login("ada@example.com", "second password").await.unwrap();
    }
}
