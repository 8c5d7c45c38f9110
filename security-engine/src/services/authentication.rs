use service_core::retry::{retry_async, RetryConfig};
use std::net::IpAddr;
use std::sync::Arc;

use super::audit::AuditSink;
use super::clock::Clock;
use super::credentials::CredentialStore;
use super::error::SecurityError;
use super::jwt::TokenManager;
use super::lockout::LockoutManager;
use super::password::{PasswordManager, PasswordViolation};
use crate::models::{
    AccountLockout, Credential, SecurityEvent, SecurityEventType, Severity, SubjectClaims,
    TokenPair, TokenPurpose,
};

/// Hashed at construction so unknown usernames cost the same as known ones.
const DUMMY_PASSWORD: &str = "dummy-password-for-constant-work";

/// Credential flows built on the engine components.
pub struct Authenticator {
    passwords: Arc<PasswordManager>,
    tokens: Arc<TokenManager>,
    lockout: Arc<LockoutManager>,
    credentials: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    dummy_hash: String,
}

impl Authenticator {
    pub fn new(
        passwords: Arc<PasswordManager>,
        tokens: Arc<TokenManager>,
        lockout: Arc<LockoutManager>,
        credentials: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
    ) -> Result<Self, anyhow::Error> {
        let dummy_hash = passwords.hash(DUMMY_PASSWORD)?;
        Ok(Self {
            passwords,
            tokens,
            lockout,
            credentials,
            audit,
            clock,
            retry,
            dummy_hash,
        })
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Credential>, SecurityError> {
        let found = retry_async(&self.retry, "credentials.find_by_username", || {
            self.credentials.find_by_username(username)
        })
        .await?;
        Ok(found)
    }

    async fn credential(&self, subject_id: &str) -> Result<Credential, SecurityError> {
        retry_async(&self.retry, "credentials.get_credential", || {
            self.credentials.get_credential(subject_id)
        })
        .await?
        .ok_or(SecurityError::InvalidCredentials)
    }

    async fn save(&self, credential: Credential) -> Result<(), SecurityError> {
        retry_async(&self.retry, "credentials.update_credential", || {
            self.credentials.update_credential(credential.clone())
        })
        .await?;
        Ok(())
    }

    async fn emit(&self, event: SecurityEvent) -> Result<(), SecurityError> {
        retry_async(&self.retry, "audit.record", || self.audit.record(&event)).await?;
        Ok(())
    }

    fn event(&self, event_type: SecurityEventType, severity: Severity, details: &str) -> SecurityEvent {
        SecurityEvent::new(event_type, severity, details, self.clock.now())
    }

    /// A locked account is refused before any password work happens.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        ip: IpAddr,
        user_agent: Option<&str>,
    ) -> Result<TokenPair, SecurityError> {
        let status = self.lockout.check_lockout(username);
        if let (true, Some(until)) = (status.locked, status.expires_at) {
            let mut event = self
                .event(SecurityEventType::LoginFailed, Severity::Warning, "account locked")
                .ip(ip)
                .blocked(true);
            event.user_agent = user_agent.map(str::to_string);
            self.emit(event).await?;
            return Err(SecurityError::AccountLocked { until });
        }

        let credential = self.find_by_username(username).await?;
        let verified = match &credential {
            Some(c) => self.passwords.verify(password, &c.password_hash),
            None => {
                self.passwords.verify(password, &self.dummy_hash);
                false
            }
        };

        let credential = match credential {
            Some(c) if verified => c,
            other => {
                let triggered =
                    self.lockout
                        .record_attempt(username, ip, false, Some("invalid credentials"));
                let subject = other.map(|c| c.subject_id);

                if let Some(lockout) = triggered {
                    self.emit(
                        self.event(SecurityEventType::AccountLocked, Severity::Critical, &lockout.reason)
                            .subject(subject.clone())
                            .ip(ip),
                    )
                    .await?;
                }

                let mut event = self
                    .event(SecurityEventType::LoginFailed, Severity::Warning, "invalid credentials")
                    .subject(subject)
                    .ip(ip);
                event.user_agent = user_agent.map(str::to_string);
                self.emit(event).await?;

                tracing::info!(%ip, "Login failed");
                return Err(SecurityError::InvalidCredentials);
            }
        };

        self.lockout.record_attempt(username, ip, true, None);
        let pair = self.tokens.issue_pair(&SubjectClaims::from(&credential))?;

        let mut event = self
            .event(SecurityEventType::LoginSucceeded, Severity::Info, "login succeeded")
            .subject(Some(credential.subject_id.clone()))
            .ip(ip);
        event.user_agent = user_agent.map(str::to_string);
        self.emit(event).await?;

        tracing::info!(subject = %credential.subject_id, "Login succeeded");
        Ok(pair)
    }

    /// Revokes the access token and, when given, the refresh token.
    pub async fn logout(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), SecurityError> {
        let claims = self.tokens.validate(access_token, TokenPurpose::Access).await?;
        self.tokens.revoke(access_token, Some("logout")).await?;
        if let Some(refresh) = refresh_token {
            self.tokens.revoke(refresh, Some("logout")).await?;
        }

        self.emit(
            self.event(SecurityEventType::Logout, Severity::Info, "logout")
                .subject(Some(claims.sub)),
        )
        .await
    }

    /// Rotate a session: the refresh token is single-use.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<TokenPair, SecurityError> {
        let claims = self
            .tokens
            .consume(refresh_token, TokenPurpose::Refresh, "rotated")
            .await?;
        // Re-read so role and email changes reach the new tokens.
        let credential = self.credential(&claims.sub).await?;
        let pair = self.tokens.issue_pair(&SubjectClaims::from(&credential))?;

        self.emit(
            self.event(SecurityEventType::TokenRefreshed, Severity::Info, "session refreshed")
                .subject(Some(claims.sub)),
        )
        .await?;
        Ok(pair)
    }

    fn check_new_password(
        &self,
        credential: &Credential,
        new_password: &str,
    ) -> Result<(), SecurityError> {
        self.passwords
            .validate_strength(new_password, &credential.username)
            .map_err(SecurityError::PolicyViolation)?;

        if self.passwords.verify(new_password, &credential.password_hash)
            || self
                .passwords
                .check_history(new_password, &credential.password_history)
        {
            return Err(SecurityError::PolicyViolation(vec![
                PasswordViolation::RecentlyUsed,
            ]));
        }
        Ok(())
    }

    async fn store_new_password(
        &self,
        mut credential: Credential,
        new_password: &str,
    ) -> Result<(), SecurityError> {
        let hash = self
            .passwords
            .hash(new_password)
            .map_err(|e| SecurityError::Internal(e.to_string()))?;
        credential.rotate_password(
            hash,
            self.passwords.policy().history_size,
            self.clock.now(),
        );
        self.save(credential).await
    }

    pub async fn change_password(
        &self,
        subject_id: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), SecurityError> {
        let credential = self.credential(subject_id).await?;

        if !self
            .passwords
            .verify(current_password, &credential.password_hash)
        {
            self.emit(
                self.event(
                    SecurityEventType::LoginFailed,
                    Severity::Warning,
                    "wrong current password on password change",
                )
                .subject(Some(subject_id.to_string())),
            )
            .await?;
            return Err(SecurityError::InvalidCredentials);
        }

        self.check_new_password(&credential, new_password)?;
        self.store_new_password(credential, new_password).await?;

        self.emit(
            self.event(SecurityEventType::PasswordChanged, Severity::Info, "password changed")
                .subject(Some(subject_id.to_string())),
        )
        .await
    }

    /// `None` for unknown usernames; callers should respond the same either way.
    pub async fn issue_password_reset(&self, username: &str) -> Result<Option<String>, SecurityError> {
        let Some(credential) = self.find_by_username(username).await? else {
            tracing::debug!("Password reset requested for unknown username");
            return Ok(None);
        };

        let token = self
            .tokens
            .issue_for(&SubjectClaims::from(&credential), TokenPurpose::PasswordReset)?;

        self.emit(
            self.event(
                SecurityEventType::PasswordResetRequested,
                Severity::Info,
                "password reset token issued",
            )
            .subject(Some(credential.subject_id)),
        )
        .await?;
        Ok(Some(token))
    }

    /// Reset tokens are consumed on use. A rejected password leaves the token usable.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), SecurityError> {
        let claims = self
            .tokens
            .validate(token, TokenPurpose::PasswordReset)
            .await?;
        let credential = self.credential(&claims.sub).await?;

        self.check_new_password(&credential, new_password)?;
        self.tokens.claim(token, "consumed").await?;
        self.store_new_password(credential, new_password).await?;

        self.emit(
            self.event(SecurityEventType::PasswordReset, Severity::Warning, "password reset")
                .subject(Some(claims.sub)),
        )
        .await
    }

    pub async fn issue_email_verification(&self, subject_id: &str) -> Result<String, SecurityError> {
        let credential = self.credential(subject_id).await?;
        self.tokens.issue_for(
            &SubjectClaims::from(&credential),
            TokenPurpose::EmailVerification,
        )
    }

    pub async fn verify_email(&self, token: &str) -> Result<(), SecurityError> {
        let claims = self
            .tokens
            .consume(token, TokenPurpose::EmailVerification, "consumed")
            .await?;
        let mut credential = self.credential(&claims.sub).await?;
        credential.email_verified = true;
        self.save(credential).await?;

        self.emit(
            self.event(SecurityEventType::EmailVerified, Severity::Info, "email verified")
                .subject(Some(claims.sub)),
        )
        .await
    }

    /// Audited early unlock. `None` when the account was not locked.
    pub async fn unlock_account(
        &self,
        username: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Option<AccountLockout>, SecurityError> {
        let Some(closed) = self.lockout.unlock(username, actor, reason) else {
            return Ok(None);
        };

        self.emit(self.event(
            SecurityEventType::AccountUnlocked,
            Severity::Warning,
            &format!("unlocked {} by {}: {}", username, actor, reason),
        ))
        .await?;
        Ok(Some(closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LockoutConfig, PasswordPolicyConfig, SigningSecret, TokenConfig};
    use crate::services::audit::MemoryAuditSink;
    use crate::services::clock::ManualClock;
    use crate::services::credentials::InMemoryCredentialStore;
    use crate::services::revocation::{
        InMemoryRevocationStore, RevocationStore, YieldingRevocationStore,
    };
    use chrono::{Duration, TimeZone, Utc};

    const PASSWORD: &str = "Tr0ub4dor&3!long";

    struct Harness {
        auth: Authenticator,
        audit: Arc<MemoryAuditSink>,
        store: Arc<InMemoryCredentialStore>,
        clock: Arc<ManualClock>,
        tokens: Arc<TokenManager>,
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InMemoryRevocationStore::new()))
    }

    fn harness_with(revocations: Arc<dyn RevocationStore>) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap(),
        ));
        let passwords = Arc::new(PasswordManager::new(PasswordPolicyConfig {
            argon_memory_kib: 64,
            argon_iterations: 1,
            history_size: 2,
            ..PasswordPolicyConfig::default()
        }));
        let tokens = Arc::new(TokenManager::new(
            TokenConfig {
                secret: SigningSecret::new("unit-test-secret-with-enough-bytes"),
                ..TokenConfig::default()
            },
            clock.clone(),
            revocations,
            RetryConfig::no_retry(),
        ));
        let lockout = Arc::new(LockoutManager::new(
            LockoutConfig {
                threshold: 3,
                window_seconds: 60,
                ..LockoutConfig::default()
            },
            clock.clone(),
        ));
        let store = Arc::new(InMemoryCredentialStore::new());
        store.insert(Credential::new(
            "42",
            "alice",
            "alice@example.com",
            "editor",
            passwords.hash(PASSWORD).unwrap(),
            clock.now(),
        ));
        let audit = Arc::new(MemoryAuditSink::new());

        let auth = Authenticator::new(
            passwords,
            tokens.clone(),
            lockout,
            store.clone(),
            audit.clone(),
            clock.clone(),
            RetryConfig::no_retry(),
        )
        .unwrap();

        Harness {
            auth,
            audit,
            store,
            clock,
            tokens,
        }
    }

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_login_issues_token_pair() {
        let h = harness();
        let pair = h.auth.login("alice", PASSWORD, ip(), Some("Firefox")).await.unwrap();

        assert_eq!(pair.token_type, "Bearer");
        let claims = h
            .tokens
            .validate(&pair.access_token, TokenPurpose::Access)
            .await
            .unwrap();
        assert_eq!(claims.sub, "42");
        assert_eq!(
            h.audit.events().last().unwrap().event_type,
            SecurityEventType::LoginSucceeded
        );
    }

    #[tokio::test]
    async fn test_unknown_user_and_wrong_password_look_the_same() {
        let h = harness();
        let unknown = h.auth.login("mallory", PASSWORD, ip(), None).await.unwrap_err();
        let wrong = h.auth.login("alice", "Wrong-Pass-99!", ip(), None).await.unwrap_err();

        assert_eq!(unknown.public_message(), wrong.public_message());
        assert!(matches!(unknown, SecurityError::InvalidCredentials));
        assert!(matches!(wrong, SecurityError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_lockout_short_circuits_correct_password() {
        let h = harness();
        for _ in 0..3 {
            let _ = h.auth.login("alice", "Wrong-Pass-99!", ip(), None).await;
        }

        let err = h.auth.login("alice", PASSWORD, ip(), None).await.unwrap_err();
        assert!(matches!(err, SecurityError::AccountLocked { .. }));
        assert!(h
            .audit
            .events()
            .iter()
            .any(|e| e.event_type == SecurityEventType::AccountLocked));

        let closed = h
            .auth
            .unlock_account("alice", "admin-1", "identity confirmed")
            .await
            .unwrap();
        assert!(closed.is_some());
        assert!(h.auth.login("alice", PASSWORD, ip(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_session_rotates() {
        let h = harness();
        let pair = h.auth.login("alice", PASSWORD, ip(), None).await.unwrap();

        let next = h.auth.refresh_session(&pair.refresh_token).await.unwrap();
        assert_ne!(next.refresh_token, pair.refresh_token);
        assert!(matches!(
            h.auth.refresh_session(&pair.refresh_token).await,
            Err(SecurityError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn test_locked_account_refused_under_any_case() {
        let h = harness();
        for _ in 0..3 {
            let _ = h.auth.login("alice", "Wrong-Pass-99!", ip(), None).await;
        }

        for variant in ["Alice", "ALICE", " alice"] {
            assert!(
                matches!(
                    h.auth.login(variant, PASSWORD, ip(), None).await,
                    Err(SecurityError::AccountLocked { .. })
                ),
                "{} got through",
                variant
            );
        }
    }

    #[tokio::test]
    async fn test_failures_across_case_variants_lock() {
        let h = harness();
        for variant in ["alice", "Alice", "ALICE"] {
            let _ = h.auth.login(variant, "Wrong-Pass-99!", ip(), None).await;
        }
        assert!(matches!(
            h.auth.login("alice", PASSWORD, ip(), None).await,
            Err(SecurityError::AccountLocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_rotates_once() {
        let h = harness_with(Arc::new(YieldingRevocationStore::default()));
        let pair = h.auth.login("alice", PASSWORD, ip(), None).await.unwrap();

        let (first, second) = tokio::join!(
            h.auth.refresh_session(&pair.refresh_token),
            h.auth.refresh_session(&pair.refresh_token),
        );
        assert!(first.is_ok() != second.is_ok());
        let loser = if first.is_ok() { second } else { first };
        assert!(matches!(loser, Err(SecurityError::TokenRevoked)));
    }

    #[tokio::test]
    async fn test_concurrent_reset_consumes_token_once() {
        let h = harness_with(Arc::new(YieldingRevocationStore::default()));
        let token = h.auth.issue_password_reset("alice").await.unwrap().unwrap();

        let (first, second) = tokio::join!(
            h.auth.reset_password(&token, "Fr3sh-Start!xy"),
            h.auth.reset_password(&token, "An0ther-One!zz"),
        );
        assert!(first.is_ok() != second.is_ok());
        let loser = if first.is_ok() { second } else { first };
        assert!(matches!(loser, Err(SecurityError::TokenRevoked)));

        let resets = h
            .audit
            .events()
            .iter()
            .filter(|e| e.event_type == SecurityEventType::PasswordReset)
            .count();
        assert_eq!(resets, 1);
    }

    #[tokio::test]
    async fn test_weak_reset_password_keeps_token() {
        let h = harness();
        let token = h.auth.issue_password_reset("alice").await.unwrap().unwrap();

        assert!(matches!(
            h.auth.reset_password(&token, "weak").await,
            Err(SecurityError::PolicyViolation(_))
        ));
        h.auth.reset_password(&token, "Fr3sh-Start!xy").await.unwrap();
    }

    #[tokio::test]
    async fn test_logout_revokes_tokens() {
        let h = harness();
        let pair = h.auth.login("alice", PASSWORD, ip(), None).await.unwrap();

        h.auth
            .logout(&pair.access_token, Some(pair.refresh_token.as_str()))
            .await
            .unwrap();

        assert!(h.tokens.is_revoked(&pair.access_token).await.unwrap());
        assert!(h.tokens.is_revoked(&pair.refresh_token).await.unwrap());
    }

    #[tokio::test]
    async fn test_change_password_enforces_policy_and_history() {
        let h = harness();

        assert!(matches!(
            h.auth.change_password("42", "Wrong-Pass-99!", "N3w-Passw0rd!x").await,
            Err(SecurityError::InvalidCredentials)
        ));
        assert!(matches!(
            h.auth.change_password("42", PASSWORD, "weak").await,
            Err(SecurityError::PolicyViolation(_))
        ));
        match h.auth.change_password("42", PASSWORD, PASSWORD).await {
            Err(SecurityError::PolicyViolation(v)) => {
                assert_eq!(v, vec![PasswordViolation::RecentlyUsed])
            }
            other => panic!("expected reuse violation, got {:?}", other),
        }

        h.auth
            .change_password("42", PASSWORD, "N3w-Passw0rd!x")
            .await
            .unwrap();
        let stored = h.store.get_credential("42").await.unwrap().unwrap();
        assert_eq!(stored.password_history.len(), 1);

        // The old password is now history and cannot come back.
        assert!(matches!(
            h.auth.change_password("42", "N3w-Passw0rd!x", PASSWORD).await,
            Err(SecurityError::PolicyViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_password_reset_token_is_one_shot() {
        let h = harness();
        assert!(h.auth.issue_password_reset("nobody").await.unwrap().is_none());

        let token = h.auth.issue_password_reset("alice").await.unwrap().unwrap();
        h.auth.reset_password(&token, "Fr3sh-Start!xy").await.unwrap();

        assert!(matches!(
            h.auth.reset_password(&token, "An0ther-One!zz").await,
            Err(SecurityError::TokenRevoked)
        ));
        assert!(h.auth.login("alice", "Fr3sh-Start!xy", ip(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_token_cannot_be_used_as_access_token() {
        let h = harness();
        let token = h.auth.issue_password_reset("alice").await.unwrap().unwrap();

        assert!(matches!(
            h.auth.logout(&token, None).await,
            Err(SecurityError::TokenPurposeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_email_verification_flow() {
        let h = harness();
        let token = h.auth.issue_email_verification("42").await.unwrap();

        h.clock.advance(Duration::hours(1));
        h.auth.verify_email(&token).await.unwrap();

        assert!(h.store.get_credential("42").await.unwrap().unwrap().email_verified);
        assert!(h.auth.verify_email(&token).await.is_err());
    }
}
