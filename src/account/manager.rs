/// Account manager implementation
///
/// Every credential check goes through the attempt log first and records its
/// outcome afterwards. Clients only ever see the generic failure message.
use crate::{
    account::{
        validate_fields, validate_password_strength, BootstrapRequest, ChangePasswordRequest,
        LoginRequest, MfaVerifyRequest, SignupRequest,
    },
    admin::{
        AdminUser, AdminUserManager, AuditEvent, AuditLog, InviteCode, InviteCodeManager,
        NewAdminUser, Role,
    },
    auth::{
        AdminSession, AttemptType, AuthAttempt, AuthAttemptLog, ClientInfo, CsrfGuard, MfaService,
        SessionStore,
    },
    crypto::{secure_compare, CredentialVault},
    error::{HoleError, HoleResult},
};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;

const INVALID_CREDENTIALS: &str = "Invalid email or password";

/// A freshly created session
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub user: AdminUser,
    pub session: AdminSession,
    pub csrf_token: String,
}

/// Result of the password step
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    SignedIn(SignedIn),
    MfaRequired { mfa_token: String, user: AdminUser },
}

/// Result of the second-factor step
#[derive(Debug, Clone)]
pub struct MfaSignIn {
    pub signed_in: SignedIn,
    pub used_backup_code: bool,
    /// Set when the client asked to remember this device
    pub trusted_device: Option<String>,
}

/// Account manager service
#[derive(Clone)]
pub struct AccountManager {
    db: SqlitePool,
    vault: Arc<CredentialVault>,
    users: AdminUserManager,
    sessions: SessionStore,
    csrf: CsrfGuard,
    mfa: MfaService,
    attempts: AuthAttemptLog,
    invites: InviteCodeManager,
    audit: AuditLog,
    bootstrap_secret: Option<SecretString>,
}

impl AccountManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: SqlitePool,
        vault: Arc<CredentialVault>,
        sessions: SessionStore,
        csrf: CsrfGuard,
        mfa: MfaService,
        attempts: AuthAttemptLog,
        invites: InviteCodeManager,
        audit: AuditLog,
        bootstrap_secret: Option<SecretString>,
    ) -> Self {
        Self {
            users: AdminUserManager::new(db.clone()),
            db,
            vault,
            sessions,
            csrf,
            mfa,
            attempts,
            invites,
            audit,
            bootstrap_secret,
        }
    }

    /// Password step of sign-in
    ///
    /// Unknown email, wrong password, inactive and unactivated accounts all
    /// fail with the same message. A trusted device skips the MFA challenge.
    pub async fn login(
        &self,
        request: &LoginRequest,
        trusted_device: Option<&str>,
        client: &ClientInfo,
    ) -> HoleResult<LoginOutcome> {
        let email = request.email.trim().to_lowercase();
        self.attempts
            .check(Some(&email), &client.ip_hash, AttemptType::Login)
            .await?;

        let Some(user) = self.users.find_by_email(&email).await? else {
            self.vault.verify_dummy_password(&request.password).await;
            return Err(self.login_failed(None, &email, client, "unknown_email").await);
        };

        if !self
            .vault
            .verify_password(&request.password, &user.password_hash)
            .await
        {
            return Err(self
                .login_failed(Some(&user.id), &email, client, "invalid_password")
                .await);
        }
        if !user.is_active {
            return Err(self
                .login_failed(Some(&user.id), &email, client, "account_inactive")
                .await);
        }
        if user.activated_at.is_none() {
            return Err(self
                .login_failed(Some(&user.id), &email, client, "account_not_activated")
                .await);
        }

        self.record_attempt(AttemptType::Login, Some(&user.id), Some(&email), client, None)
            .await;

        if user.totp_enabled {
            let trusted = match trusted_device {
                Some(token) => self.mfa.is_trusted(token, &user.id).await?,
                None => false,
            };

            if !trusted {
                let mfa_token = self
                    .mfa
                    .issue_challenge(&user.id, &client.ip_hash, &client.user_agent)
                    .await?;
                tracing::debug!("MFA challenge issued for user {}", user.id);
                return Ok(LoginOutcome::MfaRequired { mfa_token, user });
            }
        }

        let signed_in = self.start_session(user, client, "login").await?;
        Ok(LoginOutcome::SignedIn(signed_in))
    }

    /// Second-factor step of sign-in
    pub async fn verify_mfa(
        &self,
        request: &MfaVerifyRequest,
        client: &ClientInfo,
    ) -> HoleResult<MfaSignIn> {
        let verified = self
            .mfa
            .verify_challenge(
                &request.mfa_token,
                &request.code,
                &client.ip_hash,
                &client.user_agent,
            )
            .await?;

        let trusted_device = if request.remember_device {
            Some(
                self.mfa
                    .trust_device(&verified.user.id, &client.ip_hash, &client.user_agent)
                    .await?,
            )
        } else {
            None
        };

        if verified.used_backup_code {
            self.audit
                .record(
                    AuditEvent::new("backup_code_used")
                        .by(&verified.user.id)
                        .from_ip(&client.ip_hash)
                        .details(json!({ "remaining": verified.remaining_backup_codes })),
                )
                .await;
        }

        let signed_in = self.start_session(verified.user, client, "login").await?;

        Ok(MfaSignIn {
            signed_in,
            used_backup_code: verified.used_backup_code,
            trusted_device,
        })
    }

    /// Create an inactive account from an invite code
    ///
    /// The role comes from the invite. The account and the redemption commit
    /// together; losing the redemption race rolls the account back.
    pub async fn signup(&self, request: &SignupRequest, client: &ClientInfo) -> HoleResult<String> {
        let email = request.email.trim().to_lowercase();
        self.attempts
            .check(Some(&email), &client.ip_hash, AttemptType::Signup)
            .await?;

        validate_fields(request)?;
        validate_password_strength(&request.password)?;

        let Some(invite) = self.invites.find_by_code(request.invite_code.trim()).await? else {
            self.record_failure(AttemptType::Signup, None, Some(&email), client, "unknown_invite")
                .await;
            return Err(HoleError::Validation("Invalid invite code".to_string()));
        };

        if let Err(e) = invite.check_redeemable(&email, Utc::now()) {
            self.record_failure(AttemptType::Signup, None, Some(&email), client, "invite_unusable")
                .await;
            return Err(e);
        }

        let password_hash = self.vault.hash_password(&request.password).await?;

        let user_id = match self
            .create_invited_user(&invite, &email, &password_hash, request)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.record_failure(
                    AttemptType::Signup,
                    None,
                    Some(&email),
                    client,
                    "signup_conflict",
                )
                .await;
                return Err(e);
            }
        };

        self.record_attempt(AttemptType::Signup, Some(&user_id), Some(&email), client, None)
            .await;
        self.audit
            .record(
                AuditEvent::new("signup")
                    .by(&user_id)
                    .on("admin_user", &user_id)
                    .from_ip(&client.ip_hash)
                    .details(json!({ "role": invite.role, "invite": invite.id })),
            )
            .await;
        tracing::info!(
            "Admin account {} created from invite; awaiting activation by an administrator",
            user_id
        );

        Ok(user_id)
    }

    async fn create_invited_user(
        &self,
        invite: &InviteCode,
        email: &str,
        password_hash: &str,
        request: &SignupRequest,
    ) -> HoleResult<String> {
        let mut tx = self.db.begin().await?;

        let user_id = AdminUserManager::insert(
            &mut tx,
            NewAdminUser {
                email,
                password_hash,
                first_name: &request.first_name,
                last_name: &request.last_name,
                role: invite.role,
                activated: false,
            },
        )
        .await?;

        InviteCodeManager::redeem(&mut tx, &invite.id, &user_id).await?;

        tx.commit().await?;
        Ok(user_id)
    }

    /// Create the first admin
    ///
    /// Disabled when no bootstrap secret is configured. Only succeeds while
    /// no admin account exists.
    pub async fn bootstrap(
        &self,
        request: &BootstrapRequest,
        client: &ClientInfo,
    ) -> HoleResult<AdminUser> {
        let Some(expected) = &self.bootstrap_secret else {
            return Err(HoleError::Authorization("Bootstrap is disabled".to_string()));
        };

        self.attempts
            .check(None, &client.ip_hash, AttemptType::Bootstrap)
            .await?;

        if !secure_compare(expected.expose_secret(), &request.secret) {
            self.record_failure(AttemptType::Bootstrap, None, None, client, "invalid_secret")
                .await;
            return Err(HoleError::Authentication("Invalid bootstrap secret".to_string()));
        }

        validate_fields(request)?;
        validate_password_strength(&request.password)?;

        let password_hash = self.vault.hash_password(&request.password).await?;
        let inserted = self
            .users
            .insert_first_admin(NewAdminUser {
                email: &request.email,
                password_hash: &password_hash,
                first_name: &request.first_name,
                last_name: &request.last_name,
                role: Role::Admin,
                activated: true,
            })
            .await?;

        let Some(user_id) = inserted else {
            self.record_failure(
                AttemptType::Bootstrap,
                None,
                Some(&request.email),
                client,
                "admin_exists",
            )
            .await;
            return Err(HoleError::Conflict("An admin account already exists".to_string()));
        };

        self.record_attempt(
            AttemptType::Bootstrap,
            Some(&user_id),
            Some(&request.email),
            client,
            None,
        )
        .await;
        self.audit
            .record(
                AuditEvent::new("bootstrap_admin")
                    .by(&user_id)
                    .on("admin_user", &user_id)
                    .from_ip(&client.ip_hash),
            )
            .await;
        tracing::info!("First admin account {} created", user_id);

        self.users.get(&user_id).await
    }

    /// End a session; unknown sessions are ignored
    pub async fn logout(&self, session_id: &str, client: &ClientInfo) -> HoleResult<()> {
        if let Some((user, session)) = self.sessions.validate_session(session_id).await? {
            self.audit
                .record(AuditEvent::new("logout").by(&user.id).from_ip(&client.ip_hash))
                .await;
            self.sessions.invalidate(&session.id).await?;
        } else {
            self.sessions.invalidate(session_id).await?;
        }
        Ok(())
    }

    /// Change the signed-in user's password
    ///
    /// Revokes every other session and forgets trusted devices. Returns the
    /// number of sessions revoked.
    pub async fn change_password(
        &self,
        user: &AdminUser,
        current_session: &str,
        request: &ChangePasswordRequest,
        client: &ClientInfo,
    ) -> HoleResult<u64> {
        self.attempts
            .check(Some(&user.email), &client.ip_hash, AttemptType::Login)
            .await?;

        if !self
            .vault
            .verify_password(&request.current_password, &user.password_hash)
            .await
        {
            self.record_failure(
                AttemptType::Login,
                Some(&user.id),
                Some(&user.email),
                client,
                "password_change_wrong_current",
            )
            .await;
            return Err(HoleError::Authentication(
                "Current password is incorrect".to_string(),
            ));
        }

        validate_password_strength(&request.new_password)?;
        if request.new_password == request.current_password {
            return Err(HoleError::Validation(
                "New password must differ from the current one".to_string(),
            ));
        }

        let password_hash = self.vault.hash_password(&request.new_password).await?;
        self.users.update_password_hash(&user.id, &password_hash).await?;

        let revoked = self
            .sessions
            .invalidate_all_for_user(&user.id, Some(current_session))
            .await?;
        self.mfa.forget_devices(&user.id).await?;

        self.audit
            .record(
                AuditEvent::new("password_change")
                    .by(&user.id)
                    .on("admin_user", &user.id)
                    .from_ip(&client.ip_hash)
                    .details(json!({ "sessionsRevoked": revoked })),
            )
            .await;

        Ok(revoked)
    }

    async fn start_session(
        &self,
        user: AdminUser,
        client: &ClientInfo,
        action: &str,
    ) -> HoleResult<SignedIn> {
        let session = self
            .sessions
            .create_session(&user.id, &client.ip_hash, &client.user_agent)
            .await?;
        self.users.record_login(&user.id).await?;
        let csrf_token = self.csrf.issue_token(&session.id)?;

        self.audit
            .record(AuditEvent::new(action).by(&user.id).from_ip(&client.ip_hash))
            .await;
        tracing::info!("Admin user {} signed in", user.id);

        Ok(SignedIn {
            user,
            session,
            csrf_token,
        })
    }

    async fn login_failed(
        &self,
        user_id: Option<&str>,
        email: &str,
        client: &ClientInfo,
        reason: &str,
    ) -> HoleError {
        self.record_failure(AttemptType::Login, user_id, Some(email), client, reason)
            .await;
        HoleError::Authentication(INVALID_CREDENTIALS.to_string())
    }

    async fn record_attempt(
        &self,
        attempt_type: AttemptType,
        user_id: Option<&str>,
        email: Option<&str>,
        client: &ClientInfo,
        failure_reason: Option<&str>,
    ) {
        self.attempts
            .record(AuthAttempt {
                attempt_type,
                user_id,
                email,
                ip_hash: &client.ip_hash,
                user_agent: &client.user_agent,
                success: failure_reason.is_none(),
                failure_reason,
            })
            .await;
    }

    async fn record_failure(
        &self,
        attempt_type: AttemptType,
        user_id: Option<&str>,
        email: Option<&str>,
        client: &ClientInfo,
        reason: &str,
    ) {
        self.record_attempt(attempt_type, user_id, email, client, Some(reason))
            .await;
    }
}
