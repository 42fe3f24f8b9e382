//! PostgreSQL implementation of the gateway repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::repository::{
    decode_capabilities, AccessRepository, GatewayStore, ImpersonationRepository,
    InvitationRepository, OtpRepository, UserRepository,
};
use super::GatewayError;
use crate::models::{
    AuthProvider, CapabilitySet, EndReason, ImpersonationAuditLog, ImpersonationSession,
    Invitation, OtpAttempt, User,
};

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Translate unique-index violations into the domain error they stand for.
fn map_unique_violation(err: sqlx::Error) -> GatewayError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            match db_err.constraint() {
                Some("uq_users_username") => return GatewayError::UsernameTaken,
                Some("uq_users_email") | Some("uq_users_provider_subject") => {
                    return GatewayError::EmailTaken
                }
                Some("uq_impersonation_active_impersonator") => {
                    return GatewayError::AlreadyImpersonating
                }
                Some("uq_impersonation_active_target") => {
                    return GatewayError::TargetAlreadyImpersonated
                }
                _ => {}
            }
        }
    }
    GatewayError::Database(err)
}

const INSERT_USER_SQL: &str = r#"
    INSERT INTO users (user_id, username, email, password_hash, provider_code, provider_subject,
                       is_super_admin, can_impersonate, is_active, last_login_utc, created_utc)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

#[async_trait]
impl UserRepository for Database {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, GatewayError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, GatewayError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(username) = LOWER($1)")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, GatewayError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_user_by_provider(
        &self,
        provider: AuthProvider,
        subject: &str,
    ) -> Result<Option<User>, GatewayError> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE provider_code = $1 AND provider_subject = $2",
        )
        .bind(provider.as_str())
        .bind(subject)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn insert_user(&self, user: &User) -> Result<(), GatewayError> {
        bind_user(sqlx::query(INSERT_USER_SQL), user)
            .execute(&self.pool)
            .await
            .map_err(map_unique_violation)?;
        Ok(())
    }

    async fn touch_last_login(&self, user_id: Uuid) -> Result<(), GatewayError> {
        sqlx::query("UPDATE users SET last_login_utc = NOW() WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<bool, GatewayError> {
        let result = sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn bind_user<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    user: &'q User,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(user.user_id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.provider_code)
        .bind(&user.provider_subject)
        .bind(user.is_super_admin)
        .bind(user.can_impersonate)
        .bind(user.is_active)
        .bind(user.last_login_utc)
        .bind(user.created_utc)
}

#[async_trait]
impl InvitationRepository for Database {
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO invitations (invitation_id, token, email, provider_code, role_ids,
                                     expiry_utc, used_utc, used_by_user_id, created_by_user_id, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(invitation.invitation_id)
        .bind(&invitation.token)
        .bind(&invitation.email)
        .bind(&invitation.provider_code)
        .bind(&invitation.role_ids)
        .bind(invitation.expiry_utc)
        .bind(invitation.used_utc)
        .bind(invitation.used_by_user_id)
        .bind(invitation.created_by_user_id)
        .bind(invitation.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_invitation_by_token(
        &self,
        token: &str,
    ) -> Result<Option<Invitation>, GatewayError> {
        Ok(
            sqlx::query_as::<_, Invitation>("SELECT * FROM invitations WHERE token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    #[tracing::instrument(skip(self, user), fields(user_id = %user.user_id))]
    async fn register_with_invitation(
        &self,
        user: &User,
        invitation_id: Uuid,
    ) -> Result<(), GatewayError> {
        let mut tx = self.pool.begin().await?;

        bind_user(sqlx::query(INSERT_USER_SQL), user)
            .execute(&mut *tx)
            .await
            .map_err(map_unique_violation)?;

        // A concurrent redemption blocks on the row lock and then sees used_utc set.
        let claimed = sqlx::query(
            r#"
            UPDATE invitations
            SET used_utc = NOW(), used_by_user_id = $1
            WHERE invitation_id = $2 AND used_utc IS NULL AND expiry_utc > NOW()
            "#,
        )
        .bind(user.user_id)
        .bind(invitation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed != 1 {
            tx.rollback().await?;
            tracing::warn!(invitation_id = %invitation_id, "Invitation already redeemed");
            return Err(GatewayError::InvalidInvitation);
        }

        sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id)
            SELECT $1, r.role_id
            FROM roles r
            JOIN invitations i ON r.role_id = ANY(i.role_ids)
            WHERE i.invitation_id = $2
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user.user_id)
        .bind(invitation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl OtpRepository for Database {
    async fn invalidate_otps(&self, email: &str) -> Result<u64, GatewayError> {
        let result = sqlx::query(
            "UPDATE otp_attempts SET used_utc = NOW() WHERE LOWER(email) = LOWER($1) AND used_utc IS NULL",
        )
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_otp(&self, otp: &OtpAttempt) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO otp_attempts (otp_id, email, code_hash, created_utc, expiry_utc, used_utc, failed_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(otp.otp_id)
        .bind(&otp.email)
        .bind(&otp.code_hash)
        .bind(otp.created_utc)
        .bind(otp.expiry_utc)
        .bind(otp.used_utc)
        .bind(otp.failed_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_otp(&self, email: &str) -> Result<Option<OtpAttempt>, GatewayError> {
        Ok(sqlx::query_as::<_, OtpAttempt>(
            r#"
            SELECT * FROM otp_attempts
            WHERE LOWER(email) = LOWER($1)
            ORDER BY created_utc DESC
            LIMIT 1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn consume_otp(&self, otp_id: Uuid) -> Result<bool, GatewayError> {
        let result = sqlx::query(
            "UPDATE otp_attempts SET used_utc = NOW() WHERE otp_id = $1 AND used_utc IS NULL AND expiry_utc > NOW()",
        )
        .bind(otp_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_otp_failure(&self, otp_id: Uuid, max_failures: i32) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            UPDATE otp_attempts
            SET failed_attempts = failed_attempts + 1,
                used_utc = CASE WHEN failed_attempts + 1 >= $2 THEN NOW() ELSE used_utc END
            WHERE otp_id = $1 AND used_utc IS NULL
            "#,
        )
        .bind(otp_id)
        .bind(max_failures)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AccessRepository for Database {
    async fn has_application_access(
        &self,
        user_id: Uuid,
        slug: &str,
    ) -> Result<bool, GatewayError> {
        Ok(sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM user_roles ur
                JOIN roles r ON r.role_id = ur.role_id
                JOIN applications a ON a.application_id = r.application_id
                WHERE ur.user_id = $1 AND a.slug = $2 AND a.is_active
            )
            "#,
        )
        .bind(user_id)
        .bind(slug)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn user_capabilities(&self, user_id: Uuid) -> Result<CapabilitySet, GatewayError> {
        let blobs = sqlx::query_scalar::<_, serde_json::Value>(
            r#"
            SELECT r.permissions
            FROM user_roles ur
            JOIN roles r ON r.role_id = ur.role_id
            JOIN applications a ON a.application_id = r.application_id
            WHERE ur.user_id = $1 AND a.is_active
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(blobs
            .iter()
            .map(decode_capabilities)
            .fold(CapabilitySet::default(), CapabilitySet::union))
    }
}

#[async_trait]
impl ImpersonationRepository for Database {
    async fn insert_impersonation(
        &self,
        session: &ImpersonationSession,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO impersonation_sessions (
                impersonation_id, impersonator_id, impersonator_session_key, target_user_id,
                impersonated_session_key, reason, ip_address, user_agent, started_utc, expiry_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(session.impersonation_id)
        .bind(session.impersonator_id)
        .bind(&session.impersonator_session_key)
        .bind(session.target_user_id)
        .bind(&session.impersonated_session_key)
        .bind(&session.reason)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(session.started_utc)
        .bind(session.expiry_utc)
        .execute(&self.pool)
        .await
        .map_err(map_unique_violation)?;
        Ok(())
    }

    async fn set_impersonated_session_key(
        &self,
        impersonation_id: Uuid,
        session_key: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE impersonation_sessions SET impersonated_session_key = $1 WHERE impersonation_id = $2",
        )
        .bind(session_key)
        .bind(impersonation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_impersonation(
        &self,
        impersonation_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, GatewayError> {
        Ok(sqlx::query_as::<_, ImpersonationSession>(
            "SELECT * FROM impersonation_sessions WHERE impersonation_id = $1",
        )
        .bind(impersonation_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_active_by_impersonator(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, GatewayError> {
        Ok(sqlx::query_as::<_, ImpersonationSession>(
            "SELECT * FROM impersonation_sessions WHERE impersonator_id = $1 AND ended_utc IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_active_by_target(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ImpersonationSession>, GatewayError> {
        Ok(sqlx::query_as::<_, ImpersonationSession>(
            "SELECT * FROM impersonation_sessions WHERE target_user_id = $1 AND ended_utc IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn end_impersonation(
        &self,
        impersonation_id: Uuid,
        reason: EndReason,
        ended_by: Option<Uuid>,
    ) -> Result<bool, GatewayError> {
        let result = sqlx::query(
            r#"
            UPDATE impersonation_sessions
            SET ended_utc = NOW(), end_reason = $2, ended_by_user_id = $3
            WHERE impersonation_id = $1 AND ended_utc IS NULL
            "#,
        )
        .bind(impersonation_id)
        .bind(reason.as_str())
        .bind(ended_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_active_impersonations(
        &self,
    ) -> Result<Vec<ImpersonationSession>, GatewayError> {
        Ok(sqlx::query_as::<_, ImpersonationSession>(
            "SELECT * FROM impersonation_sessions WHERE ended_utc IS NULL ORDER BY started_utc DESC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn expire_impersonations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ImpersonationSession>, GatewayError> {
        Ok(sqlx::query_as::<_, ImpersonationSession>(
            r#"
            UPDATE impersonation_sessions
            SET ended_utc = $1, end_reason = 'expired'
            WHERE ended_utc IS NULL AND expiry_utc <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert_audit_log(&self, entry: &ImpersonationAuditLog) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO impersonation_audit_logs (
                audit_id, impersonation_id, action, resource_type, resource_id, http_method,
                endpoint, request_body_hash, response_status_code, ip_address, user_agent, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.audit_id)
        .bind(entry.impersonation_id)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.http_method)
        .bind(&entry.endpoint)
        .bind(&entry.request_body_hash)
        .bind(entry.response_status_code)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit_logs(
        &self,
        impersonation_id: Uuid,
    ) -> Result<Vec<ImpersonationAuditLog>, GatewayError> {
        Ok(sqlx::query_as::<_, ImpersonationAuditLog>(
            "SELECT * FROM impersonation_audit_logs WHERE impersonation_id = $1 ORDER BY created_utc",
        )
        .bind(impersonation_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl GatewayStore for Database {
    async fn health_check(&self) -> Result<(), GatewayError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(|e| {
            tracing::error!("Database health check failed: {}", e);
            GatewayError::Database(e)
        })?;
        Ok(())
    }
}
