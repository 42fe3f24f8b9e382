//! OTP attempt model - second factor codes for local logins.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Wrong guesses a code survives before it is burned.
pub const MAX_OTP_FAILURES: i32 = 5;

/// A generated code. Only the SHA-256 hash of the code is stored.
#[derive(Debug, Clone, FromRow)]
pub struct OtpAttempt {
    pub otp_id: Uuid,
    pub email: String,
    pub code_hash: String,
    pub created_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub used_utc: Option<DateTime<Utc>>,
    pub failed_attempts: i32,
}

impl OtpAttempt {
    pub fn new(email: String, code_hash: String, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            otp_id: Uuid::new_v4(),
            email,
            code_hash,
            created_utc: now,
            expiry_utc: now + ttl,
            used_utc: None,
            failed_attempts: 0,
        }
    }

    /// Check if the code is still valid (not expired and not used).
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.used_utc.is_none() && now < self.expiry_utc
    }
}
