pub mod application;
pub mod impersonation;
pub mod invitation;
pub mod otp_code;
pub mod session;
pub mod user;

pub use application::{Application, CapabilitySet, Role};
pub use impersonation::{AuditAction, EndReason, ImpersonationAuditLog, ImpersonationSession};
pub use invitation::{Invitation, InvitationProvider};
pub use otp_code::{OtpAttempt, MAX_OTP_FAILURES};
pub use session::{Impersonator, Session};
pub use user::{AuthProvider, User, UserProfile};
