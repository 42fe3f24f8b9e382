pub mod audit;
pub mod metrics;
pub mod session;

pub use audit::impersonation_audit_middleware;
pub use metrics::metrics_middleware;
pub use session::{
    require_super_admin, session_middleware, CurrentSession, OptionalSession, SessionUser,
};
