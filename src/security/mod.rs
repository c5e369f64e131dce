pub mod audit;
pub mod pdp;

pub use audit::{AuditLog, AuditRecord};
pub use pdp::PolicyDecisionPoint;
