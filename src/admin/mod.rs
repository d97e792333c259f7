/// Back-office administration
///
/// Roles, admin accounts, invite codes and the audit trail.

pub mod audit;
pub mod invites;
pub mod roles;
pub mod users;

pub use audit::{AuditEvent, AuditLog, AuditLogEntry};
pub use invites::{InviteCode, InviteCodeManager};
pub use roles::{require_role, Role};
pub use users::{AdminUser, AdminUserManager, NewAdminUser};
