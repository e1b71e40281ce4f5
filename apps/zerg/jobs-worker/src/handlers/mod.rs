//! Job handlers run by this service

pub mod audit_cleanup;
pub mod email;

pub use audit_cleanup::{AuditCleanupHandler, AuditCleanupPayload, AuditLogPurger, PgAuditLogPurger};
pub use email::{EmailHandler, EmailPayload, EmailSender, LoggingEmailSender};
