//! `audit.cleanup` jobs
//!
//! Deletes audit log rows older than the requested retention window.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use job_worker::{HandlerError, Job, JobContext, JobHandler, types};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, Statement};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditCleanupPayload {
    /// Non-positive values fall back to [`DEFAULT_RETENTION_DAYS`]
    #[serde(default)]
    pub retention_days: i64,
}

impl AuditCleanupPayload {
    pub fn effective_retention_days(&self) -> i64 {
        if self.retention_days <= 0 {
            DEFAULT_RETENTION_DAYS
        } else {
            self.retention_days
        }
    }
}

/// Removes audit log rows created before a cutoff
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditLogPurger: Send + Sync {
    /// Returns the number of deleted rows
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, DbErr>;
}

pub struct PgAuditLogPurger {
    db: DatabaseConnection,
}

impl PgAuditLogPurger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditLogPurger for PgAuditLogPurger {
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, DbErr> {
        let sql = "DELETE FROM audit_logs WHERE created_at < $1";

        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [cutoff.into()]);

        let result = self.db.execute_raw(stmt).await?;

        Ok(result.rows_affected())
    }
}

pub struct AuditCleanupHandler {
    purger: Arc<dyn AuditLogPurger>,
}

impl AuditCleanupHandler {
    pub fn new(purger: Arc<dyn AuditLogPurger>) -> Self {
        Self { purger }
    }
}

fn cutoff_for(now: DateTime<Utc>, retention_days: i64) -> Result<DateTime<Utc>, HandlerError> {
    TimeDelta::try_days(retention_days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| HandlerError::failed(format!("retention of {retention_days} days is out of range")))
}

#[async_trait]
impl JobHandler for AuditCleanupHandler {
    fn job_type(&self) -> &str {
        types::AUDIT_CLEANUP
    }

    async fn handle(&self, _ctx: &JobContext, job: &Job) -> Result<(), HandlerError> {
        let payload: AuditCleanupPayload = job.unmarshal_payload()?;
        let retention_days = payload.effective_retention_days();
        let cutoff = cutoff_for(Utc::now(), retention_days)?;

        info!(job_id = %job.id(), retention_days, cutoff = %cutoff, "Cleaning up audit logs");

        let deleted = self
            .purger
            .purge_before(cutoff)
            .await
            .map_err(|e| HandlerError::with_source("Failed to delete audit logs", e))?;

        info!(job_id = %job.id(), deleted, "Audit logs cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_worker::shutdown_channel;
    use sea_orm::{MockDatabase, MockExecResult};
    use serde_json::json;
    use std::time::Duration;

    fn context() -> JobContext {
        let (_tx, signal) = shutdown_channel();
        JobContext::new(0, 1, Duration::from_secs(5), signal)
    }

    fn cleanup_job(payload: serde_json::Value) -> Job {
        Job::new(types::AUDIT_CLEANUP, &payload).unwrap()
    }

    #[test]
    fn test_retention_defaults() {
        assert_eq!(AuditCleanupPayload::default().effective_retention_days(), 90);
        assert_eq!(
            AuditCleanupPayload { retention_days: -5 }.effective_retention_days(),
            90
        );
        assert_eq!(
            AuditCleanupPayload { retention_days: 30 }.effective_retention_days(),
            30
        );
    }

    #[test]
    fn test_cutoff_out_of_range() {
        assert!(cutoff_for(Utc::now(), i64::MAX).is_err());
        let now = Utc::now();
        assert_eq!(cutoff_for(now, 1).unwrap(), now - TimeDelta::days(1));
    }

    #[tokio::test]
    async fn test_purges_with_requested_retention() {
        let before = Utc::now();
        let mut purger = MockAuditLogPurger::new();
        purger
            .expect_purge_before()
            .withf(move |cutoff| {
                let expected = before - TimeDelta::days(30);
                *cutoff >= expected && *cutoff < expected + TimeDelta::minutes(1)
            })
            .times(1)
            .returning(|_| Ok(12));

        let handler = AuditCleanupHandler::new(Arc::new(purger));
        let job = cleanup_job(json!({"retention_days": 30}));

        handler.handle(&context(), &job).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_payload_uses_default_retention() {
        let before = Utc::now();
        let mut purger = MockAuditLogPurger::new();
        purger
            .expect_purge_before()
            .withf(move |cutoff| *cutoff <= before - TimeDelta::days(89))
            .times(1)
            .returning(|_| Ok(0));

        let handler = AuditCleanupHandler::new(Arc::new(purger));
        handler.handle(&context(), &cleanup_job(json!({}))).await.unwrap();
    }

    #[tokio::test]
    async fn test_database_error_fails_job() {
        let mut purger = MockAuditLogPurger::new();
        purger
            .expect_purge_before()
            .returning(|_| Err(DbErr::Custom("connection reset".into())));

        let handler = AuditCleanupHandler::new(Arc::new(purger));
        let err = handler
            .handle(&context(), &cleanup_job(json!({"retention_days": 7})))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("audit logs"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_wrong_payload_type_fails() {
        let mut purger = MockAuditLogPurger::new();
        purger.expect_purge_before().never();

        let handler = AuditCleanupHandler::new(Arc::new(purger));
        let err = handler
            .handle(&context(), &cleanup_job(json!({"retention_days": "forever"})))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Payload(_)));
    }

    #[tokio::test]
    async fn test_pg_purger_reports_rows_affected() {
        let db = MockDatabase::new(DbBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 42,
            }])
            .into_connection();

        let purger = PgAuditLogPurger::new(db);
        let deleted = purger.purge_before(Utc::now()).await.unwrap();

        assert_eq!(deleted, 42);
    }
}
