//! Database queries for the job queue.
//!
//! Every statement runs in its own autocommit transaction; with
//! `synchronous=FULL` it is durable once the call returns.

use cardlink_core::db::unix_timestamp;

use super::db::{DatabaseError, QueueDatabase};
use super::models::QueuedJob;

impl QueueDatabase {
    /// Append a job and return the stored row.
    pub async fn insert_job(
        &self,
        job_type: &str,
        data: &str,
        retries: i64,
    ) -> Result<QueuedJob, DatabaseError> {
        let now = unix_timestamp();

        let job = sqlx::query_as::<_, QueuedJob>(
            r"
            INSERT INTO job_queue (job_type, data, retries, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, job_type, data, retries, created_at, last_attempt
            ",
        )
        .bind(job_type)
        .bind(data)
        .bind(retries.max(0))
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok(job)
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<QueuedJob>, DatabaseError> {
        let jobs = sqlx::query_as::<_, QueuedJob>(
            "SELECT id, job_type, data, retries, created_at, last_attempt FROM job_queue ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    /// The oldest `limit` jobs.
    pub async fn list_jobs_limit(&self, limit: i64) -> Result<Vec<QueuedJob>, DatabaseError> {
        let jobs = sqlx::query_as::<_, QueuedJob>(
            r"
            SELECT id, job_type, data, retries, created_at, last_attempt
            FROM job_queue ORDER BY id LIMIT ?
            ",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    /// Delete a job. Returns whether a row existed.
    pub async fn delete_job(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bump a job's retry count and stamp the attempt time.
    ///
    /// Returns the new count, or `None` if the job no longer exists.
    pub async fn increment_job_retries(&self, id: i64) -> Result<Option<i64>, DatabaseError> {
        let now = unix_timestamp();
        let retries: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE job_queue SET retries = retries + 1, last_attempt = ?
            WHERE id = ?
            RETURNING retries
            ",
        )
        .bind(now)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(retries)
    }

    pub async fn count_jobs(&self) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Whether a job of `job_type` already carries cloud job `cloud_job_id`.
    pub async fn has_cloud_job(
        &self,
        job_type: &str,
        cloud_job_id: &str,
    ) -> Result<bool, DatabaseError> {
        let found: Option<i64> = sqlx::query_scalar(
            r"
            SELECT 1 FROM job_queue
            WHERE job_type = ?
              AND CASE WHEN json_valid(data) THEN json_extract(data, '$.jobId') END = ?
            LIMIT 1
            ",
        )
        .bind(job_type)
        .bind(cloud_job_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(found.is_some())
    }
}
