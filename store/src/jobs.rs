//! Job queue operations.
//!
//! Status transitions all follow the same shape: a transaction that re-reads
//! the current status, applies the transition only if it is legal, mirrors
//! the result onto the linked message row where required, and recomputes the
//! dense queue positions of the remaining pending jobs.

use std::time::Duration;

use rusqlite::{OptionalExtension, Transaction, params};

use relay_types::{
    EnqueueOptions, EnqueueReceipt, Job, JobId, JobKind, JobPayload, JobStatus, MessageId,
    PendingSnapshot, ProcessingSnapshot, QueueSnapshot,
};

use crate::{Store, StoreError, now_ms};

/// Error message recorded when a job is cancelled.
pub(crate) const CANCELLED_MESSAGE: &str = "Job was cancelled";

const JOB_COLUMNS: &str = "id, conversation_id, kind, status, priority, queue_position, \
     requested_model, model_sequence, max_wait_secs, payload, content, thinking, sources, \
     queued_at, started_at, completed_at, last_update_at, error_message, message_id";

/// Raw row image; converted into [`Job`] outside the rusqlite closure so
/// parse failures surface as [`StoreError`] instead of panics.
struct RawJob {
    id: i64,
    conversation_id: String,
    kind: String,
    status: String,
    priority: i64,
    queue_position: i64,
    requested_model: String,
    model_sequence: String,
    max_wait_secs: i64,
    payload: String,
    content: String,
    thinking: String,
    sources: Option<String>,
    queued_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    last_update_at: i64,
    error_message: Option<String>,
    message_id: i64,
}

impl RawJob {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            kind: row.get(2)?,
            status: row.get(3)?,
            priority: row.get(4)?,
            queue_position: row.get(5)?,
            requested_model: row.get(6)?,
            model_sequence: row.get(7)?,
            max_wait_secs: row.get(8)?,
            payload: row.get(9)?,
            content: row.get(10)?,
            thinking: row.get(11)?,
            sources: row.get(12)?,
            queued_at: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
            last_update_at: row.get(16)?,
            error_message: row.get(17)?,
            message_id: row.get(18)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let sources = match self.sources {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        Ok(Job {
            id: JobId::new(self.id),
            conversation_id: self.conversation_id,
            kind: JobKind::parse(&self.kind)?,
            status: JobStatus::parse(&self.status)?,
            priority: self.priority,
            queue_position: self.queue_position,
            requested_model: self.requested_model,
            model_sequence: serde_json::from_str(&self.model_sequence)?,
            max_wait_secs: self.max_wait_secs.max(0) as u64,
            payload: serde_json::from_str::<JobPayload>(&self.payload)?,
            content: self.content,
            thinking: self.thinking,
            sources,
            queued_at: self.queued_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_update_at: self.last_update_at,
            error_message: self.error_message,
            message_id: MessageId::new(self.message_id),
        })
    }
}

/// Jobs the reaper should fail, split by which scan found them.
#[derive(Debug, Default)]
pub struct StaleJobs {
    pub timed_out_pending: Vec<JobId>,
    pub stalled_streaming: Vec<JobId>,
}

impl Store {
    /// Insert a new pending job plus its placeholder assistant message.
    ///
    /// The placeholder lets UIs render the assistant turn immediately; it is
    /// linked back to the job and flipped to a terminal status with the job.
    pub fn enqueue(
        &self,
        conversation_id: &str,
        kind: JobKind,
        payload: &JobPayload,
        resolved_model: &str,
        opts: &EnqueueOptions,
        default_max_wait_secs: u64,
    ) -> Result<EnqueueReceipt, StoreError> {
        let now = now_ms();
        let max_wait = opts.max_wait_secs.unwrap_or(default_max_wait_secs);
        let payload_json = serde_json::to_string(payload)?;
        let sequence_json = serde_json::to_string(&opts.model_sequence)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO messages (conversation_id, role, content, status, job_id)
             VALUES (?1, 'assistant', '', 'streaming', NULL)",
            params![conversation_id],
        )?;
        let message_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO jobs (conversation_id, kind, status, priority, queue_position,
                 requested_model, model_sequence, max_wait_secs, payload,
                 queued_at, last_update_at, message_id)
             VALUES (?1, ?2, 'pending', ?3, 0, ?4, ?5, ?6, ?7, ?8, ?8, ?9)",
            params![
                conversation_id,
                kind.as_str(),
                opts.priority,
                resolved_model,
                sequence_json,
                max_wait as i64,
                payload_json,
                now,
                message_id,
            ],
        )?;
        let job_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE messages SET job_id = ?1 WHERE id = ?2",
            params![job_id, message_id],
        )?;

        recompute_positions(&tx)?;

        let queue_position: i64 = tx.query_row(
            "SELECT queue_position FROM jobs WHERE id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;

        tx.commit()?;

        Ok(EnqueueReceipt {
            job_id: JobId::new(job_id),
            message_id: MessageId::new(message_id),
            queue_position,
            resolved_model: resolved_model.to_string(),
        })
    }

    /// Transition a specific pending job to `streaming`.
    ///
    /// Atomic: returns `None` when the job is no longer pending (it was
    /// cancelled or reaped since being picked) or when another job is already
    /// streaming. Never two streams at once.
    pub fn claim(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let streaming: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'streaming'",
            [],
            |row| row.get(0),
        )?;
        if streaming > 0 {
            return Ok(None);
        }

        let now = now_ms();
        let updated = tx.execute(
            "UPDATE jobs SET status = 'streaming', started_at = ?1, last_update_at = ?1,
                 queue_position = 0
             WHERE id = ?2 AND status = 'pending'",
            params![now, job_id.value()],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        recompute_positions(&tx)?;
        let job = query_job(&tx, job_id)?;
        tx.commit()?;
        Ok(job)
    }

    /// Transition the next pending job by `(priority DESC, queued_at ASC)` to
    /// `streaming`. The batching-disabled path.
    pub fn start_next(&self) -> Result<Option<Job>, StoreError> {
        let next_id = {
            let conn = self.conn();
            conn.query_row(
                "SELECT id FROM jobs WHERE status = 'pending'
                 ORDER BY priority DESC, queued_at ASC, id ASC LIMIT 1",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        };
        match next_id {
            Some(id) => self.claim(JobId::new(id)),
            None => Ok(None),
        }
    }

    /// Append streamed deltas to a job.
    ///
    /// Only legal while the job is streaming; appends that arrive after a
    /// terminal transition are dropped and reported via the `false` return.
    /// `sources` is set at most once; later values are ignored.
    pub fn append_content(
        &self,
        job_id: JobId,
        content: &str,
        thinking: &str,
        sources: Option<&serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let sources_json = match sources {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE jobs SET content = content || ?1, thinking = thinking || ?2,
                 sources = COALESCE(sources, ?3), last_update_at = ?4
             WHERE id = ?5 AND status = 'streaming'",
            params![content, thinking, sources_json, now_ms(), job_id.value()],
        )?;
        Ok(updated > 0)
    }

    /// Transition `streaming → completed` and freeze content.
    ///
    /// Returns `None` when the job is not streaming (already terminal);
    /// a cancelled job can never become completed.
    pub fn complete(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.finish(job_id, JobStatus::Completed, None, &["streaming"])
    }

    /// Transition to `error` with a human-readable message.
    pub fn fail(&self, job_id: JobId, message: &str) -> Result<Option<Job>, StoreError> {
        self.finish(
            job_id,
            JobStatus::Error,
            Some(message),
            &["pending", "streaming"],
        )
    }

    /// Transition to `cancelled`. Idempotent: cancelling a terminal job is a
    /// no-op returning `None`.
    pub fn cancel(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.finish(
            job_id,
            JobStatus::Cancelled,
            Some(CANCELLED_MESSAGE),
            &["pending", "streaming"],
        )
    }

    fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<&str>,
        from: &[&str],
    ) -> Result<Option<Job>, StoreError> {
        debug_assert!(status.is_terminal());
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![job_id.value()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(StoreError::JobNotFound(job_id));
        };
        if !from.contains(&current.as_str()) {
            return Ok(None);
        }

        let now = now_ms();
        tx.execute(
            "UPDATE jobs SET status = ?1, completed_at = ?2, last_update_at = ?2,
                 queue_position = 0, error_message = COALESCE(?3, error_message)
             WHERE id = ?4",
            params![status.as_str(), now, error_message, job_id.value()],
        )?;

        // Mirror the outcome onto the placeholder message so transcripts
        // render without consulting the job table.
        tx.execute(
            "UPDATE messages SET
                 content = (SELECT content FROM jobs WHERE id = ?1),
                 thinking = (SELECT thinking FROM jobs WHERE id = ?1),
                 sources = (SELECT sources FROM jobs WHERE id = ?1),
                 status = ?2
             WHERE job_id = ?1",
            params![job_id.value(), status.as_str()],
        )?;

        recompute_positions(&tx)?;
        let job = query_job(&tx, job_id)?;
        tx.commit()?;
        Ok(job)
    }

    pub fn job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id.value()],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    /// Pending and streaming jobs for one conversation, queue order.
    pub fn active_jobs_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Job>, StoreError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE conversation_id = ?1 AND status IN ('pending', 'streaming')
                 ORDER BY priority DESC, queued_at ASC, id ASC"
            ),
            params![conversation_id],
        )
    }

    /// All pending and streaming jobs, queue order.
    pub fn active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE status IN ('pending', 'streaming')
                 ORDER BY priority DESC, queued_at ASC, id ASC"
            ),
            params![],
        )
    }

    /// Pending jobs in base queue order. Input to the batching policy.
    pub fn pending_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending'
                 ORDER BY priority DESC, queued_at ASC, id ASC"
            ),
            params![],
        )
    }

    /// The currently streaming job, if any.
    pub fn streaming_job(&self) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'streaming' LIMIT 1"),
                [],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    /// Queue overview for status surfaces.
    pub fn queue_snapshot(&self) -> Result<QueueSnapshot, StoreError> {
        let processing = self.streaming_job()?.map(|job| ProcessingSnapshot {
            job_id: job.id,
            conversation_id: job.conversation_id,
            model: job.requested_model,
            started_at: job.started_at.unwrap_or(job.last_update_at),
        });
        let pending = self
            .pending_jobs()?
            .into_iter()
            .map(|job| PendingSnapshot {
                job_id: job.id,
                conversation_id: job.conversation_id,
                model: job.requested_model,
                priority: job.priority,
                queue_position: job.queue_position,
                queued_at: job.queued_at,
            })
            .collect();
        Ok(QueueSnapshot {
            processing,
            pending,
        })
    }

    /// Bump a pending job to priority 1 and return its new position.
    pub fn prioritize(&self, job_id: JobId) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE jobs SET priority = 1 WHERE id = ?1 AND status = 'pending'",
            params![job_id.value()],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        recompute_positions(&tx)?;
        let position: i64 = tx.query_row(
            "SELECT queue_position FROM jobs WHERE id = ?1",
            params![job_id.value()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(Some(position))
    }

    /// Find jobs the reaper must fail: pending past the queue timeout, and
    /// streaming jobs whose last delta is older than the idle grace.
    pub fn stale_jobs(
        &self,
        queue_timeout: Duration,
        stream_idle: Duration,
    ) -> Result<StaleJobs, StoreError> {
        let now = now_ms();
        let queue_cutoff = now - queue_timeout.as_millis() as i64;
        let idle_cutoff = now - stream_idle.as_millis() as i64;

        let conn = self.conn();
        let mut stale = StaleJobs::default();

        let mut stmt =
            conn.prepare("SELECT id FROM jobs WHERE status = 'pending' AND queued_at < ?1")?;
        let rows = stmt.query_map(params![queue_cutoff], |row| row.get::<_, i64>(0))?;
        for id in rows {
            stale.timed_out_pending.push(JobId::new(id?));
        }

        let mut stmt = conn
            .prepare("SELECT id FROM jobs WHERE status = 'streaming' AND last_update_at < ?1")?;
        let rows = stmt.query_map(params![idle_cutoff], |row| row.get::<_, i64>(0))?;
        for id in rows {
            stale.stalled_streaming.push(JobId::new(id?));
        }

        Ok(stale)
    }

    /// Delete terminal jobs older than the retention window. Returns how many
    /// rows were removed.
    pub fn purge_terminal(&self, retention: Duration) -> Result<usize, StoreError> {
        let cutoff = now_ms() - retention.as_millis() as i64;
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'error', 'cancelled') AND completed_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Fail any job left in `streaming` by a previous process (crash or
    /// restart mid-stream). Called once at boot, before loops start.
    pub fn reset_orphaned_streaming(&self, message: &str) -> Result<Vec<JobId>, StoreError> {
        let orphans: Vec<JobId> = {
            let conn = self.conn();
            let mut stmt = conn.prepare("SELECT id FROM jobs WHERE status = 'streaming'")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            rows.collect::<Result<Vec<i64>, _>>()?
                .into_iter()
                .map(JobId::new)
                .collect()
        };
        for &id in &orphans {
            self.fail(id, message)?;
        }
        Ok(orphans)
    }

    fn query_jobs(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, RawJob::from_row)?;
        let mut jobs = Vec::new();
        for raw in rows {
            jobs.push(raw?.into_job()?);
        }
        Ok(jobs)
    }
}

/// Reassign dense positions `1..N` to pending jobs in base queue order.
fn recompute_positions(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    let ids: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM jobs WHERE status = 'pending'
             ORDER BY priority DESC, queued_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<i64>, _>>()?
    };
    for (index, id) in ids.iter().enumerate() {
        tx.execute(
            "UPDATE jobs SET queue_position = ?1 WHERE id = ?2",
            params![(index + 1) as i64, id],
        )?;
    }
    Ok(())
}

fn query_job(tx: &Transaction<'_>, job_id: JobId) -> Result<Option<Job>, StoreError> {
    let raw = tx
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![job_id.value()],
            RawJob::from_row,
        )
        .optional()?;
    raw.map(RawJob::into_job).transpose()
}
