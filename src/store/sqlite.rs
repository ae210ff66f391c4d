use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use tracing::info;

use super::Store;
use crate::error::StoreError;
use crate::model::{
    BudgetThreshold, DeadLetter, EventRecord, Job, JobId, JobState, Notification,
    NotificationKind, RunRecord, RunStatus, SpendPeriod, Usage,
};

const JOB_COLUMNS: &str = "id, queue, job_type, payload, attempts_made, max_attempts, backoff, \
                           state, depth, run_at, last_error, created_at, updated_at";

/// SQLite-backed store shared by every process pointed at the same file
pub struct SqliteStore {
    pool: SqlitePool,
}

fn ts(at: DateTime<Utc>) -> String {
    // Fixed width so lexical order matches time order
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{value}': {e}")))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let state: String = row.try_get("state")?;
    let payload: String = row.try_get("payload")?;
    let backoff: String = row.try_get("backoff")?;
    let run_at: String = row.try_get("run_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let attempts_made: i64 = row.try_get("attempts_made")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let depth: i64 = row.try_get("depth")?;

    Ok(Job {
        id: JobId(row.try_get("id")?),
        queue: row.try_get("queue")?,
        job_type: row.try_get("job_type")?,
        payload: serde_json::from_str(&payload)?,
        attempts_made: attempts_made as u32,
        max_attempts: max_attempts as u32,
        backoff: serde_json::from_str(&backoff)?,
        state: JobState::parse(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("job state '{state}'")))?,
        depth: depth as u32,
        run_at: parse_ts(&run_at)?,
        last_error: row.try_get("last_error")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn period_from_row(row: &SqliteRow) -> Result<SpendPeriod, StoreError> {
    let alert_80: i64 = row.try_get("alert_80_sent")?;
    let alert_100: i64 = row.try_get("alert_100_sent")?;
    Ok(SpendPeriod {
        period: row.try_get("period")?,
        budget_limit: row.try_get("budget_limit")?,
        spent_amount: row.try_get("spent_amount")?,
        alert_80_sent: alert_80 != 0,
        alert_100_sent: alert_100 != 0,
    })
}

fn kind_str(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::DeadLetter => "dead_letter",
        NotificationKind::FailureAlert => "failure_alert",
        NotificationKind::BudgetAlert => "budget_alert",
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database and optionally run migrations
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        auto_migrate: bool,
    ) -> Result<Self, StoreError> {
        if !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        if auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }

    async fn ensure_period(&self, period: &str, default_limit: f64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO spend_periods (period, budget_limit) VALUES (?1, ?2) \
             ON CONFLICT(period) DO NOTHING",
        )
        .bind(period)
        .bind(default_limit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_period(&self, period: &str) -> Result<SpendPeriod, StoreError> {
        let row = sqlx::query(
            "SELECT period, budget_limit, spent_amount, alert_80_sent, alert_100_sent \
             FROM spend_periods WHERE period = ?1",
        )
        .bind(period)
        .fetch_one(&self.pool)
        .await?;
        period_from_row(&row)
    }

    async fn transition_error(&self, id: &JobId, to: JobState) -> StoreError {
        match self.get_job(id).await {
            Ok(Some(job)) => StoreError::InvalidTransition {
                job_id: id.to_string(),
                from: job.state.to_string(),
                to: to.to_string(),
            },
            Ok(None) => StoreError::JobNotFound(id.to_string()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn enqueue(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, job_type, payload, attempts_made, max_attempts, backoff,
                              state, depth, run_at, last_error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&job.id.0)
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(serde_json::to_string(&job.payload)?)
        .bind(job.attempts_made as i64)
        .bind(job.max_attempts as i64)
        .bind(serde_json::to_string(&job.backoff)?)
        .bind(job.state.as_str())
        .bind(job.depth as i64)
        .bind(ts(job.run_at))
        .bind(&job.last_error)
        .bind(ts(job.created_at))
        .bind(ts(job.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        // Single statement, so two workers can never claim the same row
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'active', attempts_made = attempts_made + 1, updated_at = ?2
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE queue = ?1 AND state = 'waiting' AND run_at <= ?2
                  AND attempts_made < max_attempts
                ORDER BY seq
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(ts(now))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE jobs SET state = 'completed', updated_at = ?2 \
             WHERE id = ?1 AND state = 'active' RETURNING {JOB_COLUMNS}"
        ))
        .bind(&id.0)
        .bind(ts(now))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.transition_error(id, JobState::Completed).await),
        }
    }

    async fn fail_job(
        &self,
        id: &JobId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let (state, run_at) = match retry_at {
            Some(at) => (JobState::Waiting, Some(ts(at))),
            None => (JobState::Failed, None),
        };
        let row = sqlx::query(&format!(
            "UPDATE jobs SET state = ?2, last_error = ?3, updated_at = ?4, \
             run_at = COALESCE(?5, run_at) \
             WHERE id = ?1 AND state = 'active' RETURNING {JOB_COLUMNS}"
        ))
        .bind(&id.0)
        .bind(state.as_str())
        .bind(error)
        .bind(ts(now))
        .bind(run_at)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.transition_error(id, JobState::Failed).await),
        }
    }

    async fn has_runnable(&self, queue: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let found: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM jobs
                WHERE queue = ?1 AND state = 'waiting' AND run_at <= ?2
                  AND attempts_made < max_attempts
            )
            "#,
        )
        .bind(queue)
        .bind(ts(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(found != 0)
    }

    async fn missing_dead_letters(&self, queue: &str) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE queue = ?1 AND state = 'failed' AND attempts_made >= max_attempts
              AND NOT EXISTS (SELECT 1 FROM dead_letters WHERE dead_letters.job_id = jobs.id)
            ORDER BY seq
            "#
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn active_jobs(&self, queue: &str) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ?1 AND state = 'active' ORDER BY seq"
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn prune_terminal(
        &self,
        queue: &str,
        keep_completed: usize,
        keep_failed: usize,
    ) -> Result<u64, StoreError> {
        let mut removed = 0;
        for (state, keep) in [("completed", keep_completed), ("failed", keep_failed)] {
            let result = sqlx::query(
                r#"
                DELETE FROM jobs
                WHERE queue = ?1 AND state = ?2 AND seq NOT IN (
                    SELECT seq FROM jobs WHERE queue = ?1 AND state = ?2
                    ORDER BY updated_at DESC LIMIT ?3
                )
                "#,
            )
            .bind(queue)
            .bind(state)
            .bind(keep as i64)
            .execute(&self.pool)
            .await?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    async fn spend_period(&self, period: &str, default_limit: f64) -> Result<SpendPeriod, StoreError> {
        self.ensure_period(period, default_limit).await?;
        self.fetch_period(period).await
    }

    async fn increment_spend(
        &self,
        period: &str,
        amount: f64,
        default_limit: f64,
    ) -> Result<SpendPeriod, StoreError> {
        self.ensure_period(period, default_limit).await?;
        let row = sqlx::query(
            "UPDATE spend_periods SET spent_amount = spent_amount + ?2 WHERE period = ?1 \
             RETURNING period, budget_limit, spent_amount, alert_80_sent, alert_100_sent",
        )
        .bind(period)
        .bind(amount.max(0.0))
        .fetch_one(&self.pool)
        .await?;
        period_from_row(&row)
    }

    async fn mark_alert_sent(&self, period: &str, threshold: BudgetThreshold) -> Result<bool, StoreError> {
        let sql = match threshold {
            BudgetThreshold::EightyPercent => {
                "UPDATE spend_periods SET alert_80_sent = 1 WHERE period = ?1 AND alert_80_sent = 0"
            }
            BudgetThreshold::HundredPercent => {
                "UPDATE spend_periods SET alert_100_sent = 1 WHERE period = ?1 AND alert_100_sent = 0"
            }
        };
        let result = sqlx::query(sql).bind(period).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        let status = match record.status {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        sqlx::query(
            r#"
            INSERT INTO agent_runs (job_id, agent, job_type, status, attempt, input_units,
                                    output_units, cost_usd, duration_ms, error, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&record.job_id.0)
        .bind(&record.agent)
        .bind(&record.job_type)
        .bind(status)
        .bind(record.attempt as i64)
        .bind(record.usage.input_units as i64)
        .bind(record.usage.output_units as i64)
        .bind(record.usage.cost_usd)
        .bind(record.duration_ms as i64)
        .bind(&record.error)
        .bind(ts(record.finished_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notifications (kind, agent, title, body, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(kind_str(notification.kind))
        .bind(&notification.agent)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(ts(notification.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO dead_letters (job_id, agent, job_type, payload, attempts_made, error, failed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(job_id) DO NOTHING
            "#,
        )
        .bind(&dead_letter.job_id.0)
        .bind(&dead_letter.agent)
        .bind(&dead_letter.job_type)
        .bind(serde_json::to_string(&dead_letter.payload)?)
        .bind(dead_letter.attempts_made as i64)
        .bind(&dead_letter.error)
        .bind(ts(dead_letter.failed_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO domain_events (name, payload, depth, emitted_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&event.name)
        .bind(serde_json::to_string(&event.payload)?)
        .bind(event.depth as i64)
        .bind(ts(event.emitted_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            "SELECT job_id, agent, job_type, payload, attempts_made, error, failed_at \
             FROM dead_letters ORDER BY failed_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                let failed_at: String = row.try_get("failed_at")?;
                let attempts_made: i64 = row.try_get("attempts_made")?;
                Ok(DeadLetter {
                    job_id: JobId(row.try_get("job_id")?),
                    agent: row.try_get("agent")?,
                    job_type: row.try_get("job_type")?,
                    payload: serde_json::from_str(&payload)?,
                    attempts_made: attempts_made as u32,
                    error: row.try_get("error")?,
                    failed_at: parse_ts(&failed_at)?,
                })
            })
            .collect()
    }

    async fn notifications(&self) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(
            "SELECT kind, agent, title, body, created_at FROM notifications ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind")?;
                let created_at: String = row.try_get("created_at")?;
                let kind = match kind.as_str() {
                    "dead_letter" => NotificationKind::DeadLetter,
                    "failure_alert" => NotificationKind::FailureAlert,
                    "budget_alert" => NotificationKind::BudgetAlert,
                    other => return Err(StoreError::Corrupt(format!("notification kind '{other}'"))),
                };
                Ok(Notification {
                    kind,
                    agent: row.try_get("agent")?,
                    title: row.try_get("title")?,
                    body: row.try_get("body")?,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect()
    }

    async fn runs_for(&self, job_id: &JobId) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT job_id, agent, job_type, status, attempt, input_units, output_units, cost_usd, \
             duration_ms, error, finished_at FROM agent_runs WHERE job_id = ?1 ORDER BY id",
        )
        .bind(&job_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let finished_at: String = row.try_get("finished_at")?;
                let attempt: i64 = row.try_get("attempt")?;
                let input_units: i64 = row.try_get("input_units")?;
                let output_units: i64 = row.try_get("output_units")?;
                let duration_ms: i64 = row.try_get("duration_ms")?;
                Ok(RunRecord {
                    job_id: JobId(row.try_get("job_id")?),
                    agent: row.try_get("agent")?,
                    job_type: row.try_get("job_type")?,
                    status: if status == "completed" {
                        RunStatus::Completed
                    } else {
                        RunStatus::Failed
                    },
                    attempt: attempt as u32,
                    usage: Usage {
                        input_units: input_units as u64,
                        output_units: output_units as u64,
                        cost_usd: row.try_get("cost_usd")?,
                    },
                    duration_ms: duration_ms as u64,
                    error: row.try_get("error")?,
                    finished_at: parse_ts(&finished_at)?,
                })
            })
            .collect()
    }
}
