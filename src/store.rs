use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};

use crate::errors::StoreError;
use crate::models::{
    Deployment, DeploymentQueueItem, DeploymentStatus, Enhancement, EnhancementStatus,
};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
}

impl DbHandle {
    pub fn new(db: PipelineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PipelineDb>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::LockPoisoned.into())
    }
}

/// Durable queue of enhancements plus the deployment schedule.
pub struct PipelineDb {
    conn: Connection,
}

/// Fields accepted when inserting a new enhancement. Everything else starts
/// null with status `pending`.
#[derive(Debug, Clone)]
pub struct NewEnhancement {
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub requested_by: String,
}

// Raw row as stored; converted to the typed struct after the enum parses.
struct EnhancementRow {
    id: i64,
    title: String,
    description: String,
    status: String,
    priority: i64,
    requested_by: String,
    assigned_to: Option<String>,
    branch_name: Option<String>,
    pr_number: Option<i64>,
    pr_url: Option<String>,
    plan_json: Option<String>,
    error_message: Option<String>,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl EnhancementRow {
    fn into_enhancement(self) -> Result<Enhancement> {
        let status = EnhancementStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!("Corrupt enhancement row {}: {}", self.id, e))?;
        Ok(Enhancement {
            id: self.id,
            title: self.title,
            description: self.description,
            status,
            priority: self.priority,
            requested_by: self.requested_by,
            assigned_to: self.assigned_to,
            branch_name: self.branch_name,
            pr_number: self.pr_number,
            pr_url: self.pr_url,
            plan_json: self.plan_json,
            error_message: self.error_message,
            notes: self.notes,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

const ENHANCEMENT_COLUMNS: &str = "id, title, description, status, priority, requested_by, \
     assigned_to, branch_name, pr_number, pr_url, plan_json, error_message, notes, \
     created_at, updated_at, started_at, completed_at";

fn map_enhancement_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnhancementRow> {
    Ok(EnhancementRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        requested_by: row.get(5)?,
        assigned_to: row.get(6)?,
        branch_name: row.get(7)?,
        pr_number: row.get(8)?,
        pr_url: row.get(9)?,
        plan_json: row.get(10)?,
        error_message: row.get(11)?,
        notes: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        started_at: row.get(15)?,
        completed_at: row.get(16)?,
    })
}

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS enhancements (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    priority INTEGER NOT NULL DEFAULT 0,
                    requested_by TEXT NOT NULL DEFAULT '',
                    assigned_to TEXT,
                    branch_name TEXT,
                    pr_number INTEGER,
                    pr_url TEXT,
                    plan_json TEXT,
                    error_message TEXT,
                    notes TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    enhancement_id INTEGER NOT NULL REFERENCES enhancements(id) ON DELETE CASCADE,
                    scheduled_date TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    deployed_at TEXT,
                    notes TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_enhancements_status
                    ON enhancements(status);
                CREATE INDEX IF NOT EXISTS idx_deployments_status_date
                    ON deployments(status, scheduled_date);

                CREATE VIEW IF NOT EXISTS deployment_queue AS
                    SELECT d.id, d.enhancement_id, d.scheduled_date, d.status,
                           d.deployed_at, d.notes,
                           e.branch_name, e.pr_number, e.description, e.requested_by
                    FROM deployments d
                    JOIN enhancements e ON e.id = d.enhancement_id;
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // Enhancement CRUD

    pub fn create_enhancement(&self, new: &NewEnhancement) -> Result<Enhancement> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO enhancements (title, description, priority, requested_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![new.title, new.description, new.priority, new.requested_by, now],
            )
            .context("Failed to insert enhancement")?;
        let id = self.conn.last_insert_rowid();
        self.get_enhancement(id)?
            .context("Enhancement not found after insert")
    }

    pub fn get_enhancement(&self, id: i64) -> Result<Option<Enhancement>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM enhancements WHERE id = ?1",
                ENHANCEMENT_COLUMNS
            ))
            .context("Failed to prepare get_enhancement")?;
        let mut rows = stmt
            .query_map(params![id], map_enhancement_row)
            .context("Failed to query enhancement")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read enhancement row")?;
                Ok(Some(r.into_enhancement()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_enhancements(&self) -> Result<Vec<Enhancement>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM enhancements ORDER BY id",
                ENHANCEMENT_COLUMNS
            ))
            .context("Failed to prepare list_enhancements")?;
        let rows = stmt
            .query_map([], map_enhancement_row)
            .context("Failed to query enhancements")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read enhancement row")?.into_enhancement()?);
        }
        Ok(out)
    }

    /// The next candidate for claiming: highest priority first, then oldest.
    pub fn next_pending(&self) -> Result<Option<Enhancement>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM enhancements WHERE status = 'pending'
                 ORDER BY priority DESC, id ASC LIMIT 1",
                ENHANCEMENT_COLUMNS
            ))
            .context("Failed to prepare next_pending")?;
        let mut rows = stmt
            .query_map([], map_enhancement_row)
            .context("Failed to query pending enhancements")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read enhancement row")?;
                Ok(Some(r.into_enhancement()?))
            }
            None => Ok(None),
        }
    }

    /// Atomically claim a pending enhancement for this worker.
    ///
    /// A single conditional update: `pending -> processing`, stamping
    /// `started_at` and `updated_at`. Returns true only when this caller won
    /// the race; zero affected rows means another worker got there first.
    pub fn claim(&self, id: i64) -> Result<bool> {
        let now = now_rfc3339();
        let affected = self
            .conn
            .execute(
                "UPDATE enhancements SET status = 'processing', started_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id],
            )
            .context("Failed to claim enhancement")?;
        Ok(affected == 1)
    }

    /// Number of enhancements currently being worked on (claimed, not yet
    /// terminal). Backs the max-concurrent-jobs check.
    pub fn active_count(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM enhancements
                 WHERE status NOT IN ('pending', 'completed', 'failed')",
                [],
                |row| row.get(0),
            )
            .context("Failed to count active enhancements")
    }

    pub fn set_status(&self, id: i64, status: EnhancementStatus) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE enhancements SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_rfc3339(), id],
            )
            .context("Failed to update enhancement status")?;
        if affected != 1 {
            return Err(StoreError::EnhancementNotFound { id }.into());
        }
        Ok(())
    }

    pub fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE enhancements SET status = 'failed', error_message = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![error, now_rfc3339(), id],
            )
            .context("Failed to mark enhancement failed")?;
        if affected != 1 {
            return Err(StoreError::EnhancementNotFound { id }.into());
        }
        Ok(())
    }

    pub fn mark_completed(&self, id: i64, note: Option<&str>) -> Result<()> {
        let now = now_rfc3339();
        let affected = self
            .conn
            .execute(
                "UPDATE enhancements SET status = 'completed', completed_at = ?1, updated_at = ?1,
                 notes = COALESCE(?2, notes) WHERE id = ?3",
                params![now, note, id],
            )
            .context("Failed to mark enhancement completed")?;
        if affected != 1 {
            return Err(StoreError::EnhancementNotFound { id }.into());
        }
        Ok(())
    }

    pub fn set_branch(&self, id: i64, branch: &str) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE enhancements SET branch_name = ?1, updated_at = ?2 WHERE id = ?3",
                params![branch, now_rfc3339(), id],
            )
            .context("Failed to set branch name")?;
        if affected != 1 {
            return Err(StoreError::EnhancementNotFound { id }.into());
        }
        Ok(())
    }

    pub fn set_pull_request(&self, id: i64, number: i64, url: &str) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE enhancements SET pr_number = ?1, pr_url = ?2, updated_at = ?3 WHERE id = ?4",
                params![number, url, now_rfc3339(), id],
            )
            .context("Failed to set pull request")?;
        if affected != 1 {
            return Err(StoreError::EnhancementNotFound { id }.into());
        }
        Ok(())
    }

    pub fn set_plan(&self, id: i64, plan_json: &str) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE enhancements SET plan_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![plan_json, now_rfc3339(), id],
            )
            .context("Failed to store plan")?;
        if affected != 1 {
            return Err(StoreError::EnhancementNotFound { id }.into());
        }
        Ok(())
    }

    // Deployments

    pub fn create_deployment(&self, enhancement_id: i64, scheduled_date: &str) -> Result<Deployment> {
        self.conn
            .execute(
                "INSERT INTO deployments (enhancement_id, scheduled_date) VALUES (?1, ?2)",
                params![enhancement_id, scheduled_date],
            )
            .context("Failed to insert deployment")?;
        let id = self.conn.last_insert_rowid();
        self.get_deployment(id)?
            .context("Deployment not found after insert")
    }

    pub fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, enhancement_id, scheduled_date, status, deployed_at, notes
                 FROM deployments WHERE id = ?1",
            )
            .context("Failed to prepare get_deployment")?;
        let mut rows = stmt
            .query_map(params![id], map_deployment_row)
            .context("Failed to query deployment")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read deployment row")?)),
            None => Ok(None),
        }
    }

    /// Pending deployments whose scheduled date has arrived, oldest first.
    pub fn due_deployments(&self, now: &str) -> Result<Vec<Deployment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, enhancement_id, scheduled_date, status, deployed_at, notes
                 FROM deployments
                 WHERE status = 'pending' AND scheduled_date <= ?1
                 ORDER BY scheduled_date ASC",
            )
            .context("Failed to prepare due_deployments")?;
        let rows = stmt
            .query_map(params![now], map_deployment_row)
            .context("Failed to query due deployments")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read deployment row")?);
        }
        Ok(out)
    }

    /// Conditional `pending -> in_progress` transition. A deployment that has
    /// left `pending` is never re-entered, so losing this race means skipping
    /// the row entirely.
    pub fn claim_deployment(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE deployments SET status = 'in_progress'
                 WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .context("Failed to claim deployment")?;
        Ok(affected == 1)
    }

    pub fn finish_deployment(
        &self,
        id: i64,
        status: DeploymentStatus,
        deployed_at: Option<&str>,
        notes: &str,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE deployments SET status = ?1, deployed_at = ?2, notes = ?3 WHERE id = ?4",
                params![status.as_str(), deployed_at, notes, id],
            )
            .context("Failed to finish deployment")?;
        if affected != 1 {
            return Err(StoreError::DeploymentNotFound { id }.into());
        }
        Ok(())
    }

    /// The `deployment_queue` join view: deployments with their parent
    /// enhancement's branch, PR, description, and requestor.
    pub fn deployment_queue(&self) -> Result<Vec<DeploymentQueueItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, enhancement_id, scheduled_date, status, deployed_at, notes,
                        branch_name, pr_number, description, requested_by
                 FROM deployment_queue ORDER BY scheduled_date ASC",
            )
            .context("Failed to prepare deployment_queue")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })
            .context("Failed to query deployment queue")?;
        let mut out = Vec::new();
        for row in rows {
            let (id, enhancement_id, scheduled_date, status, deployed_at, notes, branch_name, pr_number, description, requested_by) =
                row.context("Failed to read deployment queue row")?;
            let status = DeploymentStatus::from_str(&status)
                .map_err(|e| anyhow::anyhow!("Corrupt deployment row {}: {}", id, e))?;
            out.push(DeploymentQueueItem {
                id,
                enhancement_id,
                scheduled_date,
                status,
                deployed_at,
                notes,
                branch_name,
                pr_number,
                description,
                requested_by,
            });
        }
        Ok(out)
    }
}

fn map_deployment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Deployment> {
    let status_text: String = row.get(3)?;
    let status = DeploymentStatus::from_str(&status_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    Ok(Deployment {
        id: row.get(0)?,
        enhancement_id: row.get(1)?,
        scheduled_date: row.get(2)?,
        status,
        deployed_at: row.get(4)?,
        notes: row.get(5)?,
    })
}
