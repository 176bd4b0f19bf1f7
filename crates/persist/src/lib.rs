//! Fabrik persistence: SQLite-backed Operation Queue.
//! Survives restarts, so deferred deployments are picked up again by the poller.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use fabrik_core::queue::{OperationQueue, QueuedDeployment};
use fabrik_core::{FabrikError, FabrikResult};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::debug;

/// SQLite-backed queue. Simple, synchronous; every call holds the connection briefly.
pub struct SqliteOperationQueue {
    db: std::sync::Mutex<rusqlite::Connection>,
}

fn cache_err(e: anyhow::Error) -> FabrikError {
    FabrikError::Cache(format!("{:#}", e))
}

impl SqliteOperationQueue {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("FABRIK_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS queued_deployments (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                deployment_name TEXT NOT NULL UNIQUE,
                plan_id         TEXT NOT NULL,
                params          TEXT NOT NULL,
                args            TEXT NOT NULL
            )",
            [],
        )
        .context("creating queued_deployments table")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS director_tasks (
                instance_id TEXT PRIMARY KEY,
                task_id     TEXT NOT NULL
            )",
            [],
        )
        .context("creating director_tasks table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: std::sync::Mutex::new(db) })
    }

    fn with<R>(&self, op: &'static str, f: impl FnOnce(&rusqlite::Connection) -> Result<R>) -> FabrikResult<R> {
        let started = std::time::Instant::now();
        let db = self.db.lock().unwrap_or_else(|p| p.into_inner());
        let out = f(&db).map_err(cache_err);
        histogram!("persist_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        out
    }

    fn names(db: &rusqlite::Connection) -> Result<Vec<String>> {
        let mut stmt = db.prepare("SELECT deployment_name FROM queued_deployments ORDER BY seq")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl OperationQueue for SqliteOperationQueue {
    async fn save_deployment(&self, plan_id: &str, deployment_name: &str, params: &Value, args: &Value) -> FabrikResult<bool> {
        let saved = self.with("save_deployment", |db| {
            let n = db.execute(
                "INSERT OR IGNORE INTO queued_deployments(deployment_name, plan_id, params, args) VALUES (?1, ?2, ?3, ?4)",
                (deployment_name, plan_id, params.to_string(), args.to_string()),
            )?;
            Ok(n == 1)
        })?;
        if saved {
            counter!("persist_put_total", 1u64);
            debug!(deployment = %deployment_name, "deployment queued");
        }
        Ok(saved)
    }

    async fn contains_deployment(&self, deployment_name: &str) -> FabrikResult<bool> {
        self.with("contains_deployment", |db| {
            let n: i64 = db.query_row("SELECT COUNT(*) FROM queued_deployments WHERE deployment_name = ?1", [deployment_name], |r| r.get(0))?;
            Ok(n > 0)
        })
    }

    async fn get_deployment_by_name(&self, deployment_name: &str) -> FabrikResult<Option<QueuedDeployment>> {
        self.with("get_deployment_by_name", |db| {
            let mut stmt = db.prepare("SELECT plan_id, params, args FROM queued_deployments WHERE deployment_name = ?1")?;
            let mut rows = stmt.query([deployment_name])?;
            let Some(row) = rows.next()? else { return Ok(None) };
            let plan_id: String = row.get(0)?;
            let params: String = row.get(1)?;
            let args: String = row.get(2)?;
            Ok(Some(QueuedDeployment {
                plan_id,
                deployment_name: deployment_name.to_string(),
                params: serde_json::from_str(&params).context("decoding queued params")?,
                args: serde_json::from_str(&args).context("decoding queued args")?,
            }))
        })
    }

    async fn delete_deployment_from_cache(&self, deployment_name: &str) -> FabrikResult<()> {
        self.with("delete_deployment", |db| {
            db.execute("DELETE FROM queued_deployments WHERE deployment_name = ?1", [deployment_name])?;
            Ok(())
        })
    }

    async fn save_bosh_task(&self, instance_id: &str, task_id: &str) -> FabrikResult<()> {
        self.with("save_task", |db| {
            db.execute("INSERT OR REPLACE INTO director_tasks(instance_id, task_id) VALUES (?1, ?2)", (instance_id, task_id))?;
            Ok(())
        })
    }

    async fn get_bosh_task(&self, instance_id: &str) -> FabrikResult<Option<String>> {
        self.with("get_task", |db| {
            let mut stmt = db.prepare("SELECT task_id FROM director_tasks WHERE instance_id = ?1")?;
            let mut rows = stmt.query([instance_id])?;
            Ok(match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            })
        })
    }

    async fn contains_service_instance(&self, instance_id: &str) -> FabrikResult<bool> {
        self.with("contains_instance", |db| Ok(Self::names(db)?.iter().filter(|n| n.ends_with(instance_id)).count() == 1))
    }

    async fn delete_bosh_task(&self, instance_id: &str) -> FabrikResult<()> {
        self.with("delete_task", |db| {
            db.execute("DELETE FROM director_tasks WHERE instance_id = ?1", [instance_id])?;
            Ok(())
        })
    }

    async fn get_deployment_names(&self) -> FabrikResult<Vec<String>> {
        self.with("deployment_names", Self::names)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".fabrik");
        let _ = std::fs::create_dir_all(&p);
        p.push("queue.db");
        return p.to_string_lossy().to_string();
    }
    "fabrik-queue.db".to_string()
}
