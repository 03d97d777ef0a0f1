/// SQLite-backed resource ledger
///
/// Persists every registered resource so a deployment that crashed halfway
/// can still be unwound by a later process. Rows are never deleted; teardown
/// stamps `reclaimed_at` instead, which keeps the full history of a stack.
use super::{ResourceRecord, TeardownAction};
use crate::ResourceType;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerStats {
    pub active: usize,
    pub reclaimed: usize,
}

pub struct ResourceLedger {
    conn: Connection,
    db_path: PathBuf,
}

impl ResourceLedger {
    /// Create or open the ledger database
    ///
    /// Uses WAL mode so a reader (e.g. `stackctl health`) never blocks the
    /// process that is provisioning.
    pub fn open(db_path: &Path) -> Result<Self> {
        if db_path.to_str() != Some(":memory:") {
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .context("Failed to create ledger database directory")?;
                }
            }
        }

        let conn = Connection::open(db_path).context("Failed to open ledger database")?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("Failed to set synchronous mode")?;

        let ledger = Self {
            conn,
            db_path: db_path.to_path_buf(),
        };
        ledger.initialize_schema()?;

        Ok(ledger)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS resources (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id TEXT NOT NULL UNIQUE,
                resource_type TEXT NOT NULL,
                stack_id TEXT NOT NULL,
                teardown_action TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL,
                reclaimed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_stack ON resources(stack_id);
            CREATE INDEX IF NOT EXISTS idx_active ON resources(stack_id, reclaimed_at);
            "#,
            )
            .context("Failed to create ledger schema")?;

        Ok(())
    }

    /// Record a resource
    ///
    /// A resource that was reclaimed earlier and shows up again (providers do
    /// recycle ids) is re-activated under its new owner.
    pub fn insert(&mut self, record: &ResourceRecord) -> Result<()> {
        let action_json = serde_json::to_string(&record.teardown_action)
            .context("Failed to serialize teardown action")?;
        let metadata_json =
            serde_json::to_string(&record.metadata).context("Failed to serialize metadata")?;

        let tx = self
            .conn
            .transaction()
            .context("Failed to begin transaction")?;

        tx.execute(
            r#"
            INSERT INTO resources (
                resource_id, resource_type, stack_id, teardown_action,
                metadata, created_at, reclaimed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
            ON CONFLICT(resource_id)
            DO UPDATE SET
                resource_type = excluded.resource_type,
                stack_id = excluded.stack_id,
                teardown_action = excluded.teardown_action,
                metadata = excluded.metadata,
                created_at = excluded.created_at,
                reclaimed_at = NULL
            WHERE resources.reclaimed_at IS NOT NULL
            "#,
            params![
                record.resource_id,
                record.resource_type.as_str(),
                record.stack_id,
                action_json,
                metadata_json,
                record.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert resource")?;

        tx.commit()
            .context("Failed to commit resource transaction")?;

        Ok(())
    }

    pub fn mark_reclaimed(&mut self, resource_id: &str) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE resources SET reclaimed_at = ?1 WHERE resource_id = ?2 AND reclaimed_at IS NULL",
                params![Utc::now().to_rfc3339(), resource_id],
            )
            .context("Failed to mark resource reclaimed")?;

        if updated == 0 {
            tracing::debug!(resource_id, "Resource was not active in ledger");
        }

        Ok(())
    }

    /// Every unreclaimed resource, in registration order
    pub fn load_active(&self) -> Result<Vec<ResourceRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
            SELECT resource_id, resource_type, stack_id, teardown_action, metadata, created_at
            FROM resources
            WHERE reclaimed_at IS NULL
            ORDER BY seq ASC
            "#,
            )
            .context("Failed to prepare ledger query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query ledger")?;

        let mut records = Vec::new();
        for row in rows {
            let (resource_id, resource_type, stack_id, action, metadata, created_at) =
                row.context("Failed to read ledger row")?;

            let resource_type: ResourceType = resource_type
                .parse()
                .map_err(|e: String| anyhow!("Corrupt ledger row {}: {}", resource_id, e))?;
            let teardown_action: TeardownAction = serde_json::from_str(&action)
                .with_context(|| format!("Corrupt teardown action for {}", resource_id))?;
            let metadata: BTreeMap<String, String> = metadata
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default();
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            records.push(ResourceRecord {
                resource_id,
                resource_type,
                stack_id,
                teardown_action,
                metadata,
                created_at,
            });
        }

        Ok(records)
    }

    pub fn reclaimed_at(&self, resource_id: &str) -> Result<Option<DateTime<Utc>>> {
        let value: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT reclaimed_at FROM resources WHERE resource_id = ?1",
                params![resource_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query reclaimed_at")?;

        Ok(value.flatten().and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        let (active, reclaimed): (i64, i64) = self
            .conn
            .query_row(
                r#"
            SELECT
                COALESCE(SUM(CASE WHEN reclaimed_at IS NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN reclaimed_at IS NOT NULL THEN 1 ELSE 0 END), 0)
            FROM resources
            "#,
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to query ledger stats")?;

        Ok(LedgerStats {
            active: active as usize,
            reclaimed: reclaimed as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, resource_type: ResourceType) -> ResourceRecord {
        ResourceRecord::new(id, resource_type, "ai-stack", TeardownAction::Release)
            .with_metadata("region", "us-east-1")
    }

    #[test]
    fn test_insert_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.db");

        {
            let mut ledger = ResourceLedger::open(&path).unwrap();
            ledger.insert(&record("vpc-1", ResourceType::Network)).unwrap();
            ledger.insert(&record("i-1", ResourceType::Compute)).unwrap();
            ledger
                .insert(&ResourceRecord::new(
                    "hook-1",
                    ResourceType::Stack,
                    "ai-stack",
                    TeardownAction::Command {
                        program: "true".into(),
                        args: vec![],
                    },
                ))
                .unwrap();
        }

        let ledger = ResourceLedger::open(&path).unwrap();
        let records = ledger.load_active().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].resource_id, "vpc-1");
        assert_eq!(records[1].resource_type, ResourceType::Compute);
        assert_eq!(records[1].metadata.get("region").map(String::as_str), Some("us-east-1"));
        assert!(matches!(records[2].teardown_action, TeardownAction::Command { .. }));
    }

    #[test]
    fn test_reclaimed_rows_are_kept_but_inactive() {
        let mut ledger = ResourceLedger::in_memory().unwrap();
        ledger.insert(&record("i-1", ResourceType::Compute)).unwrap();
        ledger.insert(&record("vol-1", ResourceType::Storage)).unwrap();

        ledger.mark_reclaimed("i-1").unwrap();

        let active = ledger.load_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].resource_id, "vol-1");
        assert!(ledger.reclaimed_at("i-1").unwrap().is_some());
        assert!(ledger.reclaimed_at("vol-1").unwrap().is_none());
        assert_eq!(
            ledger.stats().unwrap(),
            LedgerStats {
                active: 1,
                reclaimed: 1
            }
        );
    }

    #[test]
    fn test_reinsert_active_row_is_ignored() {
        let mut ledger = ResourceLedger::in_memory().unwrap();
        ledger.insert(&record("i-1", ResourceType::Compute)).unwrap();
        ledger
            .insert(&ResourceRecord::new(
                "i-1",
                ResourceType::Compute,
                "other-stack",
                TeardownAction::Noop,
            ))
            .unwrap();

        let active = ledger.load_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].stack_id, "ai-stack");
    }
}
