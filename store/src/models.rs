//! Catalog, install-state and switch-audit operations.

use rusqlite::{Connection, OptionalExtension, params};

use relay_types::{CatalogEntry, InstallStatus, InstalledModel, ModelSummary, curated_catalog};

use crate::{Store, StoreError, now_ms};

/// One row of the switch audit trail.
#[derive(Debug, Clone)]
pub struct ModelSwitch {
    pub from_model: Option<String>,
    pub to_model: String,
    pub duration_ms: i64,
    pub triggered_by: String,
    pub reason: String,
    pub switched_at: i64,
}

const INSTALLED_COLUMNS: &str = "id, status, download_progress, is_default, last_used_at, \
     usage_count, downloaded_at, error_message";

fn installed_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(InstalledModel, String)> {
    let status: String = row.get(1)?;
    let progress: i64 = row.get(2)?;
    Ok((
        InstalledModel {
            id: row.get(0)?,
            // Patched below; a placeholder keeps the closure infallible.
            status: InstallStatus::Error,
            download_progress: progress.clamp(0, 100) as u8,
            is_default: row.get::<_, i64>(3)? != 0,
            last_used_at: row.get(4)?,
            usage_count: row.get(5)?,
            downloaded_at: row.get(6)?,
            error_message: row.get(7)?,
        },
        status,
    ))
}

fn hydrate_installed(raw: (InstalledModel, String)) -> Result<InstalledModel, StoreError> {
    let (mut model, status) = raw;
    model.status = InstallStatus::parse(&status)?;
    Ok(model)
}

impl Store {
    /// Seed the `catalog` table from the curated catalog, refreshing metadata
    /// for known rows. Runs at every open.
    pub(crate) fn seed_catalog(db: &Connection) -> Result<(), StoreError> {
        for entry in curated_catalog() {
            db.execute(
                "INSERT INTO catalog (id, external_name, display_name, ram_required_gb, tier, capabilities)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     external_name = excluded.external_name,
                     display_name = excluded.display_name,
                     ram_required_gb = excluded.ram_required_gb,
                     tier = excluded.tier,
                     capabilities = excluded.capabilities",
                params![
                    entry.id,
                    entry.external_name,
                    entry.display_name,
                    entry.ram_required_gb,
                    entry.tier,
                    serde_json::to_string(&entry.capabilities)?,
                ],
            )?;
        }
        Ok(())
    }

    /// Catalog rows ordered by `(tier, ram_required_gb)`.
    pub fn catalog_entries(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, external_name, display_name, ram_required_gb, tier, capabilities
             FROM catalog ORDER BY tier ASC, ram_required_gb ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                CatalogEntry {
                    id: row.get(0)?,
                    external_name: row.get(1)?,
                    display_name: row.get(2)?,
                    ram_required_gb: row.get(3)?,
                    tier: row.get::<_, i64>(4)? as u8,
                    capabilities: Vec::new(),
                },
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (mut entry, capabilities) = row?;
            entry.capabilities = serde_json::from_str(&capabilities)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn catalog_entry(&self, id: &str) -> Result<Option<CatalogEntry>, StoreError> {
        Ok(self
            .catalog_entries()?
            .into_iter()
            .find(|entry| entry.id == id))
    }

    /// Runtime-side name for a catalog id. Ids without a catalog row pass
    /// through unchanged, so jobs naming an uncatalogued model can still be
    /// attempted against the runtime.
    pub fn external_name(&self, id: &str) -> Result<String, StoreError> {
        let conn = self.conn();
        let name: Option<String> = conn
            .query_row(
                "SELECT external_name FROM catalog WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name.unwrap_or_else(|| id.to_string()))
    }

    /// Reverse lookup: catalog id owning a runtime-side name.
    pub fn catalog_id_for_external(&self, external: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT id FROM catalog WHERE external_name = ?1",
                params![external],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Merged catalog + install state, catalog order.
    pub fn model_summaries(&self) -> Result<Vec<ModelSummary>, StoreError> {
        let entries = self.catalog_entries()?;
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            let installed = self.installed(&entry.id)?;
            summaries.push(ModelSummary { entry, installed });
        }
        Ok(summaries)
    }

    pub fn installed(&self, id: &str) -> Result<Option<InstalledModel>, StoreError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("SELECT {INSTALLED_COLUMNS} FROM installed WHERE id = ?1"),
                params![id],
                installed_from_row,
            )
            .optional()?;
        raw.map(hydrate_installed).transpose()
    }

    pub fn installed_models(&self) -> Result<Vec<InstalledModel>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {INSTALLED_COLUMNS} FROM installed ORDER BY id"))?;
        let rows = stmt.query_map([], installed_from_row)?;
        let mut models = Vec::new();
        for raw in rows {
            models.push(hydrate_installed(raw?)?);
        }
        Ok(models)
    }

    /// Record the start of a download. `downloaded_at` holds the start time
    /// until the pull finishes, which is what the stale-download sweep keys
    /// on.
    pub fn begin_download(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO installed (id, status, download_progress, downloaded_at, error_message)
             VALUES (?1, 'downloading', 0, ?2, NULL)
             ON CONFLICT(id) DO UPDATE SET
                 status = 'downloading',
                 download_progress = 0,
                 downloaded_at = excluded.downloaded_at,
                 error_message = NULL",
            params![id, now_ms()],
        )?;
        Ok(())
    }

    pub fn set_download_progress(&self, id: &str, percent: u8) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE installed SET download_progress = ?1 WHERE id = ?2 AND status = 'downloading'",
            params![i64::from(percent.min(100)), id],
        )?;
        Ok(())
    }

    /// Mark a download complete. Returns true when this model became the
    /// default because none existed.
    pub fn finish_download(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE installed SET status = 'available', download_progress = 100,
                 downloaded_at = ?1, error_message = NULL
             WHERE id = ?2",
            params![now_ms(), id],
        )?;
        let defaults: i64 = tx.query_row(
            "SELECT COUNT(*) FROM installed WHERE is_default = 1",
            [],
            |row| row.get(0),
        )?;
        let became_default = defaults == 0;
        if became_default {
            tx.execute(
                "UPDATE installed SET is_default = 1 WHERE id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(became_default)
    }

    pub fn mark_install_error(&self, id: &str, message: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO installed (id, status, download_progress, error_message)
             VALUES (?1, 'error', 0, ?2)
             ON CONFLICT(id) DO UPDATE SET status = 'error', error_message = excluded.error_message",
            params![id, message],
        )?;
        Ok(())
    }

    /// Upsert from catalog sync: the runtime has this model, so it is
    /// available and fully downloaded.
    pub fn mark_available(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO installed (id, status, download_progress, downloaded_at)
             VALUES (?1, 'available', 100, ?2)
             ON CONFLICT(id) DO UPDATE SET
                 status = 'available',
                 download_progress = 100,
                 downloaded_at = COALESCE(installed.downloaded_at, excluded.downloaded_at),
                 error_message = NULL",
            params![id, now_ms()],
        )?;
        Ok(())
    }

    /// `available` rows outside the given id set (runtime no longer has
    /// them) are flipped to error with the given message.
    pub fn mark_missing_unavailable(
        &self,
        present_ids: &[String],
        message: &str,
    ) -> Result<Vec<String>, StoreError> {
        let available: Vec<String> = {
            let conn = self.conn();
            let mut stmt =
                conn.prepare("SELECT id FROM installed WHERE status = 'available'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let mut flipped = Vec::new();
        for id in available {
            if !present_ids.contains(&id) {
                self.mark_install_error(&id, message)?;
                flipped.push(id);
            }
        }
        Ok(flipped)
    }

    /// Rows stuck in `downloading` whose start stamp is missing or older
    /// than `max_age_ms`.
    pub fn stale_downloads(&self, max_age_ms: i64) -> Result<Vec<String>, StoreError> {
        let cutoff = now_ms() - max_age_ms;
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM installed
             WHERE status = 'downloading'
               AND (downloaded_at IS NULL OR downloaded_at < ?1)",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Make one installed model the default; clears any previous default.
    pub fn set_default(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM installed WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(StoreError::NotInstalled(id.to_string()));
        }
        tx.execute("UPDATE installed SET is_default = 0 WHERE is_default = 1", [])?;
        tx.execute(
            "UPDATE installed SET is_default = 1 WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The explicitly marked default, when it is actually usable.
    pub fn default_model_id(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT id FROM installed WHERE is_default = 1 AND status = 'available'",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Most recently downloaded available model, the late fallback in the
    /// default-model chain.
    pub fn most_recent_available(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT id FROM installed WHERE status = 'available'
                 ORDER BY downloaded_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn delete_installed(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute("DELETE FROM installed WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Bump usage counters when a request against this model starts.
    pub fn touch_usage(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE installed SET last_used_at = ?1, usage_count = usage_count + 1
             WHERE id = ?2",
            params![now_ms(), id],
        )?;
        Ok(())
    }

    /// Number of recorded model switches (status surfaces and tests).
    pub fn model_switch_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM model_switches", [], |row| row.get(0))?)
    }

    /// The switch audit trail, oldest first.
    pub fn model_switches(&self) -> Result<Vec<ModelSwitch>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT from_model, to_model, duration_ms, triggered_by, reason, switched_at
             FROM model_switches ORDER BY switched_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ModelSwitch {
                from_model: row.get(0)?,
                to_model: row.get(1)?,
                duration_ms: row.get(2)?,
                triggered_by: row.get(3)?,
                reason: row.get(4)?,
                switched_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Append one row to the switch audit trail.
    ///
    /// `from_model` is the runtime-side name that was resident (if any);
    /// `to_model` is the catalog id being activated.
    pub fn record_model_switch(
        &self,
        from_model: Option<&str>,
        to_model: &str,
        duration_ms: u64,
        triggered_by: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO model_switches (from_model, to_model, duration_ms, triggered_by, reason, switched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                from_model,
                to_model,
                duration_ms as i64,
                triggered_by,
                reason,
                now_ms(),
            ],
        )?;
        Ok(())
    }
}
