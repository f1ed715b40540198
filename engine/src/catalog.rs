//! Catalog and installer operations.
//!
//! Split out of `engine.rs` the way the rest of the producer API is: these
//! are `Engine` methods, but everything here is about models rather than
//! jobs: listing the curated catalog, streaming downloads with a mapped
//! progress percentage, deletion, and the default-model chain.

use std::time::Duration;

use relay_runtime::PullProgress;
use relay_store::StoreError;
use relay_types::{InstallStatus, InstalledModel, ModelSummary};

use crate::engine::{Engine, EngineError};

/// Map one upstream pull status line onto the 0–100 progress scale.
///
/// `pulling manifest` pins 1%, byte progress spans 2–95%, `verifying` and
/// `writing` take 96/98, and the success line lands on 100.
fn map_pull_progress(progress: &PullProgress) -> Option<u8> {
    if progress.is_success() {
        return Some(100);
    }
    let status = progress.status.as_str();
    if status.contains("verifying") {
        return Some(96);
    }
    if status.contains("writing") {
        return Some(98);
    }
    if status.contains("manifest") {
        return Some(1);
    }
    match (progress.completed, progress.total) {
        (Some(completed), Some(total)) if total > 0 => {
            let span = (completed as f64 / total as f64) * 93.0;
            Some((2.0 + span).clamp(2.0, 95.0) as u8)
        }
        _ => None,
    }
}

impl Engine {
    /// Curated catalog merged with install state, `(tier, ram)` order.
    pub fn catalog(&self) -> Result<Vec<ModelSummary>, EngineError> {
        Ok(self.inner.store.model_summaries()?)
    }

    pub fn installed(&self) -> Result<Vec<InstalledModel>, EngineError> {
        Ok(self.inner.store.installed_models()?)
    }

    /// Pull a model from the runtime's registry, streaming progress.
    ///
    /// Progress lands in the store (throttled to changes) and in the
    /// caller's callback. The first model ever downloaded becomes the
    /// default.
    pub async fn download(
        &self,
        model_id: &str,
        mut on_progress: impl FnMut(u8) + Send,
    ) -> Result<(), EngineError> {
        let Some(entry) = self.inner.store.catalog_entry(model_id)? else {
            return Err(EngineError::UnknownModel(model_id.to_string()));
        };

        self.inner.store.begin_download(model_id)?;
        tracing::info!(model = model_id, external = %entry.external_name, "Download starting");

        let store = &self.inner.store;
        let mut last_percent = 0u8;
        let pull = self.inner.client.pull(&entry.external_name, |progress| {
            if let Some(percent) = map_pull_progress(&progress)
                && percent != last_percent
            {
                last_percent = percent;
                if let Err(e) = store.set_download_progress(model_id, percent) {
                    tracing::warn!(model = model_id, "Failed to persist progress: {e}");
                }
                on_progress(percent);
            }
        });

        let timeout = Duration::from_secs(self.inner.config.download_timeout_secs);
        match tokio::time::timeout(timeout, pull).await {
            Ok(Ok(())) => {
                let became_default = self.inner.store.finish_download(model_id)?;
                if became_default {
                    tracing::info!(model = model_id, "First installed model set as default");
                }
                tracing::info!(model = model_id, "Download complete");
                on_progress(100);
                Ok(())
            }
            Ok(Err(e)) => {
                self.inner
                    .store
                    .mark_install_error(model_id, &e.to_string())?;
                Err(EngineError::Runtime(e))
            }
            Err(_) => {
                self.inner
                    .store
                    .mark_install_error(model_id, "Download timed out")?;
                Err(EngineError::DownloadTimeout(model_id.to_string()))
            }
        }
    }

    /// Remove a model: unload if resident, best-effort delete upstream
    /// (404 tolerated), then drop the install row.
    pub async fn delete_model(&self, model_id: &str) -> Result<(), EngineError> {
        let external = self.inner.store.external_name(model_id)?;

        let resident = self.inner.residency.loaded_model().await.ok().flatten();
        if resident.is_some_and(|m| m.external_name == external) {
            self.inner.residency.unload_external(&external).await;
        }

        self.inner.client.delete_model(&external).await?;
        self.inner.store.delete_installed(model_id)?;
        tracing::info!(model = model_id, "Model deleted");
        Ok(())
    }

    pub fn set_default_model(&self, model_id: &str) -> Result<(), EngineError> {
        self.inner.store.set_default(model_id)?;
        tracing::info!(model = model_id, "Default model set");
        Ok(())
    }

    /// The default-model chain: explicit DB default → resident model when
    /// it maps to an available install → most recently downloaded →
    /// configured fallback → none.
    pub fn default_model(&self) -> Result<Option<String>, StoreError> {
        if let Some(id) = self.inner.store.default_model_id()? {
            return Ok(Some(id));
        }

        if let Some(external) = self.inner.residency.resident_external()
            && let Some(id) = self.inner.store.catalog_id_for_external(&external)?
            && self
                .inner
                .store
                .installed(&id)?
                .is_some_and(|m| m.status == InstallStatus::Available)
        {
            return Ok(Some(id));
        }

        if let Some(id) = self.inner.store.most_recent_available()? {
            return Ok(Some(id));
        }

        Ok(self.inner.config.default_model.clone())
    }

    /// Echo an explicit request, otherwise consult the default chain.
    /// Validation of the name happens at activation time.
    pub fn resolve_model(&self, requested: Option<&str>) -> Result<Option<String>, StoreError> {
        match requested {
            Some(model) => Ok(Some(model.to_string())),
            None => self.default_model(),
        }
    }
}
