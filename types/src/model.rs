//! Model catalog and residency domain types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::InvalidValue;

/// One curated catalog row: a model this appliance knows how to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Canonical catalog id.
    pub id: String,
    /// Name the inference runtime knows this model by. Defaults to `id`.
    pub external_name: String,
    pub display_name: String,
    pub ram_required_gb: f64,
    /// Lower tiers fit smaller devices; the catalog listing sorts by
    /// `(tier, ram_required_gb)`.
    pub tier: u8,
    pub capabilities: Vec<String>,
}

struct CuratedModel {
    id: &'static str,
    external_name: &'static str,
    display_name: &'static str,
    ram_required_gb: f64,
    tier: u8,
    capabilities: &'static [&'static str],
}

/// The built-in curated catalog, smallest tier first.
const CURATED: &[CuratedModel] = &[
    CuratedModel {
        id: "qwen3-1.7b",
        external_name: "qwen3:1.7b",
        display_name: "Qwen 3 1.7B",
        ram_required_gb: 2.0,
        tier: 1,
        capabilities: &["chat", "thinking"],
    },
    CuratedModel {
        id: "llama3.2-3b",
        external_name: "llama3.2:3b",
        display_name: "Llama 3.2 3B",
        ram_required_gb: 2.6,
        tier: 1,
        capabilities: &["chat"],
    },
    CuratedModel {
        id: "qwen3-4b",
        external_name: "qwen3:4b",
        display_name: "Qwen 3 4B",
        ram_required_gb: 3.3,
        tier: 1,
        capabilities: &["chat", "thinking"],
    },
    CuratedModel {
        id: "phi4-mini",
        external_name: "phi4-mini:3.8b",
        display_name: "Phi-4 Mini",
        ram_required_gb: 3.4,
        tier: 2,
        capabilities: &["chat"],
    },
    CuratedModel {
        id: "llama3.1-8b",
        external_name: "llama3.1:8b",
        display_name: "Llama 3.1 8B",
        ram_required_gb: 5.4,
        tier: 2,
        capabilities: &["chat"],
    },
    CuratedModel {
        id: "qwen3-8b",
        external_name: "qwen3:8b",
        display_name: "Qwen 3 8B",
        ram_required_gb: 5.9,
        tier: 2,
        capabilities: &["chat", "thinking"],
    },
    CuratedModel {
        id: "gemma3-12b",
        external_name: "gemma3:12b",
        display_name: "Gemma 3 12B",
        ram_required_gb: 8.7,
        tier: 3,
        capabilities: &["chat"],
    },
    CuratedModel {
        id: "qwen3-14b",
        external_name: "qwen3:14b",
        display_name: "Qwen 3 14B",
        ram_required_gb: 9.6,
        tier: 3,
        capabilities: &["chat", "thinking"],
    },
];

/// Materialize the curated catalog. The store seeds its `catalog` table from
/// this at open.
#[must_use]
pub fn curated_catalog() -> Vec<CatalogEntry> {
    CURATED
        .iter()
        .map(|m| CatalogEntry {
            id: m.id.to_string(),
            external_name: m.external_name.to_string(),
            display_name: m.display_name.to_string(),
            ram_required_gb: m.ram_required_gb,
            tier: m.tier,
            capabilities: m.capabilities.iter().map(|c| (*c).to_string()).collect(),
        })
        .collect()
}

/// Install state of a catalog model on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    Downloading,
    Available,
    Error,
}

impl InstallStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            InstallStatus::Downloading => "downloading",
            InstallStatus::Available => "available",
            InstallStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidValue> {
        match raw {
            "downloading" => Ok(InstallStatus::Downloading),
            "available" => Ok(InstallStatus::Available),
            "error" => Ok(InstallStatus::Error),
            other => Err(InvalidValue::new("install status", other)),
        }
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `installed` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledModel {
    pub id: String,
    pub status: InstallStatus,
    /// 0..=100.
    pub download_progress: u8,
    pub is_default: bool,
    pub last_used_at: Option<i64>,
    pub usage_count: i64,
    pub downloaded_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Merged catalog + install state, as returned by the catalog listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    #[serde(flatten)]
    pub entry: CatalogEntry,
    pub installed: Option<InstalledModel>,
}

/// What the runtime reports as resident, via `/api/ps`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub external_name: String,
    pub ram_mb: u64,
    pub expires_at: Option<String>,
}

/// Why the residency manager decided to switch models for the next job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    NoCurrent,
    QueueEmptyForCurrent,
    MaxWaitExceeded,
    PriorityOverride,
}

impl SwitchReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SwitchReason::NoCurrent => "no_current",
            SwitchReason::QueueEmptyForCurrent => "queue_empty_for_current",
            SwitchReason::MaxWaitExceeded => "maxwait_exceeded",
            SwitchReason::PriorityOverride => "priority_override",
        }
    }
}

impl fmt::Display for SwitchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
