//! Capability-tier selection for the engine module and worker.
//!
//! The configuration lists one `{main_module, main_worker}` pair per tier.
//! `eh` needs a host that unwinds panics so the worker can survive a failed
//! job; `mvp` runs everywhere.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineError;

pub const MVP_TIER: &str = "mvp";
pub const EH_TIER: &str = "eh";

/// Resource locations for one capability tier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineBundle {
    /// Module location; used as the engine's extension directory.
    pub main_module: String,
    /// Worker entrypoint; names the background thread running the engine.
    pub main_worker: String,
}

impl EngineBundle {
    pub fn new(main_module: impl Into<String>, main_worker: impl Into<String>) -> Self {
        Self {
            main_module: main_module.into(),
            main_worker: main_worker.into(),
        }
    }

    fn is_resolvable(&self) -> bool {
        !self.main_module.trim().is_empty() && !self.main_worker.trim().is_empty()
    }
}

pub fn default_bundles() -> BTreeMap<String, EngineBundle> {
    let mut bundles = BTreeMap::new();
    bundles.insert(
        MVP_TIER.to_string(),
        EngineBundle::new(".samplescope/extensions/mvp", "duckdb-worker-mvp"),
    );
    bundles.insert(
        EH_TIER.to_string(),
        EngineBundle::new(".samplescope/extensions/eh", "duckdb-worker-eh"),
    );
    bundles
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleTier {
    Mvp,
    Eh,
}

impl BundleTier {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            MVP_TIER => Some(BundleTier::Mvp),
            EH_TIER => Some(BundleTier::Eh),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BundleTier::Mvp => MVP_TIER,
            BundleTier::Eh => EH_TIER,
        }
    }

    /// Whether panics inside engine jobs are caught and reported as errors.
    pub fn catches_panics(&self) -> bool {
        matches!(self, BundleTier::Eh)
    }

    fn supported_on(&self, platform: &PlatformFeatures) -> bool {
        match self {
            BundleTier::Mvp => true,
            BundleTier::Eh => platform.exceptions,
        }
    }
}

impl fmt::Display for BundleTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the running host can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformFeatures {
    pub exceptions: bool,
    pub threads: bool,
}

impl PlatformFeatures {
    pub fn probe() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() > 1)
            .unwrap_or(false);
        let features = Self {
            exceptions: cfg!(panic = "unwind"),
            threads,
        };
        debug!(?features, "probed platform features");
        features
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedBundle {
    pub tier: BundleTier,
    pub bundle: EngineBundle,
}

/// Pick the best tier the platform supports, preferring `eh` over `mvp`.
pub fn select_bundle(
    bundles: &BTreeMap<String, EngineBundle>,
    platform: &PlatformFeatures,
) -> Result<SelectedBundle, EngineError> {
    let mut candidates = Vec::new();
    for (name, bundle) in bundles {
        let Some(tier) = BundleTier::from_name(name) else {
            warn!(tier = %name, "ignoring unknown engine bundle tier");
            continue;
        };
        if !bundle.is_resolvable() {
            warn!(tier = %name, "ignoring engine bundle with blank locations");
            continue;
        }
        if tier.supported_on(platform) {
            candidates.push((tier, bundle));
        }
    }

    let (tier, bundle) = candidates
        .into_iter()
        .max_by_key(|(tier, _)| matches!(tier, BundleTier::Eh))
        .ok_or_else(|| {
            let offered = if bundles.is_empty() {
                "none".to_string()
            } else {
                bundles.keys().cloned().collect::<Vec<_>>().join(", ")
            };
            EngineError::UnsupportedEnvironment(format!(
                "no engine bundle usable on this platform (offered tiers: {offered})"
            ))
        })?;

    info!(
        tier = %tier,
        module = %bundle.main_module,
        worker = %bundle.main_worker,
        "selected engine bundle"
    );
    Ok(SelectedBundle {
        tier,
        bundle: bundle.clone(),
    })
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;

    const FULL: PlatformFeatures = PlatformFeatures {
        exceptions: true,
        threads: true,
    };
    const BASELINE: PlatformFeatures = PlatformFeatures {
        exceptions: false,
        threads: false,
    };

    #[test]
    fn prefers_eh_when_exceptions_are_available() -> Result<()> {
        let selected = select_bundle(&default_bundles(), &FULL)?;
        assert_eq!(selected.tier, BundleTier::Eh);
        assert_eq!(selected.bundle.main_worker, "duckdb-worker-eh");
        Ok(())
    }

    #[test]
    fn falls_back_to_mvp_without_exceptions() -> Result<()> {
        let selected = select_bundle(&default_bundles(), &BASELINE)?;
        assert_eq!(selected.tier, BundleTier::Mvp);
        assert!(!selected.tier.catches_panics());
        Ok(())
    }

    #[test]
    fn empty_bundle_set_is_unsupported() -> Result<()> {
        let err = select_bundle(&BTreeMap::new(), &FULL)
            .err()
            .ok_or_else(|| anyhow!("expected unsupported environment"))?;
        assert!(matches!(err, EngineError::UnsupportedEnvironment(_)));
        assert!(err.to_string().contains("offered tiers: none"));
        Ok(())
    }

    #[test]
    fn eh_only_bundle_is_unsupported_on_baseline_platform() -> Result<()> {
        let mut bundles = BTreeMap::new();
        bundles.insert(EH_TIER.to_string(), EngineBundle::new("ext/eh", "worker-eh"));
        let err = select_bundle(&bundles, &BASELINE)
            .err()
            .ok_or_else(|| anyhow!("expected unsupported environment"))?;
        assert!(err.to_string().contains("offered tiers: eh"));
        Ok(())
    }

    #[test]
    fn unknown_and_blank_tiers_are_skipped() -> Result<()> {
        let mut bundles = BTreeMap::new();
        bundles.insert("coi".to_string(), EngineBundle::new("ext/coi", "worker-coi"));
        bundles.insert(EH_TIER.to_string(), EngineBundle::new("", "worker-eh"));
        bundles.insert(MVP_TIER.to_string(), EngineBundle::new("ext/mvp", "worker-mvp"));

        let selected = select_bundle(&bundles, &FULL)?;
        assert_eq!(selected.tier, BundleTier::Mvp);
        assert_eq!(selected.bundle.main_module, "ext/mvp");
        Ok(())
    }

    #[test]
    fn probe_reports_unwinding_support() {
        let features = PlatformFeatures::probe();
        assert_eq!(features.exceptions, cfg!(panic = "unwind"));
    }
}
