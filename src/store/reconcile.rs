use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::Value;

use super::{
    models::{GlucoseEntry, Treatment, TreatmentKey},
    persist::{Artifact, ArtifactSink},
    views::{DerivedView, ViewKind, HOUR_MS},
};

// Set to true to log every treatment added or removed
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const GLUCOSE_WINDOW_MS: i64 = 24 * HOUR_MS;

/// Merged treatment and glucose history plus the views derived from it.
/// The raw history lives only in memory; the views are persisted.
pub struct ReconciliationStore {
    treatments: BTreeMap<TreatmentKey, Treatment>,
    glucose: Vec<GlucoseEntry>,
    temp_targets: DerivedView,
    meal_carbs: DerivedView,
    artifacts: Arc<dyn ArtifactSink>,
}

impl ReconciliationStore {
    pub fn new(artifacts: Arc<dyn ArtifactSink>) -> Self {
        Self {
            treatments: BTreeMap::new(),
            glucose: Vec::new(),
            temp_targets: DerivedView::new(ViewKind::TempTargets),
            meal_carbs: DerivedView::new(ViewKind::MealCarbs),
            artifacts,
        }
    }

    pub fn treatment(&self, key: &TreatmentKey) -> Option<&Treatment> {
        self.treatments.get(key)
    }

    pub fn treatments(&self) -> impl Iterator<Item = &Treatment> {
        self.treatments.values()
    }

    pub fn treatment_count(&self) -> usize {
        self.treatments.len()
    }

    pub fn glucose_len(&self) -> usize {
        self.glucose.len()
    }

    pub fn temp_targets(&self) -> &[Treatment] {
        self.temp_targets.current()
    }

    pub fn meal_carbs(&self) -> &[Treatment] {
        self.meal_carbs.current()
    }

    /// Applies a cloud-pushed treatment batch: remove-actions delete every
    /// stored treatment carrying the same `_id`, everything else upserts by
    /// key. Both views are then recomputed and persisted if they changed.
    pub fn ingest_cloud_treatments(&mut self, batch: &[Value], now_ms: i64) -> Result<()> {
        for raw in batch {
            let Some(treatment) = Treatment::from_value(raw.clone()) else {
                log_warn!("skipping non-object treatment {}", raw);
                continue;
            };

            if treatment.is_remove() {
                self.remove_by_id(&treatment);
                continue;
            }

            match treatment.key() {
                Some(key) => {
                    self.treatments.insert(key, treatment);
                }
                None => log_warn!("skipping treatment without eventType: {}", raw),
            }
        }

        self.refresh_views(now_ms)
    }

    fn remove_by_id(&mut self, tombstone: &Treatment) {
        let Some(id) = tombstone.id() else {
            log_warn!("remove action without _id ignored: {:?}", tombstone.fields());
            return;
        };

        let doomed: Vec<TreatmentKey> = self
            .treatments
            .iter()
            .filter(|(_, stored)| stored.id() == Some(id))
            .map(|(key, _)| key.clone())
            .collect();

        for key in doomed {
            self.treatments.remove(&key);
            log_info!("removed treatment {} (_id {})", key, id);
        }
    }

    /// Inserts locally formatted treatments whose key is not yet known and
    /// returns them so the caller can push them upstream. Known keys are left
    /// untouched: the cloud copy wins. Views are recomputed when anything
    /// was added.
    pub fn ingest_local_treatments(
        &mut self,
        records: Vec<Treatment>,
        now_ms: i64,
    ) -> Result<Vec<Treatment>> {
        let mut added = Vec::new();
        for treatment in records {
            let Some(key) = treatment.key() else {
                log_warn!("skipping formatted treatment without eventType");
                continue;
            };
            if self.treatments.contains_key(&key) {
                continue;
            }
            log_info!("{} being added", key);
            self.treatments.insert(key, treatment.clone());
            added.push(treatment);
        }
        if !added.is_empty() {
            self.refresh_views(now_ms)?;
        }
        Ok(added)
    }

    /// Appends readings, then persists the 24h window newest first. Returns
    /// the window size.
    pub fn ingest_glucose(&mut self, batch: &[Value], now_ms: i64) -> Result<usize> {
        for raw in batch {
            match GlucoseEntry::from_sgv(raw, &Local) {
                Some(entry) => self.glucose.push(entry),
                None => log_warn!("skipping sgv without usable mills: {}", raw),
            }
        }

        let since = now_ms - GLUCOSE_WINDOW_MS;
        let mut window: Vec<&GlucoseEntry> =
            self.glucose.iter().filter(|entry| entry.date > since).collect();
        window.sort_by_key(|entry| std::cmp::Reverse(entry.date));

        if let Some(newest) = window.first() {
            let body = serde_json::to_vec(&window).context("Failed to serialize glucose window")?;
            log_info!("writing {}", Artifact::Glucose.relative_path());
            self.artifacts.write(Artifact::Glucose, &body, newest.date)?;
        }
        Ok(window.len())
    }

    fn refresh_views(&mut self, now_ms: i64) -> Result<()> {
        refresh_and_persist(
            &mut self.temp_targets,
            &self.treatments,
            self.artifacts.as_ref(),
            now_ms,
        )?;
        refresh_and_persist(
            &mut self.meal_carbs,
            &self.treatments,
            self.artifacts.as_ref(),
            now_ms,
        )
    }
}

fn refresh_and_persist(
    view: &mut DerivedView,
    treatments: &BTreeMap<TreatmentKey, Treatment>,
    artifacts: &dyn ArtifactSink,
    now_ms: i64,
) -> Result<()> {
    let kind = view.kind();
    let Some(changed) = view.refresh(treatments.values(), now_ms) else {
        return Ok(());
    };
    // An emptied view is remembered but leaves the previous file in place.
    let Some(newest) = changed.first().and_then(Treatment::mills) else {
        return Ok(());
    };
    let body = serde_json::to_vec(changed)
        .with_context(|| format!("Failed to serialize {:?} view", kind))?;
    artifacts.write(kind.artifact(), &body, newest)
}
