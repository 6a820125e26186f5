use super::{models::Treatment, persist::Artifact};

pub const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Temporary target changes from the last 6 hours.
    TempTargets,
    /// Carb and insulin entries from the last 24 hours.
    MealCarbs,
}

impl ViewKind {
    pub fn window_ms(&self) -> i64 {
        match self {
            ViewKind::TempTargets => 6 * HOUR_MS,
            ViewKind::MealCarbs => 24 * HOUR_MS,
        }
    }

    pub fn artifact(&self) -> Artifact {
        match self {
            ViewKind::TempTargets => Artifact::TempTargets,
            ViewKind::MealCarbs => Artifact::MealCarbs,
        }
    }

    fn matches(&self, treatment: &Treatment) -> bool {
        match self {
            ViewKind::TempTargets => treatment
                .event_type()
                .map(|event_type| event_type.contains("Target"))
                .unwrap_or(false),
            ViewKind::MealCarbs => treatment.carries_carbs_or_insulin(),
        }
    }

    /// Treatments inside the window that match the view, newest first.
    pub fn select<'a>(
        &self,
        treatments: impl IntoIterator<Item = &'a Treatment>,
        now_ms: i64,
    ) -> Vec<Treatment> {
        let since = now_ms - self.window_ms();
        let mut selected: Vec<Treatment> = treatments
            .into_iter()
            .filter(|treatment| self.matches(treatment))
            .filter(|treatment| treatment.mills().map(|mills| mills >= since).unwrap_or(false))
            .cloned()
            .collect();
        selected.sort_by_key(|treatment| std::cmp::Reverse(treatment.mills()));
        selected
    }
}

/// Last computed value of a view, used as the persistence gate.
#[derive(Debug, Clone)]
pub struct DerivedView {
    kind: ViewKind,
    current: Vec<Treatment>,
}

impl DerivedView {
    pub fn new(kind: ViewKind) -> Self {
        Self {
            kind,
            current: Vec::new(),
        }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn current(&self) -> &[Treatment] {
        &self.current
    }

    /// Recomputes the view and returns it only when it differs from the
    /// previous value.
    pub fn refresh<'a>(
        &mut self,
        treatments: impl IntoIterator<Item = &'a Treatment>,
        now_ms: i64,
    ) -> Option<&[Treatment]> {
        let next = self.kind.select(treatments, now_ms);
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(&self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_709_287_200_000;

    fn treatment(value: serde_json::Value) -> Treatment {
        Treatment::from_value(value).unwrap()
    }

    #[test]
    fn temp_targets_match_by_substring_within_six_hours() {
        let treatments = vec![
            treatment(json!({"eventType": "Temporary Target", "mills": NOW - HOUR_MS})),
            treatment(json!({"eventType": "Temporary Target", "mills": NOW - 7 * HOUR_MS})),
            treatment(json!({"eventType": "Target Cancel", "mills": NOW - 10})),
            treatment(json!({"eventType": "Meal Bolus", "mills": NOW, "carbs": 30})),
        ];

        let view = ViewKind::TempTargets.select(&treatments, NOW);

        let mills: Vec<_> = view.iter().map(|t| t.mills().unwrap()).collect();
        assert_eq!(mills, vec![NOW - 10, NOW - HOUR_MS]);
    }

    #[test]
    fn meal_carbs_window_is_inclusive_and_sorted_newest_first() {
        let treatments = vec![
            treatment(json!({"eventType": "Meal Bolus", "mills": NOW - 24 * HOUR_MS, "carbs": 10})),
            treatment(json!({"eventType": "Correction Bolus", "mills": NOW - 5, "insulin": 1.2})),
            treatment(json!({"eventType": "Carb Correction", "mills": NOW - 24 * HOUR_MS - 1, "carbs": 8})),
            treatment(json!({"eventType": "Note", "mills": NOW})),
            treatment(json!({"eventType": "Meal Bolus", "carbs": 15})),
        ];

        let view = ViewKind::MealCarbs.select(&treatments, NOW);

        let mills: Vec<_> = view.iter().map(|t| t.mills().unwrap()).collect();
        assert_eq!(mills, vec![NOW - 5, NOW - 24 * HOUR_MS]);
    }

    #[test]
    fn refresh_reports_only_changes() {
        let treatments = vec![treatment(json!({"eventType": "Meal Bolus", "mills": NOW, "carbs": 30}))];
        let mut view = DerivedView::new(ViewKind::MealCarbs);

        assert_eq!(view.refresh(&treatments, NOW).map(<[_]>::len), Some(1));
        assert!(view.refresh(&treatments, NOW).is_none());
        assert!(view.refresh(&[], NOW).is_some());
        assert!(view.current().is_empty());
    }
}
