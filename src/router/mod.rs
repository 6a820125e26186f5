//! Maps file-change notifications from the rig's working directory onto the
//! report triggers they should kick.

pub mod triggers;
pub mod watcher;

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use triggers::{TriggerTimings, Triggers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Trigger {
    MealReport,
    ProfileReport,
    StatusSnapshot,
    ReconcileTreatments,
}

const MEAL_INPUTS: &[&str] = &[
    "settings/profile.json",
    "monitor/carbhistory.json",
    "monitor/clock-zoned.json",
    "monitor/pumphistory-zoned.json",
    "settings/basal_profile.json",
    "monitor/glucose.json",
];

const PROFILE_INPUTS: &[&str] = &[
    "settings/bg_targets.json",
    "preferences.json",
    "settings/settings.json",
    "settings/basal_profile.json",
    "settings/carb_ratios.json",
    "settings/temptargets.json",
    "settings/model.json",
    "settings/autotune.json",
    "settings/insulin_sensitivities.json",
];

const STATUS_INPUTS: &[&str] = &[
    "monitor/clock-zoned.json",
    "monitor/iob.json",
    "enact/suggested.json",
    "enact/enacted.json",
    "monitor/battery.json",
    "monitor/reservoir.json",
    "monitor/status.json",
];

const RECONCILE_INPUTS: &[&str] = &["monitor/pumphistory-zoned.json"];

/// Relative path to the triggers it feeds. Fixed after construction.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: BTreeMap<String, Vec<Trigger>>,
}

impl RouteTable {
    pub fn from_groups(groups: &[(Trigger, &[&str])]) -> Self {
        let mut routes: BTreeMap<String, Vec<Trigger>> = BTreeMap::new();
        for (trigger, paths) in groups {
            for path in *paths {
                let fired = routes.entry((*path).to_string()).or_default();
                if !fired.contains(trigger) {
                    fired.push(*trigger);
                }
            }
        }
        Self { routes }
    }

    pub fn default_table() -> Self {
        Self::from_groups(&[
            (Trigger::MealReport, MEAL_INPUTS),
            (Trigger::ProfileReport, PROFILE_INPUTS),
            (Trigger::StatusSnapshot, STATUS_INPUTS),
            (Trigger::ReconcileTreatments, RECONCILE_INPUTS),
        ])
    }

    pub fn triggers_for(&self, relative: &str) -> &[Trigger] {
        self.routes
            .get(relative)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Directories (relative, `""` for the root) holding watched files.
    pub fn watched_dirs(&self) -> BTreeSet<PathBuf> {
        self.paths()
            .map(|path| {
                Path::new(path)
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default()
            })
            .collect()
    }
}

/// Receives fired triggers. Implementations must not block.
pub trait TriggerSink: Send + Sync {
    fn fire(&self, trigger: Trigger);
}

pub struct FileChangeRouter {
    root: PathBuf,
    table: RouteTable,
    sink: Arc<dyn TriggerSink>,
}

impl FileChangeRouter {
    pub fn new(root: impl Into<PathBuf>, table: RouteTable, sink: Arc<dyn TriggerSink>) -> Self {
        Self {
            root: root.into(),
            table,
            sink,
        }
    }

    /// Fires every trigger registered for `path` and returns them.
    pub fn dispatch(&self, path: &Path) -> Vec<Trigger> {
        let Some(relative) = self.normalize(path) else {
            return Vec::new();
        };
        let fired = self.table.triggers_for(&relative).to_vec();
        if !fired.is_empty() {
            log::debug!("{} changed, firing {:?}", relative, fired);
        }
        for trigger in &fired {
            self.sink.fire(*trigger);
        }
        fired
    }

    /// Relative, `/`-joined form of `path`; `None` for anything under `.git`
    /// or outside the root.
    fn normalize(&self, path: &Path) -> Option<String> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?
        } else {
            path
        };

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => {
                    if part == ".git" {
                        return None;
                    }
                    parts.push(part.to_str()?);
                }
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }
}

/// Dispatches paths from the watcher until `cancel` fires or the watcher
/// goes away.
pub async fn route_changes(
    router: FileChangeRouter,
    mut changes: mpsc::UnboundedReceiver<PathBuf>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = changes.recv() => match changed {
                Some(path) => {
                    router.dispatch(&path);
                }
                None => {
                    log::warn!("file watcher stopped, no more report triggers");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        fired: Mutex<Vec<Trigger>>,
    }

    impl TriggerSink for RecordingSink {
        fn fire(&self, trigger: Trigger) {
            self.fired.lock().unwrap().push(trigger);
        }
    }

    fn router() -> (FileChangeRouter, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let router = FileChangeRouter::new("/root/myopenaps", RouteTable::default_table(), sink.clone());
        (router, sink)
    }

    #[test]
    fn shared_inputs_fire_every_group() {
        let (router, sink) = router();

        let fired = router.dispatch(Path::new("monitor/pumphistory-zoned.json"));

        assert_eq!(fired, vec![Trigger::MealReport, Trigger::ReconcileTreatments]);
        assert_eq!(*sink.fired.lock().unwrap(), fired);
        assert_eq!(
            router.dispatch(Path::new("settings/basal_profile.json")),
            vec![Trigger::MealReport, Trigger::ProfileReport]
        );
        assert_eq!(
            router.dispatch(Path::new("monitor/clock-zoned.json")),
            vec![Trigger::MealReport, Trigger::StatusSnapshot]
        );
    }

    #[test]
    fn root_and_dot_prefixes_are_stripped() {
        let (router, _) = router();

        assert_eq!(
            router.dispatch(Path::new("/root/myopenaps/monitor/iob.json")),
            vec![Trigger::StatusSnapshot]
        );
        assert_eq!(
            router.dispatch(Path::new("./preferences.json")),
            vec![Trigger::ProfileReport]
        );
        assert!(router.dispatch(Path::new("/elsewhere/monitor/iob.json")).is_empty());
    }

    #[test]
    fn git_and_unknown_paths_fire_nothing() {
        let (router, sink) = router();

        assert!(router.dispatch(Path::new(".git/index")).is_empty());
        assert!(router.dispatch(Path::new("./.git/monitor/iob.json")).is_empty());
        assert!(router.dispatch(Path::new("monitor/meal.json")).is_empty());
        assert!(router.dispatch(Path::new("")).is_empty());
        assert!(sink.fired.lock().unwrap().is_empty());
    }

    #[test]
    fn watched_dirs_cover_every_route() {
        let dirs = RouteTable::default_table().watched_dirs();
        let expected: BTreeSet<PathBuf> = ["", "enact", "monitor", "settings"]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(dirs, expected);
    }

    #[tokio::test]
    async fn router_task_stops_when_watcher_goes_away() {
        let (router, sink) = router();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(PathBuf::from("monitor/glucose.json")).unwrap();
        drop(tx);

        route_changes(router, rx, CancellationToken::new()).await;

        assert_eq!(*sink.fired.lock().unwrap(), vec![Trigger::MealReport]);
    }
}
