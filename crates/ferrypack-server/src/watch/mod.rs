//! File watcher feeding the rebuild loop.
//!
//! Raw notify events are filtered to file content changes and forwarded on
//! an unbounded channel. [`next_batch`] then coalesces a burst of events into
//! one batch: it waits for the first event and keeps collecting until the
//! debounce window passes without a new one.

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Watcher event for internal processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Paths that changed.
    pub paths: Vec<PathBuf>,
    /// Kind of change.
    pub kind: WatchEventKind,
}

/// Kind of watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Create,
    Modify,
    Remove,
    Other,
}

impl From<&EventKind> for WatchEventKind {
    fn from(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => Self::Create,
            EventKind::Modify(_) => Self::Modify,
            EventKind::Remove(_) => Self::Remove,
            _ => Self::Other,
        }
    }
}

/// Watcher error.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Invalid watch root: {}", .0.display())]
    InvalidRoot(PathBuf),
    #[error("Watcher failed: {0}")]
    WatcherFailed(#[from] notify::Error),
}

/// Directory and file prefixes matched against event paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    prefixes: Vec<PathBuf>,
}

impl IgnoreList {
    #[must_use]
    pub fn new(prefixes: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut prefixes: Vec<PathBuf> = prefixes.into_iter().collect();
        prefixes.sort();
        prefixes.dedup();
        Self { prefixes }
    }

    /// Whether `path` is one of the prefixes or lies under one.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix))
    }

    #[must_use]
    pub fn prefixes(&self) -> &[PathBuf] {
        &self.prefixes
    }
}

/// A running watcher. Dropping it stops the watch.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl FileWatcher {
    /// Watch `roots` recursively, sending events for every path not matched
    /// by `ignore` to `tx`.
    pub fn start(
        roots: &[PathBuf],
        ignore: IgnoreList,
        tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<Self, WatchError> {
        for root in roots {
            if !root.is_dir() {
                return Err(WatchError::InvalidRoot(root.clone()));
            }
        }

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !should_process_event(&event) {
                        return;
                    }
                    let paths: Vec<PathBuf> = event
                        .paths
                        .iter()
                        .filter(|p| !ignore.matches(p))
                        .cloned()
                        .collect();
                    if paths.is_empty() {
                        return;
                    }
                    let watch_event = WatchEvent {
                        paths,
                        kind: WatchEventKind::from(&event.kind),
                    };
                    if let Err(e) = tx.send(watch_event) {
                        warn!(error = %e, "Failed to send watch event");
                    }
                }
                Err(e) => error!(error = %e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            info!(root = %root.display(), "Watching directory");
        }

        Ok(Self {
            _watcher: watcher,
            roots: roots.to_vec(),
        })
    }

    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

/// Wait for the next burst of changes and return its paths, sorted and
/// deduplicated. Returns `None` once the channel is closed and drained.
pub async fn next_batch(
    rx: &mut mpsc::UnboundedReceiver<WatchEvent>,
    window: Duration,
) -> Option<Vec<PathBuf>> {
    let first = rx.recv().await?;
    let mut pending: BTreeSet<PathBuf> = first.paths.into_iter().collect();
    let mut events = 1usize;

    loop {
        match tokio::time::timeout(window, rx.recv()).await {
            Ok(Some(event)) => {
                pending.extend(event.paths);
                events += 1;
            }
            // Closed mid-burst: deliver what we have.
            Ok(None) | Err(_) => break,
        }
    }

    debug!(events, paths = pending.len(), "coalesced file events");
    Some(pending.into_iter().collect())
}

/// Check if we should process this event.
fn should_process_event(event: &Event) -> bool {
    matches!(
        &event.kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(
                ModifyKind::Data(_)
                    | ModifyKind::Any
                    | ModifyKind::Name(RenameMode::To | RenameMode::From | RenameMode::Both)
            )
            | EventKind::Remove(RemoveKind::File | RemoveKind::Any)
    ) && event.paths.iter().any(|p| !is_hidden_temp(p))
}

/// Editor swap files and atomic-write temporaries.
fn is_hidden_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with('~') || n.ends_with(".swp") || n.starts_with(".tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_list_matches_prefixes() {
        let ignore = IgnoreList::new([
            PathBuf::from("/p/output"),
            PathBuf::from("/p/app.js"),
            PathBuf::from("/p/output"),
        ]);
        assert_eq!(ignore.prefixes().len(), 2);
        assert!(ignore.matches(Path::new("/p/output/Main/index.js")));
        assert!(ignore.matches(Path::new("/p/app.js")));
        // Component-wise, not string prefixes.
        assert!(!ignore.matches(Path::new("/p/output2/x.js")));
        assert!(!ignore.matches(Path::new("/p/src/Main.purs")));
    }

    fn event(path: &str) -> WatchEvent {
        WatchEvent {
            paths: vec![PathBuf::from(path)],
            kind: WatchEventKind::Modify,
        }
    }

    #[test]
    fn test_watch_event_kind_from_notify() {
        assert_eq!(
            WatchEventKind::from(&EventKind::Create(CreateKind::File)),
            WatchEventKind::Create
        );
        assert_eq!(
            WatchEventKind::from(&EventKind::Remove(RemoveKind::File)),
            WatchEventKind::Remove
        );
    }

    #[test]
    fn test_filters_metadata_and_temp_files() {
        let data = Event::new(EventKind::Modify(ModifyKind::Data(
            notify::event::DataChange::Content,
        )))
        .add_path(PathBuf::from("/p/src/Main.purs"));
        assert!(should_process_event(&data));

        let meta = Event::new(EventKind::Modify(ModifyKind::Metadata(
            notify::event::MetadataKind::Permissions,
        )))
        .add_path(PathBuf::from("/p/src/Main.purs"));
        assert!(!should_process_event(&meta));

        let swap = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/p/src/.Main.purs.swp"));
        assert!(!should_process_event(&swap));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_in_window_is_one_batch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let window = Duration::from_millis(100);

        let sender = tokio::spawn(async move {
            for i in 0..5 {
                tx.send(event(&format!("/p/src/M{}.purs", i % 3))).unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send(event("/p/src/Late.purs")).unwrap();
        });

        let first = next_batch(&mut rx, window).await.unwrap();
        assert_eq!(
            first,
            vec![
                PathBuf::from("/p/src/M0.purs"),
                PathBuf::from("/p/src/M1.purs"),
                PathBuf::from("/p/src/M2.purs"),
            ]
        );
        let second = next_batch(&mut rx, window).await.unwrap();
        assert_eq!(second, vec![PathBuf::from("/p/src/Late.purs")]);

        sender.await.unwrap();
        assert!(next_batch(&mut rx, window).await.is_none());
    }

    #[test]
    fn test_invalid_root() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = FileWatcher::start(
            &[PathBuf::from("/definitely/not/here")],
            IgnoreList::default(),
            tx,
        );
        assert!(matches!(result, Err(WatchError::InvalidRoot(_))));
    }
}
