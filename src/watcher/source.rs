//! Filesystem change source and path filtering.
//!
//! [`FsChangeSource`] wraps a `notify::RecommendedWatcher` whose callback runs
//! on the backend's own thread and only ever talks to the [`EventBridge`].
//! Filtering by pattern and exclusion list is done by [`ChangeFilter`] inside
//! the pipeline, after the hand-off.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use glob::Pattern;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use walkdir::WalkDir;

use crate::config::{ConfigError, WatchConfig};
use crate::utils::unix_timestamp;

use super::bridge::EventBridge;
use super::error::WatchError;
use super::event::ChangeKind;

/// Decides which paths under the watch root are processed.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    root: PathBuf,
    /// Canonical form of `root` when it differs (symlinks, relative roots);
    /// the OS backend reports canonical paths.
    canonical_root: Option<PathBuf>,
    patterns: Vec<Pattern>,
    excluded: HashSet<String>,
    recursive: bool,
}

impl ChangeFilter {
    pub fn from_config(config: &WatchConfig) -> Result<Self, ConfigError> {
        if config.include_patterns.is_empty() {
            return Err(ConfigError::NoIncludePatterns);
        }

        let patterns = config
            .include_patterns
            .iter()
            .map(|raw| {
                Pattern::new(raw).map_err(|e| ConfigError::InvalidPattern {
                    pattern: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root: config.watch_root.clone(),
            canonical_root: None,
            patterns,
            excluded: config.excluded_names.iter().cloned().collect(),
            recursive: config.recursive,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Also accept paths under the canonical form of the root.
    ///
    /// The root must exist; otherwise the filter is left unchanged.
    pub fn resolve_root(&mut self) {
        match std::fs::canonicalize(&self.root) {
            Ok(canonical) if canonical != self.root => self.canonical_root = Some(canonical),
            Ok(_) => {}
            Err(e) => {
                crate::debug_event!("source", "root not resolved", "{}: {e}", self.root.display());
            }
        }
    }

    /// Path relative to the watch root, if it lies inside it.
    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok().or_else(|| {
            self.canonical_root
                .as_ref()
                .and_then(|root| path.strip_prefix(root).ok())
        })
    }

    /// Check if a path is inside the watch root at a watched depth.
    pub fn within_root(&self, path: &Path) -> bool {
        match self.relative(path) {
            Some(relative) => {
                let depth = relative
                    .components()
                    .filter(|c| matches!(c, Component::Normal(_)))
                    .count();
                depth == 1 || (self.recursive && depth > 1)
            }
            None => false,
        }
    }

    /// Check if a path should be processed.
    pub fn matches(&self, path: &Path) -> bool {
        if !self.within_root(path) {
            return false;
        }

        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        if self.excluded.contains(name.as_ref()) {
            return false;
        }

        let relative = self.relative(path).unwrap_or(path);
        self.patterns.iter().any(|pattern| {
            if pattern.as_str().contains('/') {
                pattern.matches_path(relative)
            } else {
                pattern.matches(&name)
            }
        })
    }

    /// Scan the watch root for files that should be processed.
    ///
    /// Returns sorted paths. A missing root yields an empty list.
    pub fn scan(&self) -> Vec<PathBuf> {
        let max_depth = if self.recursive { usize::MAX } else { 1 };

        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("[source] scan error: {e}");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.matches(path))
            .collect();

        files.sort();
        files
    }
}

/// Map a notify event to the change kinds the pipeline understands.
///
/// Access and metadata-free `Other` events are ignored. A rename yields a
/// `deleted` change for the old path and a `moved` change for the new one.
pub fn classify(event: &Event) -> Vec<(PathBuf, ChangeKind)> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Name(mode)) => return classify_rename(mode, &event.paths),
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Deleted,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter(|path| kind == ChangeKind::Deleted || !path.is_dir())
        .map(|path| (path.clone(), kind))
        .collect()
}

fn classify_rename(mode: RenameMode, paths: &[PathBuf]) -> Vec<(PathBuf, ChangeKind)> {
    paths
        .iter()
        .enumerate()
        .filter_map(|(index, path)| {
            let kind = match mode {
                RenameMode::From => ChangeKind::Deleted,
                RenameMode::To => ChangeKind::Moved,
                RenameMode::Both if index == 0 => ChangeKind::Deleted,
                RenameMode::Both => ChangeKind::Moved,
                // Backends that cannot tell the halves apart report one path
                // per event; whichever side no longer exists is the source.
                RenameMode::Any | RenameMode::Other => {
                    if path.exists() {
                        ChangeKind::Moved
                    } else {
                        ChangeKind::Deleted
                    }
                }
            };
            (kind == ChangeKind::Deleted || !path.is_dir()).then(|| (path.clone(), kind))
        })
        .collect()
}

/// OS-level change source feeding the bridge.
pub struct FsChangeSource {
    root: PathBuf,
    /// The underlying file watcher; dropping it stops notifications.
    _watcher: notify::RecommendedWatcher,
}

impl FsChangeSource {
    /// Start watching `root`, delivering every change to `bridge`.
    pub fn start(
        root: &Path,
        recursive: bool,
        bridge: Arc<EventBridge>,
    ) -> Result<Self, WatchError> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    for (path, kind) in classify(&event) {
                        bridge.deliver(path, kind, unix_timestamp());
                    }
                }
                Err(e) => {
                    tracing::error!("[source] file watch error: {e}");
                }
            }
        })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        watcher
            .watch(root, mode)
            .map_err(|e| WatchError::PathWatchFailed {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })?;

        crate::debug_event!("source", "watching", "{}", root.display());

        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::fs;
    use tempfile::TempDir;

    fn filter(root: &Path, recursive: bool) -> ChangeFilter {
        let config = WatchConfig {
            watch_root: root.to_path_buf(),
            recursive,
            ..WatchConfig::default()
        };
        ChangeFilter::from_config(&config).unwrap()
    }

    #[test]
    fn test_filter_patterns_and_exclusions() {
        let filter = filter(Path::new("/apps"), false);

        assert!(filter.matches(Path::new("/apps/lights.py")));
        assert!(!filter.matches(Path::new("/apps/notes.txt")));
        assert!(!filter.matches(Path::new("/apps/__init__.py")));
        assert!(!filter.matches(Path::new("/apps/secrets.py")));
        assert!(!filter.matches(Path::new("/elsewhere/lights.py")));
    }

    #[test]
    fn test_filter_depth() {
        let flat = filter(Path::new("/apps"), false);
        assert!(!flat.matches(Path::new("/apps/sub/lights.py")));
        assert!(!flat.within_root(Path::new("/apps/sub/lights.py")));

        let deep = filter(Path::new("/apps"), true);
        assert!(deep.matches(Path::new("/apps/sub/lights.py")));
        assert!(deep.within_root(Path::new("/apps/sub/lights.py")));
        assert!(!deep.within_root(Path::new("/apps")));
    }

    #[test]
    fn test_filter_relative_path_pattern() {
        let config = WatchConfig {
            watch_root: PathBuf::from("/apps"),
            include_patterns: vec!["rooms/*.py".to_string()],
            recursive: true,
            ..WatchConfig::default()
        };
        let filter = ChangeFilter::from_config(&config).unwrap();

        assert!(filter.matches(Path::new("/apps/rooms/kitchen.py")));
        assert!(!filter.matches(Path::new("/apps/kitchen.py")));
    }

    #[test]
    fn test_filter_rejects_empty_patterns() {
        let config = WatchConfig {
            include_patterns: Vec::new(),
            ..WatchConfig::default()
        };
        assert!(matches!(
            ChangeFilter::from_config(&config),
            Err(ConfigError::NoIncludePatterns)
        ));
    }

    #[test]
    fn test_scan_finds_matching_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::write(root.join("b.py"), "").unwrap();
        fs::write(root.join("a.py"), "").unwrap();
        fs::write(root.join("utils.py"), "").unwrap();
        fs::write(root.join("readme.md"), "").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("c.py"), "").unwrap();

        let flat = filter(root, false).scan();
        assert_eq!(flat, vec![root.join("a.py"), root.join("b.py")]);

        let deep = filter(root, true).scan();
        assert_eq!(
            deep,
            vec![root.join("a.py"), root.join("b.py"), root.join("sub").join("c.py")]
        );
    }

    #[test]
    fn test_resolve_root_accepts_canonical_paths() {
        let temp = TempDir::new().unwrap();
        let real = temp.path().join("real");
        fs::create_dir(&real).unwrap();

        // A root spelled with a `..` detour canonicalizes to `real`.
        let detour = real.join("..").join("real");
        let mut filter = filter(&detour, false);
        let canonical = fs::canonicalize(&real).unwrap();
        assert!(!filter.matches(&canonical.join("a.py")));

        filter.resolve_root();
        assert!(filter.matches(&canonical.join("a.py")));
        assert!(filter.matches(&detour.join("a.py")));
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing");
        assert!(filter(&missing, false).scan().is_empty());
    }

    #[test]
    fn test_classify_maps_kinds() {
        let path = PathBuf::from("/apps/a.py");

        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        assert_eq!(classify(&create), vec![(path.clone(), ChangeKind::Created)]);

        let modify = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(path.clone());
        assert_eq!(classify(&modify), vec![(path.clone(), ChangeKind::Modified)]);

        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path(path.clone());
        assert_eq!(classify(&remove), vec![(path.clone(), ChangeKind::Deleted)]);

        let renamed = PathBuf::from("/apps/b.py");
        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(path.clone())
            .add_path(renamed.clone());
        assert_eq!(
            classify(&rename),
            vec![(path.clone(), ChangeKind::Deleted), (renamed, ChangeKind::Moved)]
        );

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(path);
        assert!(classify(&access).is_empty());
    }

    #[test]
    fn test_rename_halves_split_into_delete_and_move() {
        let old = PathBuf::from("/apps/a.py");
        let new = PathBuf::from("/apps/b.py");

        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(old.clone());
        assert_eq!(classify(&from), vec![(old, ChangeKind::Deleted)]);

        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(new.clone());
        assert_eq!(classify(&to), vec![(new, ChangeKind::Moved)]);
    }

    #[test]
    fn test_unpaired_rename_uses_path_existence() {
        let temp = TempDir::new().unwrap();
        let present = temp.path().join("b.py");
        fs::write(&present, "x = 1\n").unwrap();
        let gone = temp.path().join("a.py");

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
            .add_path(gone.clone())
            .add_path(present.clone());
        assert_eq!(
            classify(&rename),
            vec![(gone, ChangeKind::Deleted), (present, ChangeKind::Moved)]
        );
    }

    #[test]
    fn test_renamed_directory_only_reports_its_old_path() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("pkg_old");
        let new = temp.path().join("pkg");
        fs::create_dir(&new).unwrap();

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(old.clone())
            .add_path(new);
        assert_eq!(classify(&rename), vec![(old, ChangeKind::Deleted)]);
    }
}
