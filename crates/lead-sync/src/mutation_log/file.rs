use super::{LogStorage, StorageChange};
use crate::StorageError;

use lf_utils::error::IoResultExt;

use std::{
	ffi::OsStr,
	fs,
	path::{Path, PathBuf},
	sync::Mutex,
};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

const EXTENSION: &str = "json";

/// One JSON file per key inside a directory, for sessions living in different processes.
/// Changes made by any process are picked up through a file watcher, which can't tell who
/// wrote, so notifications carry no origin.
#[derive(Debug)]
pub struct FileStorage {
	dir: PathBuf,
	changes: broadcast::Sender<StorageChange>,
	watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileStorage {
	/// Opens (creating if needed) `dir`. A watcher that fails to start is logged and the
	/// storage keeps working without notifications, readers then rely on polling.
	pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
		let dir = dir.as_ref().to_path_buf();
		fs::create_dir_all(&dir).at_path("creating mutation log directory", &dir)?;

		let (changes, _) = broadcast::channel(64);

		let watcher = match spawn_watcher(&dir, changes.clone()) {
			Ok(watcher) => Some(watcher),
			Err(e) => {
				warn!(dir = %dir.display(), ?e, "Failed to watch mutation log directory");
				None
			}
		};

		Ok(Self {
			dir,
			changes,
			watcher: Mutex::new(watcher),
		})
	}

	#[must_use]
	pub fn path_for(&self, key: &str) -> PathBuf {
		self.dir.join(format!("{key}.{EXTENSION}"))
	}

	#[must_use]
	pub fn is_watching(&self) -> bool {
		self.watcher
			.lock()
			.map_or(false, |watcher| watcher.is_some())
	}
}

fn spawn_watcher(
	dir: &Path,
	changes: broadcast::Sender<StorageChange>,
) -> notify::Result<RecommendedWatcher> {
	let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
		match res {
			Ok(event) => {
				if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
					return;
				}

				for path in &event.paths {
					if path.extension() != Some(OsStr::new(EXTENSION)) {
						continue;
					}

					if let Some(key) = path.file_stem().and_then(OsStr::to_str) {
						// Ignore send errors (no watchers)
						let _ = changes.send(StorageChange {
							key: key.to_string(),
							origin: None,
						});
					}
				}
			}
			Err(e) => error!(?e, "Mutation log watcher error"),
		}
	})?;

	watcher.watch(dir, RecursiveMode::NonRecursive)?;
	debug!(dir = %dir.display(), "Watching mutation log directory");

	Ok(watcher)
}

impl LogStorage for FileStorage {
	fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
		let path = self.path_for(key);
		match fs::read_to_string(&path).at_path("reading mutation log", &path) {
			Ok(value) => Ok(Some(value)),
			Err(e) if e.is_not_found() => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	fn write(&self, key: &str, value: &str, origin: Uuid) -> Result<(), StorageError> {
		let path = self.path_for(key);
		// Readers in other processes must never observe a half written file
		let tmp = self.dir.join(format!(".{key}.{origin}.tmp"));

		fs::write(&tmp, value).at_path("writing mutation log", &tmp)?;
		fs::rename(&tmp, &path).at_path("replacing mutation log", &path)?;

		Ok(())
	}

	fn watch(&self) -> Option<broadcast::Receiver<StorageChange>> {
		self.is_watching().then(|| self.changes.subscribe())
	}
}
