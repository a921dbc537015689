use std::{
	fmt::Display,
	io,
	path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::error;

/// Logs a failed unit result, naming what was being done when it failed.
pub fn report_error(context: &str, res: &Result<(), impl Display>) {
	if let Err(e) = res {
		error!(%context, "{e:#}");
	}
}

/// An I/O failure on a file, with the operation and the path it happened on.
#[derive(Error, Debug)]
#[error("{operation} failed <path='{}'>: {source}", .path.display())]
pub struct FileIOError {
	pub operation: &'static str,
	pub path: PathBuf,
	#[source]
	pub source: io::Error,
}

impl FileIOError {
	pub fn new(operation: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
		Self {
			operation,
			path: path.as_ref().to_path_buf(),
			source,
		}
	}

	#[must_use]
	pub fn is_not_found(&self) -> bool {
		self.source.kind() == io::ErrorKind::NotFound
	}
}

/// Attaches the operation and path to a bare [`io::Result`].
pub trait IoResultExt<T> {
	fn at_path(self, operation: &'static str, path: impl AsRef<Path>) -> Result<T, FileIOError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
	fn at_path(self, operation: &'static str, path: impl AsRef<Path>) -> Result<T, FileIOError> {
		self.map_err(|e| FileIOError::new(operation, path, e))
	}
}
