use std::error::Error;
use std::fmt;

/// The boxed error type accepted from loaders.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// The error returned when a caller's own loader invocation fails.
///
/// Only the caller that actually executed the loader receives this error.
/// Callers that were merely waiting on that load are woken, observe the
/// cell reset to empty, and may trigger their own load instead.
#[derive(Debug)]
pub struct LoadError {
  source: BoxError,
}

impl LoadError {
  pub(crate) fn new(source: BoxError) -> Self {
    Self { source }
  }

  /// Consumes the error, returning the underlying loader failure.
  pub fn into_source(self) -> BoxError {
    self.source
  }
}

impl fmt::Display for LoadError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "loader failed: {}", self.source)
  }
}

impl Error for LoadError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    Some(self.source.as_ref())
  }
}
