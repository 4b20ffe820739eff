use std::sync::Arc;

use publisher_storage::{ObjectStore, PutOptions, join_key};
use publisher_types::{Clock, ReleaseInfo, system_clock};
use tracing::{debug, info};

use crate::{Mark, Marker, MarkerError, decode_log, encode_log};

/// Name of the log blob inside the marker directory.
pub const MARKER_FILE: &str = "releases.json";

/// Marker log kept as a single JSON array in an object store.
pub struct ObjectMarker<S> {
    store: S,
    directory: String,
    clock: Arc<dyn Clock>,
}

impl<S: ObjectStore> ObjectMarker<S> {
    pub fn new(store: S, directory: impl Into<String>) -> Self {
        Self {
            store,
            directory: directory.into(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Object key of the log blob.
    pub fn path(&self) -> String {
        join_key(&[&self.directory, MARKER_FILE])
    }

    /// Read the whole log. A missing blob is an empty log.
    pub fn marks(&self) -> Result<Vec<Mark>, MarkerError> {
        match self.store.get(&self.path()) {
            Ok(bytes) => decode_log(&bytes),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, marks: &[Mark]) -> Result<(), MarkerError> {
        let bytes = encode_log(marks)?;
        debug!(bucket = self.store.bucket(), key = %self.path(), marks = marks.len(), "writing marker file");
        self.store
            .put(&self.path(), &bytes, &PutOptions::json())
            .map_err(MarkerError::CannotWriteMarkerFile)
    }
}

impl<S: ObjectStore> Marker for ObjectMarker<S> {
    fn start(&self, release: ReleaseInfo) -> Result<Mark, MarkerError> {
        info!(app_name = %release.app_name, tag = %release.tag, run_id = %release.run_id, "starting release mark");
        let mut marks = self.marks()?;

        let mark = Mark::open(release, self.clock.now());
        marks.push(mark.clone());
        self.write(&marks)?;

        Ok(mark)
    }

    fn end(&self, mark: &Mark) -> Result<(), MarkerError> {
        info!(app_name = %mark.app_name(), "ending release mark");
        if !mark.is_started() {
            return Err(MarkerError::NotStartedMark);
        }

        let mut marks = self.marks()?;
        let Some(last) = marks.last_mut() else {
            return Err(MarkerError::NoStartedMarkersFound);
        };
        if last.is_ended() {
            return Err(MarkerError::LastMarkerEnded);
        }
        if last.app_name() != mark.app_name() || !last.same_start(mark) {
            return Err(MarkerError::NoStartedMarkerFoundForApp {
                app_name: mark.app_name().to_string(),
                start: mark.start,
            });
        }

        last.end = Some(self.clock.now());
        self.write(&marks)
    }
}

impl<S> std::fmt::Debug for ObjectMarker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMarker")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}
