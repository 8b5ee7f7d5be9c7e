//! Append-only checkpoint files, one full document snapshot per run.
//!
//! Files live in a single flat directory and are named
//! `pipeline_state_<kind>_<uuid>.json`, where `<kind>` is the lowercased
//! [`Document::KIND`]. A file is never rewritten: every run adds a new one,
//! and "the latest run of this job" is the newest file (by creation time)
//! whose snapshot matches the job's identity [`Query`].

use crate::document::{kind_tag, Document, DocumentState, Query};
use crate::error::PipelineError;
use serde_json::{Map, Value};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};
use uuid::Uuid;

const FILE_PREFIX: &str = "pipeline_state_";
const FILE_SUFFIX: &str = ".json";

/// A checkpoint file found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub path: PathBuf,
    /// Lowercased document kind from the file name.
    pub kind: String,
    /// Creation time, or modification time where the filesystem has no
    /// birth time.
    pub created: SystemTime,
}

/// Reads and writes checkpoints in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `doc` to a new, uniquely named file and return its path.
    pub fn save<D: Document>(&self, doc: &D) -> Result<PathBuf, PipelineError> {
        fs::create_dir_all(&self.dir).map_err(|source| PipelineError::CheckpointDirUnavailable {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.dir.join(format!(
            "{FILE_PREFIX}{}_{}{FILE_SUFFIX}",
            kind_tag::<D>(),
            Uuid::new_v4()
        ));
        let write_failed = |source: io::Error| PipelineError::CheckpointWriteFailed {
            path: path.clone(),
            source,
        };

        // Write beside the target, then link it into place without
        // replacing anything that already exists.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(write_failed)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, doc).map_err(PipelineError::Snapshot)?;
            writer.flush().map_err(write_failed)?;
        }
        tmp.persist_noclobber(&path)
            .map_err(|e| write_failed(e.error))?;

        info!("Checkpoint written: {}", path.display());
        Ok(path)
    }

    /// Checkpoint files in the store, newest first.
    ///
    /// `kind` filters by lowercased document kind. A directory that does not
    /// exist yet holds no checkpoints.
    pub fn list(&self, kind: Option<&str>) -> Result<Vec<CheckpointEntry>, PipelineError> {
        let unavailable = |source: io::Error| PipelineError::CheckpointDirUnavailable {
            path: self.dir.clone(),
            source,
        };
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(e)),
        };

        let wanted = kind.map(str::to_lowercase);
        let mut entries = Vec::new();
        for item in read_dir {
            let item = item.map_err(unavailable)?;
            let path = item.path();
            let Some(file_kind) = kind_of(&path) else {
                continue;
            };
            if wanted.as_deref().is_some_and(|k| k != file_kind) {
                continue;
            }
            let meta = item.metadata().map_err(unavailable)?;
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push(CheckpointEntry {
                kind: file_kind.to_string(),
                path,
                created,
            });
        }
        entries.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(entries)
    }

    /// The newest checkpoint of `D` whose snapshot matches `query`.
    pub fn latest<D: Document>(&self, query: &Query) -> Result<Option<CheckpointEntry>, PipelineError> {
        self.latest_of_kind(&kind_tag::<D>(), query)
    }

    /// The newest checkpoint of `kind` whose snapshot matches `query`.
    ///
    /// Every candidate file is parsed; a malformed one is an error rather
    /// than being passed over. No match is `Ok(None)`.
    pub fn latest_of_kind(
        &self,
        kind: &str,
        query: &Query,
    ) -> Result<Option<CheckpointEntry>, PipelineError> {
        let mut newest = None;
        for entry in self.list(Some(kind))? {
            let snapshot = self.load_snapshot(kind, &entry.path)?;
            if newest.is_none() && matches_query(&snapshot, query) {
                newest = Some(entry);
            }
        }
        match &newest {
            Some(entry) => debug!("Latest '{}' checkpoint: {}", kind, entry.path.display()),
            None => debug!("No '{}' checkpoint matches {:?}", kind, query),
        }
        Ok(newest)
    }

    /// Load a checkpoint of `D`, tolerating fields that drifted since it
    /// was written.
    pub fn load<D: Document>(&self, path: &Path) -> Result<D, PipelineError> {
        let snapshot = self.load_snapshot(&kind_tag::<D>(), path)?;
        DocumentState::restore_tolerant(snapshot)
    }

    /// The raw field map stored in a checkpoint of `kind`.
    pub fn load_snapshot(&self, kind: &str, path: &Path) -> Result<Map<String, Value>, PipelineError> {
        let path = self.resolve(path)?;
        if kind_of(&path) != Some(kind.to_lowercase().as_str()) {
            return Err(PipelineError::CheckpointKindMismatch {
                path,
                expected: kind.to_string(),
            });
        }
        let text = fs::read_to_string(&path).map_err(|e| PipelineError::CorruptCheckpoint {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(PipelineError::CorruptCheckpoint {
                path,
                detail: "expected a JSON object".into(),
            }),
            Err(e) => Err(PipelineError::CorruptCheckpoint {
                path,
                detail: e.to_string(),
            }),
        }
    }

    /// Find `path` as given, or relative to the store directory.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, PipelineError> {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        let in_store = self.dir.join(path);
        if path.is_relative() && in_store.is_file() {
            return Ok(in_store);
        }
        Err(PipelineError::CheckpointNotFound {
            path: path.to_path_buf(),
        })
    }
}

/// The lowercased document kind of a checkpoint file, if `path` is named
/// like one.
pub fn kind_of(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    let (kind, suffix) = stem.rsplit_once('_')?;
    (!kind.is_empty() && !suffix.is_empty()).then_some(kind)
}

/// Every query key equals the stored value; absent keys read as `null`.
pub fn matches_query(snapshot: &Map<String, Value>, query: &Query) -> bool {
    query
        .iter()
        .all(|(k, v)| snapshot.get(k).unwrap_or(&Value::Null) == v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{query, ExecutionTimes};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Audio {
        path: String,
        transcript: Option<String>,
        #[serde(default)]
        execution_times: ExecutionTimes,
    }

    impl Document for Audio {
        const KIND: &'static str = "AudioDocument";
        const IDENTITY: &'static [&'static str] = &["path"];

        fn execution_times(&self) -> &ExecutionTimes {
            &self.execution_times
        }

        fn execution_times_mut(&mut self) -> &mut ExecutionTimes {
            &mut self.execution_times
        }
    }

    fn audio(path: &str, transcript: Option<&str>) -> Audio {
        Audio {
            path: path.into(),
            transcript: transcript.map(Into::into),
            ..Default::default()
        }
    }

    #[test]
    fn file_name_embeds_lowercase_kind() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.save(&audio("a.mp3", None)).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("pipeline_state_audiodocument_"), "got {name}");
        assert!(name.ends_with(".json"));
        assert_eq!(kind_of(&path), Some("audiodocument"));
    }

    #[test]
    fn saves_are_append_only_and_pretty() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested"));
        let a = store.save(&audio("a.mp3", None)).unwrap();
        let b = store.save(&audio("a.mp3", None)).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.list(None).unwrap().len(), 2);
        let text = fs::read_to_string(&a).unwrap();
        assert!(text.contains("\n  \"transcript\": null"), "got {text}");
    }

    #[test]
    fn latest_picks_newest_match() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let old = store.save(&audio("a.mp3", Some("old"))).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        store.save(&audio("b.mp3", Some("other"))).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let new = store.save(&audio("a.mp3", Some("new"))).unwrap();

        let hit = store
            .latest::<Audio>(&query([("path", "a.mp3")]))
            .unwrap()
            .unwrap();
        assert_eq!(hit.path, new);
        assert_ne!(hit.path, old);
        let doc: Audio = store.load(&hit.path).unwrap();
        assert_eq!(doc.transcript.as_deref(), Some("new"));
    }

    #[test]
    fn no_match_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&audio("a.mp3", None)).unwrap();
        let q = query([("path", "zzz.mp3")]);
        assert!(store.latest::<Audio>(&q).unwrap().is_none());

        let missing = CheckpointStore::new(dir.path().join("never-created"));
        assert!(missing.latest::<Audio>(&q).unwrap().is_none());
    }

    #[test]
    fn absent_key_matches_only_null() {
        let snapshot = Map::new();
        assert!(matches_query(&snapshot, &query([("x", Value::Null)])));
        assert!(!matches_query(&snapshot, &query([("x", "")])));
    }

    #[test]
    fn corrupt_file_fails_fast() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::write(
            dir.path().join("pipeline_state_audiodocument_broken.json"),
            "{ not json",
        )
        .unwrap();
        store.save(&audio("a.mp3", None)).unwrap();
        let err = store
            .latest::<Audio>(&query([("path", "a.mp3")]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::CorruptCheckpoint { .. }), "got {err}");
    }

    #[test]
    fn load_checks_kind_and_existence() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.save(&audio("a.mp3", None)).unwrap();
        let err = store.load_snapshot("video", &path).unwrap_err();
        assert!(matches!(err, PipelineError::CheckpointKindMismatch { .. }));

        let err = store
            .load::<Audio>(Path::new("pipeline_state_audiodocument_gone.json"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::CheckpointNotFound { .. }));
    }

    #[test]
    fn resolve_accepts_bare_file_names() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.save(&audio("a.mp3", None)).unwrap();
        let bare = PathBuf::from(path.file_name().unwrap());
        assert_eq!(store.resolve(&bare).unwrap(), path);
    }

    #[test]
    fn list_ignores_foreign_files_and_filters_kind() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&audio("a.mp3", None)).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("pipeline_state_video_1.json"), "{}").unwrap();
        assert_eq!(store.list(None).unwrap().len(), 2);
        let only_video = store.list(Some("Video")).unwrap();
        assert_eq!(only_video.len(), 1);
        assert_eq!(only_video[0].kind, "video");
    }
}
