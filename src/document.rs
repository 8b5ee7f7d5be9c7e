//! The typed record threaded through a pipeline run.
//!
//! A [`Document`] is an ordinary serde struct whose job fields are
//! `Option<T>`: `None` means "not computed yet", any `Some` value (even an
//! empty string or list) means the producing stage has run. The executor
//! never touches the struct directly; it works on the document's JSON field
//! map ([`DocumentState`]) so stages can be declared by field name, and
//! re-validates that map against the struct after every binding.

use crate::error::PipelineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Field name → expected value, used to find prior runs of the same job.
///
/// Matching is exact JSON equality per key; a key absent from a stored
/// snapshot matches only `null`.
pub type Query = Map<String, Value>;

/// Build a [`Query`] from `(field, value)` pairs.
pub fn query<I, K, V>(pairs: I) -> Query
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Wall-clock seconds per stage name, kept on the document for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionTimes(BTreeMap<String, f64>);

impl ExecutionTimes {
    pub fn record(&mut self, stage: impl Into<String>, seconds: f64) {
        self.0.insert(stage.into(), seconds);
    }

    pub fn get(&self, stage: &str) -> Option<f64> {
        self.0.get(stage).copied()
    }

    /// Forget the timing of `stage`, returning it if one was recorded.
    pub fn remove(&mut self, stage: &str) -> Option<f64> {
        self.0.remove(stage)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Stage timings, slowest first.
    pub fn slowest_first(&self) -> Vec<(&str, f64)> {
        let mut all: Vec<_> = self.iter().collect();
        all.sort_by(|a, b| b.1.total_cmp(&a.1));
        all
    }
}

impl Extend<(String, f64)> for ExecutionTimes {
    fn extend<T: IntoIterator<Item = (String, f64)>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

/// A job record that pipelines read from and write to by field name.
///
/// # Requirements
/// * Every field must serialise, including `None` as `null` — do not use
///   `skip_serializing_if` on job fields, the engine discovers the field set
///   from the serialised [`Default`] value.
/// * `Default` must produce a value where every job field is `None`.
///
/// # Example
/// ```rust
/// use mobibot_pipeline::{Document, ExecutionTimes};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct Article {
///     url: String,
///     html: Option<String>,
///     title: Option<String>,
///     #[serde(default)]
///     execution_times: ExecutionTimes,
/// }
///
/// impl Document for Article {
///     const KIND: &'static str = "Article";
///     const IDENTITY: &'static [&'static str] = &["url"];
///
///     fn execution_times(&self) -> &ExecutionTimes { &self.execution_times }
///     fn execution_times_mut(&mut self) -> &mut ExecutionTimes { &mut self.execution_times }
/// }
/// ```
pub trait Document: Serialize + DeserializeOwned + Default + Send + 'static {
    /// Type tag embedded (lowercased) in checkpoint file names.
    const KIND: &'static str;

    /// Fields forming the identity key used to find prior checkpoints.
    const IDENTITY: &'static [&'static str];

    fn execution_times(&self) -> &ExecutionTimes;

    fn execution_times_mut(&mut self) -> &mut ExecutionTimes;

    /// The identity key of this document as a checkpoint [`Query`].
    fn identity(&self) -> Result<Query, PipelineError> {
        let state = DocumentState::capture(self)?;
        Ok(Self::IDENTITY
            .iter()
            .map(|f| (f.to_string(), state.value(f).cloned().unwrap_or(Value::Null)))
            .collect())
    }
}

/// Lowercased kind tag of `D`, as used in checkpoint file names.
pub fn kind_tag<D: Document>() -> String {
    D::KIND.to_lowercase()
}

/// A document held as its JSON field map while stages run.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentState {
    fields: Map<String, Value>,
}

impl DocumentState {
    /// Snapshot a document into its field map.
    pub fn capture<D: Document>(doc: &D) -> Result<Self, PipelineError> {
        match serde_json::to_value(doc).map_err(PipelineError::Snapshot)? {
            Value::Object(fields) => Ok(Self { fields }),
            _ => Err(PipelineError::NotARecord {
                kind: D::KIND.to_string(),
            }),
        }
    }

    /// The field map of `D::default()`: every field the document declares.
    pub fn schema<D: Document>() -> Result<Self, PipelineError> {
        Self::capture(&D::default())
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// `true` when the field exists and holds a non-null value.
    pub fn is_set(&self, field: &str) -> bool {
        matches!(self.fields.get(field), Some(v) if !v.is_null())
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Reset a field to "not computed".
    pub fn clear(&mut self, field: &str) {
        self.fields.insert(field.to_string(), Value::Null);
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Check that the current map still deserialises into `D`.
    pub fn validate<D: Document>(&self) -> Result<(), serde_json::Error> {
        D::deserialize(Value::Object(self.fields.clone())).map(drop)
    }

    /// Deserialise back into the typed document.
    pub fn into_document<D: Document>(self) -> Result<D, PipelineError> {
        serde_json::from_value(Value::Object(self.fields)).map_err(PipelineError::Snapshot)
    }

    /// Rebuild a document from a stored snapshot without failing on drift.
    ///
    /// Keys the document type no longer declares are ignored, and a field
    /// whose stored value no longer fits its type is left at its default
    /// (`None` for job fields), so the stage producing it simply runs again.
    pub fn restore_tolerant<D: Document>(snapshot: Map<String, Value>) -> Result<D, PipelineError> {
        let mut base = Self::schema::<D>()?.fields;
        for (field, value) in snapshot {
            if !base.contains_key(&field) {
                warn!(kind = D::KIND, field = %field, "ignoring field unknown to document type");
                continue;
            }
            let mut trial = base.clone();
            trial.insert(field.clone(), value.clone());
            if D::deserialize(Value::Object(trial)).is_ok() {
                base.insert(field, value);
            } else {
                warn!(kind = D::KIND, field = %field, "discarding checkpoint value with mismatched type");
            }
        }
        Self { fields: base }.into_document()
    }
}
