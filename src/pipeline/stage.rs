//! Stage declarations and the validated pipeline they form.
//!
//! A [`Stage`] names the document fields it reads and the fields it
//! produces; the function it wraps only ever sees deep copies of its inputs
//! and hands back a [`StageOutput`], which the executor binds to the
//! declared output fields.

use crate::config::RestartPoint;
use crate::document::{Document, DocumentState};
use crate::error::{BoxError, InputError, PipelineError, StageError};
use crate::pipeline::resource::{ResourceDescriptor, ServiceContext};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// What a stage function returns.
pub type StageResult = Result<StageOutput, BoxError>;

type StageFn =
    Arc<dyn Fn(StageInputs, ServiceContext) -> BoxFuture<'static, StageResult> + Send + Sync>;

/// What happens to the run when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log, leave the outputs unset, continue with the next stage.
    #[default]
    Continue,
    /// Stop the run after writing the checkpoint.
    Abort,
}

/// One step of a pipeline.
///
/// ```rust
/// use mobibot_pipeline::{Stage, StageOutput};
///
/// let stage = Stage::sync(|inputs, _| {
///     let text: String = inputs.arg(0)?;
///     Ok(StageOutput::single(text.len()))
/// })
/// .named("count_chars")
/// .inputs(["text"])
/// .outputs(["char_count"]);
///
/// assert_eq!(stage.name(), "count_chars");
/// ```
#[derive(Clone)]
pub struct Stage {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    enabled: bool,
    resources: Vec<ResourceDescriptor>,
    on_failure: FailurePolicy,
    func: StageFn,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("enabled", &self.enabled)
            .field("resources", &self.resources)
            .field("on_failure", &self.on_failure)
            .finish_non_exhaustive()
    }
}

impl Stage {
    /// Wrap an async stage function.
    ///
    /// The stage is named after the function's type path (`translate_model`
    /// for a free `async fn translate_model`); use [`Stage::named`] for
    /// closures.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(StageInputs, ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult> + Send + 'static,
    {
        let name = derive_name::<F>();
        Self::from_fn(name, Arc::new(move |inputs, ctx| func(inputs, ctx).boxed()))
    }

    /// Wrap a blocking-free synchronous stage function.
    pub fn sync<F>(func: F) -> Self
    where
        F: Fn(StageInputs, &ServiceContext) -> StageResult + Send + Sync + 'static,
    {
        let name = derive_name::<F>();
        let func = Arc::new(func);
        Self::from_fn(
            name,
            Arc::new(move |inputs, ctx| {
                let func = Arc::clone(&func);
                async move { func(inputs, &ctx) }.boxed()
            }),
        )
    }

    /// A stage that copies one field into another unchanged.
    pub fn copy_of(input: &str, output: &str) -> Self {
        Self::sync(|inputs, _| Ok(StageOutput::tuple(inputs.into_values())))
            .named(format!("copy_{input}_to_{output}"))
            .inputs([input])
            .outputs([output])
    }

    fn from_fn(name: String, func: StageFn) -> Self {
        Self {
            name,
            inputs: Vec::new(),
            outputs: Vec::new(),
            enabled: true,
            resources: Vec::new(),
            on_failure: FailurePolicy::Continue,
            func,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Fields passed to the function, in order.
    pub fn inputs<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Fields the function's results are bound to, in order.
    pub fn outputs<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Include the stage in runs. Disabled stages are neither executed nor
    /// skipped; they do not take part in the run at all.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Add a service acquired around each call, after the ones added before.
    pub fn resource(mut self, resource: ResourceDescriptor) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn resources<I>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = ResourceDescriptor>,
    {
        self.resources.extend(resources);
        self
    }

    /// Abort the run if this stage fails.
    pub fn critical(self) -> Self {
        self.on_failure(FailurePolicy::Abort)
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_fields(&self) -> &[String] {
        &self.inputs
    }

    pub fn output_fields(&self) -> &[String] {
        &self.outputs
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn resource_list(&self) -> &[ResourceDescriptor] {
        &self.resources
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.on_failure
    }

    /// `true` when the stage's work is already present in `state`.
    ///
    /// Any one non-null output counts; a stage without outputs always runs.
    pub fn is_satisfied(&self, state: &DocumentState) -> bool {
        self.outputs.iter().any(|f| state.is_set(f))
    }

    /// Deep copies of the declared inputs, in declaration order.
    pub(crate) fn gather(&self, state: &DocumentState) -> StageInputs {
        StageInputs::new(
            self.inputs
                .iter()
                .map(|f| (f.clone(), state.value(f).cloned().unwrap_or(Value::Null)))
                .collect(),
        )
    }

    pub(crate) fn invoke(
        &self,
        inputs: StageInputs,
        ctx: ServiceContext,
    ) -> BoxFuture<'static, StageResult> {
        (self.func)(inputs, ctx)
    }

    /// Pair each returned value with its declared output field.
    pub(crate) fn bind(&self, output: StageOutput) -> Result<Vec<(String, Value)>, StageError> {
        match output {
            StageOutput::Positional(values) => {
                if values.len() != self.outputs.len() {
                    return Err(StageError::OutputArity {
                        stage: self.name.clone(),
                        declared: self.outputs.len(),
                        returned: values.len(),
                    });
                }
                Ok(self.outputs.iter().cloned().zip(values).collect())
            }
            StageOutput::Named(mut map) => {
                let mut bound = Vec::with_capacity(self.outputs.len());
                for field in &self.outputs {
                    match map.remove(field) {
                        Some(v) => bound.push((field.clone(), v)),
                        None => {
                            return Err(StageError::MissingOutput {
                                stage: self.name.clone(),
                                field: field.clone(),
                            })
                        }
                    }
                }
                if let Some(extra) = map.keys().next() {
                    return Err(StageError::UnexpectedOutput {
                        stage: self.name.clone(),
                        field: extra.clone(),
                    });
                }
                Ok(bound)
            }
        }
    }
}

/// Name a stage after its function's type path.
fn derive_name<F>() -> String {
    let full = std::any::type_name::<F>();
    let path = match full.find('<') {
        Some(0) | None => full,
        Some(i) => &full[..i],
    };
    let segments: Vec<&str> = path.split("::").collect();
    match segments.iter().rposition(|s| !s.starts_with("{{")) {
        Some(i) if i + 1 < segments.len() => format!("{}_closure", segments[i]),
        Some(i) => segments[i].to_string(),
        None => "stage".to_string(),
    }
}

/// Owned copies of a stage's declared inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageInputs {
    fields: Vec<(String, Value)>,
}

impl StageInputs {
    pub fn new(fields: Vec<(String, Value)>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.fields.get(index).map(|(_, v)| v)
    }

    /// Decode the input at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, InputError> {
        let (field, value) = self.fields.get(index).ok_or(InputError::OutOfRange {
            index,
            len: self.fields.len(),
        })?;
        decode(field, value)
    }

    /// Decode the input bound to `field`.
    pub fn get<T: DeserializeOwned>(&self, field: &str) -> Result<T, InputError> {
        let (field, value) = self
            .fields
            .iter()
            .find(|(f, _)| f == field)
            .ok_or_else(|| InputError::Undeclared {
                field: field.to_string(),
            })?;
        decode(field, value)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.fields.into_iter().map(|(_, v)| v).collect()
    }

    /// One line per argument, each value cut to `max_chars` characters.
    pub fn preview(&self, max_chars: usize) -> String {
        self.fields
            .iter()
            .enumerate()
            .map(|(i, (field, value))| {
                let text = value.to_string();
                match text.char_indices().nth(max_chars) {
                    Some((cut, _)) => format!("arg {i} ({field}): {}…", &text[..cut]),
                    None => format!("arg {i} ({field}): {text}"),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn decode<T: DeserializeOwned>(field: &str, value: &Value) -> Result<T, InputError> {
    serde_json::from_value(value.clone()).map_err(|source| InputError::Decode {
        field: field.to_string(),
        source,
    })
}

/// Values returned by a stage function.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// One value per declared output, in declaration order.
    Positional(Vec<Value>),
    /// Values keyed by output field name; must name every declared output
    /// and nothing else.
    Named(Map<String, Value>),
}

impl StageOutput {
    /// The result of a stage with exactly one output.
    pub fn single(value: impl Into<Value>) -> Self {
        StageOutput::Positional(vec![value.into()])
    }

    pub fn tuple<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        StageOutput::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        StageOutput::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// A single output serialised from any serde value.
    pub fn serialized<T: serde::Serialize>(value: &T) -> Result<Self, BoxError> {
        Ok(Self::single(serde_json::to_value(value)?))
    }

    /// A stage without outputs.
    pub fn none() -> Self {
        StageOutput::Positional(Vec::new())
    }
}

/// An ordered, validated list of stages over document type `D`.
pub struct Pipeline<D> {
    stages: Vec<Stage>,
    _document: PhantomData<fn() -> D>,
}

impl<D> Clone for Pipeline<D> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
            _document: PhantomData,
        }
    }
}

impl<D> fmt::Debug for Pipeline<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("stages", &self.stages).finish()
    }
}

impl<D: Document> Pipeline<D> {
    /// Check every stage against `D` and build the pipeline.
    ///
    /// Fails when a stage reads or writes a field `D` does not have, lists
    /// an output twice, writes an identity field or a field that is already
    /// set on `D::default()`, or when an identity field of `D` does not exist.
    /// Disabled stages are checked too.
    pub fn new<I>(stages: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = Stage>,
    {
        let schema = DocumentState::schema::<D>()?;
        for field in D::IDENTITY {
            if !schema.has_field(field) {
                return Err(PipelineError::UnknownIdentityField {
                    field: field.to_string(),
                    kind: D::KIND.to_string(),
                });
            }
        }

        let stages: Vec<Stage> = stages.into_iter().collect();
        for stage in &stages {
            for field in stage.inputs.iter().chain(&stage.outputs) {
                if !schema.has_field(field) {
                    return Err(PipelineError::UnknownField {
                        stage: stage.name.clone(),
                        field: field.clone(),
                        kind: D::KIND.to_string(),
                    });
                }
            }
            let mut seen = HashSet::new();
            for field in &stage.outputs {
                let reserved = if D::IDENTITY.contains(&field.as_str()) {
                    Some("identity fields are fixed for the job")
                } else if schema.is_set(field) {
                    Some("the field is never unset, so the stage would always be skipped")
                } else {
                    None
                };
                if let Some(reason) = reserved {
                    return Err(PipelineError::ReservedOutput {
                        stage: stage.name.clone(),
                        field: field.clone(),
                        reason,
                    });
                }
                if !seen.insert(field.as_str()) {
                    return Err(PipelineError::DuplicateOutput {
                        stage: stage.name.clone(),
                        field: field.clone(),
                    });
                }
            }
        }

        Ok(Self {
            stages,
            _document: PhantomData,
        })
    }

    /// Every declared stage, enabled or not.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Enabled stages in declaration order.
    pub fn active(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(|s| s.enabled)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Index into [`Pipeline::stages`] from which outputs are cleared.
    ///
    /// `None` means nothing is cleared. Disabled stages count: restarting
    /// from a disabled stage clears its outputs and everything after it.
    pub fn restart_index(&self, point: &RestartPoint) -> Result<Option<usize>, PipelineError> {
        match point {
            RestartPoint::Beginning => Ok(Some(0)),
            RestartPoint::Resume => Ok(None),
            RestartPoint::Stage(name) => self
                .stages
                .iter()
                .position(|s| &s.name == name)
                .map(Some)
                .ok_or_else(|| PipelineError::UnknownStage {
                    name: name.clone(),
                    known: self.stage_names(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ExecutionTimes;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Clip {
        url: String,
        audio: Option<String>,
        video: Option<String>,
        transcript: Option<String>,
        #[serde(default)]
        execution_times: ExecutionTimes,
    }

    impl Document for Clip {
        const KIND: &'static str = "Clip";
        const IDENTITY: &'static [&'static str] = &["url"];

        fn execution_times(&self) -> &ExecutionTimes {
            &self.execution_times
        }

        fn execution_times_mut(&mut self) -> &mut ExecutionTimes {
            &mut self.execution_times
        }
    }

    fn split_video(_: StageInputs, _: &ServiceContext) -> StageResult {
        Ok(StageOutput::tuple(["a.wav", "v.mp4"]))
    }

    fn split() -> Stage {
        Stage::sync(split_video)
            .inputs(["url"])
            .outputs(["audio", "video"])
    }

    #[test]
    fn name_comes_from_function() {
        assert_eq!(split().name(), "split_video");
    }

    #[test]
    fn closure_names_are_distinguishable() {
        let s = Stage::sync(|_, _| Ok(StageOutput::none()));
        assert!(s.name().ends_with("_closure"), "got {}", s.name());
    }

    #[test]
    fn positional_bind_checks_arity() {
        let stage = split();
        let err = stage
            .bind(StageOutput::tuple(["a", "b", "c"]))
            .unwrap_err();
        assert_eq!(
            err,
            StageError::OutputArity {
                stage: "split_video".into(),
                declared: 2,
                returned: 3
            }
        );
        let ok = stage.bind(StageOutput::tuple(["a", "b"])).unwrap();
        assert_eq!(ok[1], ("video".to_string(), json!("b")));
    }

    #[test]
    fn named_bind_requires_exact_fields() {
        let stage = split();
        let missing = stage
            .bind(StageOutput::named([("audio", "a")]))
            .unwrap_err();
        assert!(matches!(missing, StageError::MissingOutput { ref field, .. } if field == "video"));

        let extra = stage
            .bind(StageOutput::named([("audio", "a"), ("video", "v"), ("x", "y")]))
            .unwrap_err();
        assert!(matches!(extra, StageError::UnexpectedOutput { ref field, .. } if field == "x"));

        let ok = stage
            .bind(StageOutput::named([("video", "v"), ("audio", "a")]))
            .unwrap();
        assert_eq!(ok[0].0, "audio");
    }

    #[test]
    fn pipeline_rejects_unknown_fields() {
        let bad = Stage::copy_of("transcript", "subtitles");
        let err = Pipeline::<Clip>::new([split(), bad]).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownField { ref field, .. } if field == "subtitles"));
    }

    #[test]
    fn pipeline_rejects_duplicate_outputs() {
        let dup = Stage::sync(split_video)
            .inputs(["url"])
            .outputs(["audio", "audio"]);
        let err = Pipeline::<Clip>::new([dup]).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateOutput { .. }));
    }

    #[test]
    fn pipeline_rejects_outputs_that_are_never_unset() {
        let timings = Stage::sync(|_, _| Ok(StageOutput::single(json!({}))))
            .named("stamp")
            .outputs(["execution_times"]);
        let err = Pipeline::<Clip>::new([timings]).unwrap_err();
        assert!(
            matches!(err, PipelineError::ReservedOutput { ref field, .. } if field == "execution_times"),
            "got {err}"
        );

        let rename = Stage::copy_of("audio", "url");
        let err = Pipeline::<Clip>::new([rename]).unwrap_err();
        assert!(matches!(err, PipelineError::ReservedOutput { ref field, .. } if field == "url"));

        // Reading them is fine.
        assert!(Pipeline::<Clip>::new([Stage::copy_of("url", "audio")]).is_ok());
    }

    #[test]
    fn satisfied_when_any_output_set() {
        let stage = split();
        let mut state = DocumentState::schema::<Clip>().unwrap();
        assert!(!stage.is_satisfied(&state));
        state.set("video", json!("v.mp4"));
        assert!(stage.is_satisfied(&state));

        let no_outputs = Stage::sync(|_, _| Ok(StageOutput::none())).named("notify");
        assert!(!no_outputs.is_satisfied(&state));
    }

    #[test]
    fn restart_index_covers_disabled_and_unknown() {
        let pipeline = Pipeline::<Clip>::new([
            split(),
            Stage::copy_of("audio", "transcript").enabled(false),
        ])
        .unwrap();
        assert_eq!(
            pipeline.restart_index(&RestartPoint::stage("copy_audio_to_transcript")).unwrap(),
            Some(1)
        );
        assert_eq!(pipeline.restart_index(&RestartPoint::Resume).unwrap(), None);
        assert_eq!(pipeline.active().count(), 1);
        let err = pipeline
            .restart_index(&RestartPoint::stage("transcribe"))
            .unwrap_err();
        assert!(err.to_string().contains("split_video"));
    }

    #[test]
    fn inputs_decode_by_index_and_name() {
        let inputs = StageInputs::new(vec![
            ("url".into(), json!("https://x/y")),
            ("audio".into(), Value::Null),
        ]);
        assert_eq!(inputs.arg::<String>(0).unwrap(), "https://x/y");
        assert_eq!(inputs.get::<Option<String>>("audio").unwrap(), None);
        assert!(matches!(inputs.arg::<String>(5), Err(InputError::OutOfRange { index: 5, len: 2 })));
        assert!(matches!(inputs.get::<u8>("nope"), Err(InputError::Undeclared { .. })));
        assert!(matches!(inputs.arg::<u8>(0), Err(InputError::Decode { .. })));
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let inputs = StageInputs::new(vec![("text".into(), json!("héllo wörld"))]);
        let p = inputs.preview(4);
        assert_eq!(p, "arg 0 (text): \"hél…");
    }

    #[tokio::test]
    async fn copy_of_passes_value_through() {
        let stage = Stage::copy_of("audio", "transcript");
        let inputs = StageInputs::new(vec![("audio".into(), json!({"k": [1, 2]}))]);
        let out = stage.invoke(inputs, ServiceContext::default()).await.unwrap();
        assert_eq!(out, StageOutput::single(json!({"k": [1, 2]})));
    }
}
