//! Activity implementations and the registries that expose them to workers.

use crate::backend::{ComputationBackend, MoleculeLookup};
use crate::types::{
    FetchModel, InferenceJob, LookupRequest, ModelDescriptor, PersistRequest, PromptSource,
};
use crystalflow_core::{ActivityError, ActivityRegistry, JsonCodec, WorkflowError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

pub const GET_OR_DOWNLOAD_MODEL: &str = "get_or_download_model";
pub const RESOLVE_PROMPT_INPUT: &str = "resolve_prompt_input";
pub const RUN_INFERENCE: &str = "run_inference";
pub const PERSIST_RESULTS: &str = "persist_results";
pub const RUN_LOOKUP_QUERY: &str = "run_lookup_query";

/// Activities of the inference workflow.
pub struct InferenceActivities {
    backend: Arc<dyn ComputationBackend>,
    model_root: PathBuf,
    output_root: PathBuf,
}

impl InferenceActivities {
    pub fn new(
        backend: Arc<dyn ComputationBackend>,
        model_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            model_root: model_root.into(),
            output_root: output_root.into(),
        }
    }

    fn resolve_model_path(&self, model_path: &str) -> PathBuf {
        let path = Path::new(model_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.model_root.join(path)
        }
    }

    /// Return the local checkpoint, downloading it first if it is absent.
    pub async fn get_or_download_model(
        &self,
        request: FetchModel,
    ) -> Result<ModelDescriptor, ActivityError> {
        let path = self.resolve_model_path(&request.model_path);

        if let Ok(metadata) = fs::metadata(&path).await {
            if metadata.is_file() {
                tracing::debug!(path = %path.display(), "Model found locally");
                return Ok(ModelDescriptor {
                    model_path: path.display().to_string(),
                    model_url: request.model_url,
                    size_bytes: metadata.len(),
                });
            }
        }

        let Some(url) = request.model_url.as_deref() else {
            return Err(ActivityError::NotFound(format!(
                "model '{}' is not present and no model_url was given",
                path.display()
            )));
        };

        tracing::info!(path = %path.display(), url = %url, "Downloading model");
        let size_bytes = self.backend.download(url, &path).await?;
        Ok(ModelDescriptor {
            model_path: path.display().to_string(),
            model_url: request.model_url,
            size_bytes,
        })
    }

    /// Pick the prompt: `raw_input` if non-empty, otherwise the content of
    /// `input_file`.
    pub async fn resolve_prompt_input(&self, source: PromptSource) -> Result<String, ActivityError> {
        if let Some(raw) = source.raw_input.filter(|raw| !raw.trim().is_empty()) {
            return Ok(raw);
        }

        if let Some(input_file) = source.input_file.filter(|f| !f.is_empty()) {
            let content = fs::read_to_string(&input_file).await.map_err(|e| {
                ActivityError::NotFound(format!("cannot read input file '{}': {}", input_file, e))
            })?;
            if !content.trim().is_empty() {
                return Ok(content);
            }
        }

        Err(ActivityError::Validation("Input data cannot be empty.".into()))
    }

    pub async fn run_inference(&self, job: InferenceJob) -> Result<Vec<String>, ActivityError> {
        job.params.validate()?;

        let expected = job.params.num_samples as usize;
        let samples = self.backend.evaluate(&job).await?;
        if samples.len() != expected {
            return Err(ActivityError::Computation(format!(
                "expected {} samples, backend produced {}",
                expected,
                samples.len()
            )));
        }

        tracing::info!(
            model = %job.model.model_path,
            samples = samples.len(),
            seed = job.params.seed,
            "Inference finished"
        );
        Ok(samples)
    }

    /// Write samples to `<output_root>/<run_id>/` when requested.
    pub async fn persist_results(&self, request: PersistRequest) -> Result<(), ActivityError> {
        if !request.generate_cif {
            return Ok(());
        }

        let directory = self.output_root.join(&request.run_id);
        let written = self.backend.persist(&directory, &request.samples).await?;
        tracing::info!(
            run_id = %request.run_id,
            directory = %directory.display(),
            files = written.len(),
            "Samples persisted"
        );
        Ok(())
    }

    /// Registry with all four inference activities.
    pub fn registry(
        self: Arc<Self>,
        codec: Arc<JsonCodec>,
    ) -> Result<ActivityRegistry, WorkflowError> {
        let fetch = Arc::clone(&self);
        let prompt = Arc::clone(&self);
        let infer = Arc::clone(&self);
        let persist = self;

        ActivityRegistry::with_codec(codec)
            .register_fn(GET_OR_DOWNLOAD_MODEL, move |request: FetchModel| {
                let this = Arc::clone(&fetch);
                async move { this.get_or_download_model(request).await }
            })
            .register_fn(RESOLVE_PROMPT_INPUT, move |source: PromptSource| {
                let this = Arc::clone(&prompt);
                async move { this.resolve_prompt_input(source).await }
            })
            .register_fn(RUN_INFERENCE, move |job: InferenceJob| {
                let this = Arc::clone(&infer);
                async move { this.run_inference(job).await }
            })
            .register_fn(PERSIST_RESULTS, move |request: PersistRequest| {
                let this = Arc::clone(&persist);
                async move { this.persist_results(request).await }
            })
            .build()
    }
}

/// Activity of the lookup workflow.
pub struct LookupActivities {
    lookup: Arc<dyn MoleculeLookup>,
}

impl LookupActivities {
    pub fn new(lookup: Arc<dyn MoleculeLookup>) -> Self {
        Self { lookup }
    }

    pub async fn run_lookup_query(&self, request: LookupRequest) -> Result<String, ActivityError> {
        if request.molecule_name.trim().is_empty() {
            return Err(ActivityError::Validation(
                "molecule_name cannot be empty".into(),
            ));
        }
        self.lookup.lookup(&request.molecule_name).await
    }

    pub fn registry(
        self: Arc<Self>,
        codec: Arc<JsonCodec>,
    ) -> Result<ActivityRegistry, WorkflowError> {
        ActivityRegistry::with_codec(codec)
            .register_fn(RUN_LOOKUP_QUERY, move |request: LookupRequest| {
                let this = Arc::clone(&self);
                async move { this.run_lookup_query(request).await }
            })
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ReferenceBackend, SimulatedPubChem};
    use crate::types::GenerationParams;
    use async_trait::async_trait;
    use std::time::Duration;

    fn activities(root: &Path) -> InferenceActivities {
        InferenceActivities::new(Arc::new(ReferenceBackend::new()), root, root.join("out"))
    }

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor {
            model_path: "ckpt.pt".into(),
            model_url: None,
            size_bytes: 1,
        }
    }

    #[tokio::test]
    async fn raw_input_wins_over_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = activities(dir.path())
            .resolve_prompt_input(PromptSource {
                raw_input: Some("Ca Ti O3".into()),
                input_file: Some("/does/not/exist".into()),
            })
            .await
            .unwrap();
        assert_eq!(prompt, "Ca Ti O3");
    }

    #[tokio::test]
    async fn empty_raw_input_falls_back_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("prompt.txt");
        std::fs::write(&file, "data_NaCl\n").unwrap();

        let prompt = activities(dir.path())
            .resolve_prompt_input(PromptSource {
                raw_input: Some(String::new()),
                input_file: Some(file.display().to_string()),
            })
            .await
            .unwrap();
        assert_eq!(prompt, "data_NaCl\n");
    }

    #[tokio::test]
    async fn missing_prompt_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = activities(dir.path())
            .resolve_prompt_input(PromptSource {
                raw_input: None,
                input_file: Some(dir.path().join("nope.txt").display().to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::NotFound(_)));
    }

    #[tokio::test]
    async fn no_prompt_at_all_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = activities(dir.path())
            .resolve_prompt_input(PromptSource {
                raw_input: None,
                input_file: None,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ActivityError::Validation("Input data cannot be empty.".into())
        );
    }

    #[tokio::test]
    async fn inference_rejects_bad_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let err = activities(dir.path())
            .run_inference(InferenceJob {
                model: descriptor(),
                prompt: "Ca Ti O3".into(),
                params: GenerationParams {
                    temperature: -1.0,
                    ..Default::default()
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::Validation(_)));
    }

    struct ShortBackend;

    #[async_trait]
    impl ComputationBackend for ShortBackend {
        async fn download(&self, _: &str, _: &Path) -> Result<u64, ActivityError> {
            Ok(0)
        }

        async fn evaluate(&self, _: &InferenceJob) -> Result<Vec<String>, ActivityError> {
            Ok(vec!["only one".into()])
        }

        async fn persist(&self, _: &Path, _: &[String]) -> Result<Vec<PathBuf>, ActivityError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn wrong_sample_count_is_a_computation_error() {
        let activities = InferenceActivities::new(Arc::new(ShortBackend), ".", ".");
        let err = activities
            .run_inference(InferenceJob {
                model: descriptor(),
                prompt: "Ca Ti O3".into(),
                params: GenerationParams::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::Computation(_)));
    }

    #[tokio::test]
    async fn persistence_is_skipped_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        activities(dir.path())
            .persist_results(PersistRequest {
                run_id: "run-1".into(),
                samples: vec!["a".into()],
                generate_cif: false,
            })
            .await
            .unwrap();
        assert!(!dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn persistence_writes_under_the_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        activities(dir.path())
            .persist_results(PersistRequest {
                run_id: "run-1".into(),
                samples: vec!["a".into(), "b".into()],
                generate_cif: true,
            })
            .await
            .unwrap();

        let run_dir = dir.path().join("out").join("run-1");
        assert_eq!(std::fs::read_to_string(run_dir.join("sample_1.cif")).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(run_dir.join("sample_2.cif")).unwrap(), "b");
    }

    #[tokio::test]
    async fn lookup_rejects_blank_names() {
        let activities = LookupActivities::new(Arc::new(SimulatedPubChem::new(Duration::ZERO)));
        let err = activities
            .run_lookup_query(LookupRequest {
                molecule_name: "  ".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::Validation(_)));
    }

    #[test]
    fn registries_expose_every_activity() {
        let inference = Arc::new(activities(Path::new(".")))
            .registry(Arc::new(JsonCodec))
            .unwrap();
        for name in [GET_OR_DOWNLOAD_MODEL, RESOLVE_PROMPT_INPUT, RUN_INFERENCE, PERSIST_RESULTS] {
            assert!(inference.contains(name), "{name} missing");
        }

        let lookup = Arc::new(LookupActivities::new(Arc::new(SimulatedPubChem::default())))
            .registry(Arc::new(JsonCodec))
            .unwrap();
        assert_eq!(lookup.names().collect::<Vec<_>>(), vec![RUN_LOOKUP_QUERY]);
    }
}
