//! Capability traits behind the opaque units of work, and their reference
//! implementations.
//!
//! Activities depend only on [`ComputationBackend`] and [`MoleculeLookup`];
//! a deployment with a real sampler or a real PubChem client swaps the
//! implementation without touching workflow code.

use crate::types::InferenceJob;
use async_trait::async_trait;
use crystalflow_core::ActivityError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Transfer, evaluation and storage for the inference workflow.
#[async_trait]
pub trait ComputationBackend: Send + Sync {
    /// Stream `url` to `destination` and return the number of bytes written.
    ///
    /// On error, or when the returned future is dropped before it
    /// finishes, nothing is left at `destination` or next to it.
    async fn download(&self, url: &str, destination: &Path) -> Result<u64, ActivityError>;

    /// Produce exactly `job.params.num_samples` samples.
    async fn evaluate(&self, job: &InferenceJob) -> Result<Vec<String>, ActivityError>;

    /// Write `samples` as `sample_<k>.cif` under `directory`.
    async fn persist(
        &self,
        directory: &Path,
        samples: &[String],
    ) -> Result<Vec<PathBuf>, ActivityError>;
}

/// Source of molecule information for the lookup workflow.
#[async_trait]
pub trait MoleculeLookup: Send + Sync {
    async fn lookup(&self, molecule_name: &str) -> Result<String, ActivityError>;
}

/// Downloads over HTTP, samples deterministically from the seed and writes
/// plain files.
#[derive(Debug, Clone, Default)]
pub struct ReferenceBackend {
    client: reqwest::Client,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn stream_to(
        &self,
        mut response: reqwest::Response,
        part: &NamedTempFile,
    ) -> Result<u64, ActivityError> {
        let handle = part
            .as_file()
            .try_clone()
            .map_err(|e| ActivityError::Download(format!("cannot open download file: {}", e)))?;
        let mut file = fs::File::from_std(handle);
        let mut written = 0u64;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ActivityError::Download(format!("transfer interrupted: {}", e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| ActivityError::Download(format!("write failed: {}", e)))?;
            written += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| ActivityError::Download(format!("write failed: {}", e)))?;
        Ok(written)
    }
}

/// Prefix of the in-progress files of downloads into `destination`.
///
/// Every attempt writes its own `<prefix><random>.part` next to the
/// destination; the file is removed when the attempt fails or is dropped.
pub fn part_prefix(destination: &Path) -> String {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(".{}.", name)
}

#[async_trait]
impl ComputationBackend for ReferenceBackend {
    async fn download(&self, url: &str, destination: &Path) -> Result<u64, ActivityError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ActivityError::Download(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ActivityError::Download(format!(
                "{} answered with status {}",
                url, status
            )));
        }

        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(parent).await.map_err(|e| {
            ActivityError::Download(format!("cannot create {}: {}", parent.display(), e))
        })?;

        let part = tempfile::Builder::new()
            .prefix(&part_prefix(destination))
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|e| {
                ActivityError::Download(format!(
                    "cannot create a file in {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        let written = self.stream_to(response, &part).await?;

        part.persist(destination).map_err(|e| {
            ActivityError::Download(format!(
                "cannot move download into {}: {}",
                destination.display(),
                e.error
            ))
        })?;

        tracing::info!(url = %url, path = %destination.display(), bytes = written, "Model downloaded");
        Ok(written)
    }

    async fn evaluate(&self, job: &InferenceJob) -> Result<Vec<String>, ActivityError> {
        let job = job.clone();
        tokio::task::spawn_blocking(move || sample_structures(&job))
            .await
            .map_err(|e| ActivityError::Computation(format!("sampler task failed: {}", e)))
    }

    async fn persist(
        &self,
        directory: &Path,
        samples: &[String],
    ) -> Result<Vec<PathBuf>, ActivityError> {
        fs::create_dir_all(directory).await.map_err(|e| {
            ActivityError::Persistence(format!("cannot create {}: {}", directory.display(), e))
        })?;

        let mut written = Vec::with_capacity(samples.len());
        for (index, sample) in samples.iter().enumerate() {
            let path = directory.join(format!("sample_{}.cif", index + 1));
            fs::write(&path, sample).await.map_err(|e| {
                ActivityError::Persistence(format!("cannot write {}: {}", path.display(), e))
            })?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Formula of a prompt: either the `data_` header of a CIF prompt or the
/// composition with whitespace removed.
fn formula_of(prompt: &str) -> String {
    let first = prompt.lines().next().unwrap_or_default().trim();
    match first.strip_prefix("data_") {
        Some(formula) => formula.trim().to_string(),
        None => first.split_whitespace().collect(),
    }
}

/// Deterministic stand-in for the sampler: the same job always yields the
/// same samples.
fn sample_structures(job: &InferenceJob) -> Vec<String> {
    let params = &job.params;
    let formula = formula_of(&job.prompt);
    let spread = params.temperature.min(4.0) * 0.5;
    let candidates = (params.top_k as usize).clamp(1, SPACE_GROUPS.len());
    let mut rng = StdRng::seed_from_u64(params.seed);

    (0..params.num_samples)
        .map(|_| {
            let a = 3.0 + rng.random_range(0.0..spread + 1e-3) * 4.0;
            let b = 3.0 + rng.random_range(0.0..spread + 1e-3) * 4.0;
            let c = 3.0 + rng.random_range(0.0..spread + 1e-3) * 4.0;
            let group = SPACE_GROUPS[rng.random_range(0..candidates)];
            let sample = format!(
                "data_{formula}\n\
                 _symmetry_space_group_name_H-M   {group}\n\
                 _cell_length_a   {a:.4}\n\
                 _cell_length_b   {b:.4}\n\
                 _cell_length_c   {c:.4}\n\
                 _cell_angle_alpha   90.0000\n\
                 _cell_angle_beta   90.0000\n\
                 _cell_angle_gamma   90.0000\n\
                 _chemical_formula_sum   '{formula}'\n"
            );
            truncate_tokens(sample, params.max_new_tokens as usize)
        })
        .collect()
}

const SPACE_GROUPS: [&str; 10] = [
    "P1", "P-1", "P2_1/c", "C2/m", "Pnma", "P4/mmm", "I4/mcm", "R-3m", "P6_3/mmc", "Pm-3m",
];

fn truncate_tokens(sample: String, max_tokens: usize) -> String {
    match sample.char_indices().nth(max_tokens) {
        Some((end, _)) => sample[..end].to_string(),
        None => sample,
    }
}

/// Lookup source that answers after a fixed delay.
#[derive(Debug, Clone)]
pub struct SimulatedPubChem {
    latency: Duration,
}

impl SimulatedPubChem {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Default for SimulatedPubChem {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl MoleculeLookup for SimulatedPubChem {
    async fn lookup(&self, molecule_name: &str) -> Result<String, ActivityError> {
        tokio::time::sleep(self.latency).await;
        Ok(format!("molecule name: {}", molecule_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GenerationParams, ModelDescriptor};

    fn job(prompt: &str, params: GenerationParams) -> InferenceJob {
        InferenceJob {
            model: ModelDescriptor {
                model_path: "models/x/ckpt.pt".into(),
                model_url: None,
                size_bytes: 4,
            },
            prompt: prompt.into(),
            params,
        }
    }

    #[test]
    fn formula_comes_from_composition_or_header() {
        assert_eq!(formula_of("Ca Ti O3"), "CaTiO3");
        assert_eq!(formula_of("data_Na2Cl2\n_cell_length_a 5.6"), "Na2Cl2");
    }

    #[test]
    fn part_files_are_hidden_next_to_the_destination() {
        assert_eq!(part_prefix(Path::new("models/x/ckpt.pt")), ".ckpt.pt.");
    }

    #[tokio::test]
    async fn evaluation_is_deterministic_for_a_seed() {
        let backend = ReferenceBackend::new();
        let params = GenerationParams {
            num_samples: 3,
            ..Default::default()
        };

        let first = backend.evaluate(&job("Ca Ti O3", params.clone())).await.unwrap();
        let second = backend.evaluate(&job("Ca Ti O3", params)).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert!(first[0].starts_with("data_CaTiO3\n"));
    }

    #[tokio::test]
    async fn max_new_tokens_bounds_sample_length() {
        let backend = ReferenceBackend::new();
        let params = GenerationParams {
            num_samples: 1,
            max_new_tokens: 12,
            ..Default::default()
        };

        let samples = backend.evaluate(&job("Ca Ti O3", params)).await.unwrap();
        assert_eq!(samples[0].chars().count(), 12);
    }

    #[tokio::test]
    async fn persist_writes_numbered_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("run-1");
        let backend = ReferenceBackend::new();

        let written = backend
            .persist(&target, &["one".to_string(), "two".to_string()])
            .await
            .unwrap();

        assert_eq!(written, vec![target.join("sample_1.cif"), target.join("sample_2.cif")]);
        assert_eq!(std::fs::read_to_string(target.join("sample_2.cif")).unwrap(), "two");
    }

    #[tokio::test]
    async fn persist_into_a_file_fails() {
        let dir = tempfile::NamedTempFile::new().unwrap();
        let backend = ReferenceBackend::new();

        let err = backend
            .persist(dir.path(), &["one".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::Persistence(_)));
    }

    #[tokio::test]
    async fn lookup_answers_with_the_name() {
        let lookup = SimulatedPubChem::new(Duration::ZERO);
        assert_eq!(
            lookup.lookup("caffeine").await.unwrap(),
            "molecule name: caffeine"
        );
    }
}
