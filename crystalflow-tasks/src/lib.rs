//! CrystalFlow application: the inference and molecule-lookup workflows,
//! their activities, the cpu and gpu worker pools and the HTTP API that
//! starts runs and reports their results.

pub mod activities;
pub mod api;
pub mod backend;
pub mod config;
pub mod pools;
pub mod routing;
pub mod server;
pub mod types;
pub mod workflows;

pub use backend::{ComputationBackend, MoleculeLookup, ReferenceBackend, SimulatedPubChem};
pub use config::Config;
pub use server::Server;
pub use types::{GenerationParams, InferenceRequest, LookupRequest, ModelDescriptor};
pub use workflows::{INFERENCE_WORKFLOW, InferenceStage, PUBCHEM_WORKFLOW};
