//! Desired-state model of an installation
//!
//! Everything in this module is pure: normalization, naming, labeling,
//! configuration file rendering and platform object construction all
//! compute desired state without touching the API server.

pub mod config_files;
pub mod creator;
pub mod labels;
pub mod names;
mod normalized;
mod normalizer;

pub use config_files::{ConfigFilesGeneratorOptions, RemoteServersOptions};
pub use creator::Creator;
pub use normalized::{
    ClusterAddress, HostAddress, HostAttributeMap, NormalizedChi, NormalizedCluster,
    NormalizedHost, NormalizedShard, ReconcileAttributes, ResolvedTemplates, ShardAddress,
};
pub use normalizer::Normalizer;
