//! Custom Resource Definitions for the ClickHouse operator
//!
//! This module defines the ClickHouseInstallation CRD tree and the
//! installation template CRD merged in during normalization.

mod installation;
mod status;
#[cfg(test)]
mod tests;
mod types;

pub use installation::{
    ChiSpec, ChiTemplateSpec, ClickHouseInstallation, ClickHouseInstallationTemplate,
};
pub use status::{ChiPhase, ChiStatus};
pub use types::*;
