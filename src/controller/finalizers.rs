//! Deletion finalizer management
//!
//! A live installation always carries the deletion finalizer so the platform
//! cannot garbage-collect it before the operator has torn down its hosts.

use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use tracing::debug;

use crate::crd::ClickHouseInstallation;
use crate::error::Result;

pub const FINALIZER_NAME: &str = "finalizer.clickhouseinstallation.clickhouse.example.com";

/// Install the finalizer if it is not present yet. Already-present
/// finalizers are left untouched and no write is issued.
pub async fn ensure_finalizer(
    api: &Api<ClickHouseInstallation>,
    chi: &ClickHouseInstallation,
) -> Result<()> {
    if chi.finalizers().iter().any(|f| f == FINALIZER_NAME) {
        debug!("finalizer already installed on {}", chi.name_any());
        return Ok(());
    }

    let mut finalizers = chi.finalizers().to_vec();
    finalizers.push(FINALIZER_NAME.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": chi.resource_version(),
        }
    });
    api.patch(&chi.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!("finalizer installed on {}", chi.name_any());
    Ok(())
}

/// Remove the finalizer, releasing the installation to the platform's
/// garbage collector. A no-op when the object or finalizer is already gone.
pub async fn uninstall_finalizer(api: &Api<ClickHouseInstallation>, name: &str) -> Result<()> {
    let Some(current) = api.get_opt(name).await? else {
        return Ok(());
    };
    if !current.finalizers().iter().any(|f| f == FINALIZER_NAME) {
        return Ok(());
    }

    let finalizers: Vec<String> = current
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER_NAME)
        .cloned()
        .collect();

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": current.resource_version(),
        }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!("finalizer removed from {}", name);
    Ok(())
}
