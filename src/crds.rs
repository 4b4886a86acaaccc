//! CRD manifests and installation
//!
//! The adapter installs its own CRDs on startup using server-side apply so the
//! schema always matches the binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tracing::info;

use cloudmetrics_common::crd::{CustomMetric, ExternalMetric};
use cloudmetrics_common::{Error, FIELD_MANAGER};

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn declaration_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "externalmetrics.azure.com",
            crd: ExternalMetric::crd(),
        },
        CrdDef {
            name: "custommetrics.azure.com",
            crd: CustomMetric::crd(),
        },
    ]
}

/// Both CRDs as a multi-document YAML stream
pub fn crd_yaml() -> Result<String, Error> {
    let docs = declaration_crds()
        .iter()
        .map(|def| {
            serde_yaml::to_string(&def.crd)
                .map_err(|e| Error::serialization_for_kind(def.name, e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs.join("---\n"))
}

/// Install or update both CRDs
pub async fn install_crds(client: &Client) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in declaration_crds() {
        info!(crd = def.name, "Installing CRD");
        crds.patch(def.name, &params, &Patch::Apply(&def.crd)).await?;
    }

    info!("Metric declaration CRDs installed/updated");
    Ok(())
}
