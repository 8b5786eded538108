//! Installation of the cluster objects the operator depends on.
//!
//! The NDM custom resource definitions are generated from the Rust types and
//! server-side applied on every start, then awaited until the API server
//! reports them `Established`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, CustomResourceExt};
use tracing::info;

use crate::crd::{BlockDevice, BlockDeviceClaim};
use crate::error::NdmError;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "ndm-operator";

/// Provisions supporting cluster objects before upgrades run.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self) -> Result<()>;
}

/// CRDs owned by this operator, in install order.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![BlockDevice::crd(), BlockDeviceClaim::crd()]
}

/// Installs the NDM CRDs through the Kubernetes API.
pub struct CrdInstaller {
    api: Api<CustomResourceDefinition>,
    timeout: Duration,
}

impl CrdInstaller {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            api: Api::all(client),
            timeout,
        }
    }

    async fn apply(&self, crd: &CustomResourceDefinition) -> Result<String> {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| NdmError::Install("generated CRD has no name".to_string()))?;

        self.api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(crd),
            )
            .await
            .map_err(|e| NdmError::Install(format!("failed to apply CRD {name}: {e}")))?;
        info!(crd = %name, "Applied CustomResourceDefinition");
        Ok(name)
    }

    async fn wait_established(&self, name: &str) -> Result<()> {
        let established = await_condition(self.api.clone(), name, conditions::is_crd_established());
        match tokio::time::timeout(self.timeout, established).await {
            Ok(Ok(_)) => {
                info!(crd = %name, "CustomResourceDefinition established");
                Ok(())
            }
            Ok(Err(e)) => Err(NdmError::Install(format!("watching CRD {name} failed: {e}")).into()),
            Err(_) => Err(NdmError::Install(format!(
                "CRD {name} not established within {}s",
                self.timeout.as_secs()
            ))
            .into()),
        }
    }
}

#[async_trait]
impl Installer for CrdInstaller {
    async fn install(&self) -> Result<()> {
        for crd in crds() {
            let name = self.apply(&crd).await?;
            self.wait_established(&name).await?;
        }
        Ok(())
    }
}
