//! Remote control plane ("Hub API") client.
//!
//! Only the post-publish step talks to the control plane: a PATCH of
//! the final stack outputs and provides. Failures here are warnings at
//! the call site, never fatal.

use crate::core::params::ExpandedOutput;
use crate::core::state::ProvidesMap;
use serde::Serialize;
use std::time::Duration;

/// Environment variable carrying the control plane base URL.
pub const HUB_API_ENV: &str = "HUB_API";

#[derive(Debug, Clone, Serialize)]
pub struct ApiOutput {
    pub name: String,
    pub value: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub brief: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StackInstancePatch {
    pub outputs: Vec<ApiOutput>,
    pub provides: ProvidesMap,
}

/// Shape stack outputs for the control plane.
pub fn transform_stack_outputs(outputs: &[ExpandedOutput]) -> Vec<ApiOutput> {
    outputs
        .iter()
        .map(|o| ApiOutput {
            name: o.name.clone(),
            value: o.value.clone(),
            brief: o.brief.clone(),
            kind: o.kind.clone(),
        })
        .collect()
}

/// `PATCH {HUB_API}/stack-instances/{id}` with the final outputs and
/// provides.
pub fn patch_stack_instance(instance: &str, patch: &StackInstancePatch) -> Result<(), String> {
    let base = std::env::var(HUB_API_ENV)
        .map_err(|_| format!("{} is not set", HUB_API_ENV))?;
    let url = format!("{}/stack-instances/{}", base.trim_end_matches('/'), instance);

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| format!("cannot build HTTP client: {}", e))?;

    let response = client
        .patch(&url)
        .json(patch)
        .send()
        .map_err(|e| format!("PATCH {}: {}", url, e))?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(format!("PATCH {}: HTTP {}", url, status))
    }
}
