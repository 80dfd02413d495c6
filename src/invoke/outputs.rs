//! Output capture from component invocations.
//!
//! Declared outputs are read from stdout as `name = value` lines
//! (optionally `##kind` annotated), from a literal value with `${ref}`
//! substitutions, or from the component's Terraform state. A raw
//! `provides = ...` line carries dynamic provides. Git status outputs
//! can be appended implicitly.

use crate::core::params::{
    expand_string, CapturedOutput, CapturedOutputs, ExpansionContext, LockedParameters,
};
use crate::core::types::{output_qname, yaml_value_to_string, Output};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

/// Raw stdout key carrying dynamic provides instead of an output value.
const PROVIDES_OUTPUT_NAME: &str = "provides";

const TFSTATE_FILENAME: &str = "terraform.tfstate";

/// What a component produced.
#[derive(Debug, Default)]
pub struct CaptureResult {
    /// `name = value` lines as printed, in order.
    pub raw: IndexMap<String, String>,
    /// Declared outputs, resolved and qualified.
    pub outputs: CapturedOutputs,
    /// Capabilities announced at runtime via `provides = ...`.
    pub dynamic_provides: Vec<String>,
}

/// Parse `name = value` lines. Later duplicates win. A `##kind` suffix
/// on the value is split off.
fn parse_raw_outputs(stdout: &str) -> (IndexMap<String, String>, HashMap<String, String>) {
    let mut raw = IndexMap::new();
    let mut kinds = HashMap::new();
    for line in stdout.lines() {
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            continue;
        }
        let mut value = value.trim();
        if let Some((v, kind)) = value.rsplit_once("##") {
            let kind = kind.trim();
            if !kind.is_empty() && !kind.contains(char::is_whitespace) {
                kinds.insert(name.to_string(), kind.to_string());
                value = v.trim_end();
            }
        }
        raw.shift_remove(name);
        raw.insert(name.to_string(), value.to_string());
    }
    (raw, kinds)
}

/// Capture a component's declared outputs from its stdout and source
/// directory. Errors (malformed or missing declared outputs) are
/// aggregated; any error fails the component.
pub fn capture_outputs(
    component: &str,
    parameters: &LockedParameters,
    stdout: &str,
    dir: &Path,
    declared: &[Output],
) -> Result<CaptureResult, Vec<String>> {
    let (raw, kinds) = parse_raw_outputs(stdout);
    let mut errors = Vec::new();

    let dynamic_provides = raw
        .get(PROVIDES_OUTPUT_NAME)
        .map(|value| {
            value
                .split([',', ' '])
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    // Raw lines become expandable as unqualified references.
    let mut raw_as_outputs = CapturedOutputs::new();
    for (name, value) in &raw {
        let o = CapturedOutput {
            name: name.clone(),
            component: component.to_string(),
            value: value.clone(),
            kind: String::new(),
        };
        raw_as_outputs.insert(o.qname(), o);
    }
    let environment = HashMap::new();
    let depends = [component.to_string()];
    let ctx = ExpansionContext {
        parameters,
        outputs: &raw_as_outputs,
        environment: &environment,
        component,
        depends: &depends,
    };

    let mut outputs = CapturedOutputs::new();
    for output in declared {
        let value = if !output.from_tf_var.is_empty() {
            match terraform_output(dir, &output.from_tf_var) {
                Ok(v) => Some(v),
                Err(e) => {
                    errors.push(format!("output `{}`: {}", output.name, e));
                    None
                }
            }
        } else if let Some(ref literal) = output.value {
            match expand_string(&yaml_value_to_string(literal), &ctx) {
                Ok(v) => Some(v),
                Err(errs) => {
                    for e in errs {
                        errors.push(format!("output `{}`: {}", output.name, e));
                    }
                    None
                }
            }
        } else {
            match raw.get(&output.name) {
                Some(v) => Some(v.clone()),
                None => {
                    errors.push(format!(
                        "declared output `{}` was not produced by `{}`",
                        output.name, component
                    ));
                    None
                }
            }
        };
        if let Some(value) = value {
            let kind = if !output.kind.is_empty() {
                output.kind.clone()
            } else {
                kinds.get(&output.name).cloned().unwrap_or_default()
            };
            let captured = CapturedOutput {
                name: output.name.clone(),
                component: component.to_string(),
                value,
                kind,
            };
            outputs.insert(captured.qname(), captured);
        }
    }

    if errors.is_empty() {
        Ok(CaptureResult {
            raw,
            outputs,
            dynamic_provides,
        })
    } else {
        Err(errors)
    }
}

/// Read an output value from the component's terraform.tfstate.
fn terraform_output(dir: &Path, var: &str) -> Result<String, String> {
    let path = dir.join(TFSTATE_FILENAME);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let state: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| format!("invalid tfstate {}: {}", path.display(), e))?;
    let value = &state["outputs"][var]["value"];
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::Null => Err(format!(
            "tfstate has no output `{}` in {}",
            var,
            path.display()
        )),
        other => Ok(other.to_string()),
    }
}

/// Implicit Git status outputs for a component's source tree.
/// Best-effort: a directory outside any Git work tree yields nothing.
pub fn git_outputs(component: &str, dir: &Path, with_status: bool) -> CapturedOutputs {
    let mut outputs = CapturedOutputs::new();
    let mut add = |name: &str, value: String| {
        let o = CapturedOutput {
            name: name.to_string(),
            component: component.to_string(),
            value,
            kind: String::new(),
        };
        outputs.insert(o.qname(), o);
    };

    if let Some(head) = git(dir, &["rev-parse", "HEAD"]) {
        add("git.ref", head);
    } else {
        return outputs;
    }
    if let Some(branch) = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]) {
        add("git.branch", branch);
    }
    if let Some(remote) = git(dir, &["config", "--get", "remote.origin.url"]) {
        add("git.remote", remote);
    }
    if with_status {
        if let Some(status) = git(dir, &["status", "--porcelain"]) {
            add("git.clean", status.is_empty().to_string());
        }
    }
    outputs
}

fn git(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
