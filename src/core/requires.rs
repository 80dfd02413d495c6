//! Provides registry and requires checking.
//!
//! Tracks which components (or the ambient environment) provide each
//! named capability, validates component requirements against the
//! registry, and runs capability-specific setup before invocation.

use super::params::{
    insert_locked, CapturedOutputs, LockedParameter, LockedParameters, FALSE_PARAMETER_VALUES,
};
use super::state::ProvidesMap;
use super::types::{output_qname, RequiresTuning};
use crate::warn::WarningSink;
use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};

/// Sentinel provider meaning "the ambient environment". Stripped when
/// the registry is externalized.
pub const PROVIDED_BY_ENV: &str = "*environment*";

/// Parse `lifecycle.requires.optional` entries into a map from
/// capability (or dotted parameter name) to the components it is
/// optional for; `*` means all.
pub fn parse_requires_tuning(tuning: &RequiresTuning) -> HashMap<String, Vec<String>> {
    let mut optional: HashMap<String, Vec<String>> = HashMap::new();
    for entry in &tuning.optional {
        match entry.find(':') {
            Some(i) if i > 0 && i < entry.len() - 1 => {
                let (capability, component) = (&entry[..i], &entry[i + 1..]);
                optional
                    .entry(capability.to_string())
                    .or_default()
                    .push(component.to_string());
            }
            None => {
                optional
                    .entry(entry.clone())
                    .or_default()
                    .push("*".to_string());
            }
            _ => {} // malformed `:x` / `x:` — ignored
        }
    }
    optional
}

/// Dotted `requires.optional` entries name parameters whose false value
/// disables a component. Returns the qualified names of parameters that
/// evaluate false for this component.
pub fn optional_false_parameters(
    component: &str,
    parameters: &LockedParameters,
    optional: &HashMap<String, Vec<String>>,
    sink: &mut WarningSink,
) -> Vec<String> {
    let mut false_parameters = Vec::new();
    for (term, optional_for) in optional {
        if !term.contains('.') {
            continue; // capability, not a parameter
        }
        for target in optional_for {
            if target != "*" && target != component {
                continue;
            }
            let mut parameter_exists = false;
            for p in parameters.values() {
                if p.name == *term && (p.component.is_empty() || p.component == component) {
                    parameter_exists = true;
                    if FALSE_PARAMETER_VALUES.contains(&p.value.as_str()) {
                        false_parameters.push(p.qname());
                        if target == "*" {
                            sink.warn_once(format!(
                                "optional parameter `lifecycle.requires.optional = {}` targets all components as wildcard; \
                                 you may want to narrow it to `{}:component`",
                                term, term
                            ));
                        }
                    }
                }
            }
            if !parameter_exists && target != "*" {
                false_parameters.push(term.clone());
            }
        }
    }
    false_parameters.sort();
    false_parameters.dedup();
    false_parameters
}

/// Probe argvs for capabilities satisfied by a CLI on PATH.
fn capability_bins() -> HashMap<&'static str, Vec<&'static str>> {
    HashMap::from([
        ("aws", vec!["aws", "s3", "ls", "--page-size", "5"]),
        ("azure", vec!["az", "storage", "account", "list", "-o", "table"]),
        ("gcp", vec!["gcloud", "version"]),
        ("gcs", vec!["gsutil", "list"]),
        ("kubectl", vec!["kubectl", "version", "--client"]),
        ("kubernetes", vec!["kubectl", "version", "--client"]),
        ("helm", vec!["helm", "version"]),
        ("vault", vec!["vault", "version"]),
    ])
}

fn check_requires_bin(argv: &[&str]) -> Result<(), String> {
    let status = Command::new(argv[0])
        .args(&argv[1..])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| format!("{}: {}", argv[0], e))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("{:?} exited with {}", argv, status))
    }
}

/// Check stack-level requires against the ambient environment. Each
/// satisfied capability is registered with the environment sentinel;
/// an unsatisfiable mandatory capability is fatal.
pub fn check_stack_requires(
    requires: &[String],
    optional: &HashMap<String, Vec<String>>,
    sink: &mut WarningSink,
) -> Result<ProvidesMap, String> {
    let bins = capability_bins();
    let mut provided = ProvidesMap::new();
    for capability in requires {
        if let Some(argv) = bins.get(capability.as_str()) {
            check_requires_bin(argv).map_err(|e| {
                format!("`{}` requirement cannot be satisfied: {}", capability, e)
            })?;
        } else if let Some(optional_for) = optional.get(capability) {
            sink.warn_once(format!(
                "requirement `{}` has no probe; treating as optional for {}",
                capability,
                optional_for.join(", ")
            ));
            continue;
        } else {
            return Err(format!(
                "cannot check for `requires: {}`: no implementation",
                capability
            ));
        }
        provided.insert(capability.clone(), vec![PROVIDED_BY_ENV.to_string()]);
    }
    Ok(provided)
}

/// Merge capabilities provided by the platform the stack lands on.
pub fn merge_platform_provides(provides: &mut ProvidesMap, platform: &[String]) {
    for capability in platform {
        let list = provides.entry(capability.clone()).or_default();
        if !list.iter().any(|p| p == PROVIDED_BY_ENV) {
            list.push(PROVIDED_BY_ENV.to_string());
        }
    }
}

/// Register a component as provider of its declared and dynamic
/// capabilities. The newest provider goes last (it becomes effective).
pub fn merge_provides(provides: &mut ProvidesMap, component: &str, capabilities: &[String]) {
    for capability in capabilities {
        if capability.is_empty() {
            continue;
        }
        let list = provides.entry(capability.clone()).or_default();
        list.retain(|p| p != component);
        list.push(component.to_string());
    }
}

/// The registry with environment-provided entries stripped, for
/// externalization to state and the control plane.
pub fn no_environment_provides(provides: &ProvidesMap) -> ProvidesMap {
    provides
        .iter()
        .filter_map(|(capability, providers)| {
            let filtered: Vec<String> = providers
                .iter()
                .filter(|p| p.as_str() != PROVIDED_BY_ENV)
                .cloned()
                .collect();
            if filtered.is_empty() {
                None
            } else {
                Some((capability.clone(), filtered))
            }
        })
        .collect()
}

// ============================================================================
// Setup handlers
// ============================================================================

/// Capability-specific setup run before a component is invoked.
/// Receives the effective provider and may add locked parameters (e.g.
/// a credential file path) for the invocation.
pub type SetupHandler = fn(
    capability: &str,
    provider: &str,
    parameters: &mut LockedParameters,
    outputs: &CapturedOutputs,
    scratch_dir: &Path,
    sink: &mut WarningSink,
) -> Result<(), String>;

fn setup_assumed(
    _capability: &str,
    _provider: &str,
    _parameters: &mut LockedParameters,
    _outputs: &CapturedOutputs,
    _scratch_dir: &Path,
    _sink: &mut WarningSink,
) -> Result<(), String> {
    Ok(())
}

fn lookup_value(
    name: &str,
    provider: &str,
    parameters: &LockedParameters,
    outputs: &CapturedOutputs,
) -> Option<String> {
    if let Some(output) = outputs.get(&output_qname(provider, name)) {
        return Some(output.value.clone());
    }
    if let Some(output) = outputs.values().find(|o| o.name == name) {
        return Some(output.value.clone());
    }
    parameters.get(name).map(|p| p.value.clone())
}

/// Materialize a kubeconfig from `kubernetes.api.*` values and bind it
/// as the `kubernetes.kubeconfig` parameter (env `KUBECONFIG`).
fn setup_kubernetes(
    _capability: &str,
    provider: &str,
    parameters: &mut LockedParameters,
    outputs: &CapturedOutputs,
    scratch_dir: &Path,
    sink: &mut WarningSink,
) -> Result<(), String> {
    let endpoint = match lookup_value("kubernetes.api.endpoint", provider, parameters, outputs) {
        Some(v) if !v.is_empty() => v,
        _ => {
            sink.warn(format!(
                "no `kubernetes.api.endpoint` known for provider `{}`; skipping kubeconfig setup",
                provider
            ));
            return Ok(());
        }
    };
    let ca_cert =
        lookup_value("kubernetes.api.caCert", provider, parameters, outputs).unwrap_or_default();
    let token =
        lookup_value("kubernetes.api.token", provider, parameters, outputs).unwrap_or_default();

    let kubeconfig = format!(
        "apiVersion: v1\nkind: Config\nclusters:\n- name: {provider}\n  cluster:\n    server: {endpoint}\n{ca}users:\n- name: {provider}\n  user:\n{token}contexts:\n- name: {provider}\n  context:\n    cluster: {provider}\n    user: {provider}\ncurrent-context: {provider}\n",
        provider = provider,
        endpoint = endpoint,
        ca = if ca_cert.is_empty() {
            String::new()
        } else {
            format!("    certificate-authority-data: {}\n", ca_cert)
        },
        token = if token.is_empty() {
            "    {}\n".to_string()
        } else {
            format!("    token: {}\n", token)
        },
    );

    let path = scratch_dir.join(format!("kubeconfig.{}.yaml", provider.replace('/', "_")));
    std::fs::write(&path, kubeconfig)
        .map_err(|e| format!("cannot write kubeconfig {}: {}", path.display(), e))?;
    insert_locked(
        parameters,
        LockedParameter {
            name: "kubernetes.kubeconfig".to_string(),
            component: String::new(),
            value: path.display().to_string(),
            env: "KUBECONFIG".to_string(),
        },
    );
    Ok(())
}

/// Capability name to setup handler. Unknown capabilities get a
/// warn-once no-op at the call site.
pub fn setup_handlers() -> HashMap<&'static str, SetupHandler> {
    let mut handlers: HashMap<&'static str, SetupHandler> = HashMap::new();
    handlers.insert("kubernetes", setup_kubernetes);
    handlers.insert("kubectl", setup_kubernetes);
    for assumed in ["aws", "azure", "gcp", "gcs", "helm", "vault", "ingress"] {
        handlers.insert(assumed, setup_assumed);
    }
    handlers
}

/// Validate a component's declared requires against the registry and
/// run setup for each satisfied capability. Returns the capabilities
/// that were optional-and-not-provided (the component should be
/// skipped); an unsatisfied mandatory capability is an error.
pub fn prepare_component_requires(
    provides: &ProvidesMap,
    component: &str,
    requires: &[String],
    parameters: &mut LockedParameters,
    outputs: &CapturedOutputs,
    optional: &HashMap<String, Vec<String>>,
    scratch_dir: &Path,
    sink: &mut WarningSink,
) -> Result<Vec<String>, String> {
    let mut setups: Vec<(String, String)> = Vec::new();
    let mut optional_not_provided = Vec::new();

    for capability in requires {
        let providers = provides.get(capability).filter(|by| !by.is_empty());
        let providers = match providers {
            Some(by) => by,
            None => {
                let optional_for = optional.get(capability);
                if optional_for.map_or(false, |targets| {
                    targets.iter().any(|t| t == component || t == "*")
                }) {
                    optional_not_provided.push(capability.clone());
                    continue;
                }
                return Err(format!(
                    "component `{}` requires `{}` but only the following provides are currently known: {}",
                    component,
                    capability,
                    format_provides(provides),
                ));
            }
        };
        let provider = providers[providers.len() - 1].clone();
        if providers.len() > 1 {
            sink.warn(format!(
                "requirement `{}` provided by multiple components `{}`; only `{}` will be used",
                capability,
                providers.join(", "),
                provider
            ));
        }
        setups.push((capability.clone(), provider));
    }

    if optional_not_provided.is_empty() {
        let handlers = setup_handlers();
        for (capability, provider) in setups {
            match handlers.get(capability.as_str()) {
                Some(handler) => {
                    handler(&capability, &provider, parameters, outputs, scratch_dir, sink)?
                }
                None => sink.warn_once(format!(
                    "don't know how to setup requirement `{}`",
                    capability
                )),
            }
        }
    }
    Ok(optional_not_provided)
}

fn format_provides(provides: &ProvidesMap) -> String {
    if provides.is_empty() {
        return "(none)".to_string();
    }
    provides
        .iter()
        .map(|(capability, by)| format!("{} => {}", capability, by.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}
