//! Lifecycle executor — the orchestration loop.
//!
//! Validates and linearizes the component order, locks stack
//! parameters, reconciles with persisted state, then walks the
//! traversal window dispatching each component's verb: expand
//! parameters, check requires, invoke, capture outputs, wait for ready
//! conditions, and record every transition in the state manifest.

use super::params::{
    self, CapturedOutput, CapturedOutputs, ExpandedOutput, LockedParameter, LockedParameters,
};
use super::parser;
use super::ready;
use super::requires;
use super::state::{self, LockGuard, StateManifest, StateWriter};
use super::types::*;
use crate::api;
use crate::invoke::{self, outputs as capture};
use crate::warn::WarningSink;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEPLOYMENT_ID_PARAMETER: &str = "hub.deploymentId";
pub const STACK_NAME_PARAMETER: &str = "hub.stackName";
pub const PROVIDES_PARAMETER: &str = "hub.provides";

/// A single stack operation.
#[derive(Debug, Clone)]
pub struct Request {
    pub verb: String,
    pub manifest_filenames: Vec<PathBuf>,
    pub state_filenames: Vec<PathBuf>,

    /// Explicit component selection; empty means all.
    pub components: Vec<String>,
    pub offset_component: String,
    pub limit_component: String,

    /// `NAME=VALUE` parameter overrides.
    pub environment_overrides: Vec<String>,

    /// Components live under this directory (defaults to the stack's).
    pub components_base_dir: Option<PathBuf>,

    /// Restrict each component to its own declared parameters.
    pub strict_parameters: bool,

    /// Invoke `<verb>-test` implementations instead of `<verb>`.
    pub dry_run: bool,

    pub git_outputs: bool,
    pub git_outputs_status: bool,

    /// On undeploy, guess the offset from the first component with a
    /// state entry.
    pub guess_component: bool,

    /// Downgrade mandatory failures to warnings.
    pub force: bool,

    /// Publish final outputs to the control plane.
    pub save_stack_instance_outputs: bool,
    pub stack_instance: String,

    /// With an explicit selection, still recompute final stack outputs.
    pub load_final_state: bool,

    pub pipe_output_in_realtime: bool,

    /// Cap on ready-condition wait budgets, in seconds.
    pub wait_override: Option<u64>,

    /// Prompt on a terminal for unresolved parameters.
    pub interactive: bool,
    pub verbose: bool,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            verb: "deploy".to_string(),
            manifest_filenames: Vec::new(),
            state_filenames: Vec::new(),
            components: Vec::new(),
            offset_component: String::new(),
            limit_component: String::new(),
            environment_overrides: Vec::new(),
            components_base_dir: None,
            strict_parameters: false,
            dry_run: false,
            git_outputs: false,
            git_outputs_status: false,
            guess_component: false,
            force: false,
            save_stack_instance_outputs: false,
            stack_instance: String::new(),
            load_final_state: false,
            pipe_output_in_realtime: false,
            wait_override: None,
            interactive: false,
            verbose: false,
        }
    }
}

/// What an operation ended up as.
#[derive(Debug)]
pub struct ExecutionReport {
    pub operation_id: String,
    pub stack_status: String,
    pub operation_status: String,
    pub failed_components: Vec<String>,
    pub stack_outputs: Vec<ExpandedOutput>,
    pub warnings: Vec<String>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.operation_status == "success"
    }
}

/// Per-operation scratch directory for materialized credentials and
/// the like; removed on drop.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(operation_id: &str) -> Result<Self, String> {
        let path = std::env::temp_dir().join(format!("stacksmith-{}", operation_id));
        std::fs::create_dir_all(&path)
            .map_err(|e| format!("cannot create scratch dir {}: {}", path.display(), e))?;
        Ok(ScratchDir { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Run one verb against the stack. Returns a report for any operation
/// that reached the loop; a mandatory failure aborts with `Err` after
/// recording it in state.
pub fn execute(request: &Request) -> Result<ExecutionReport, String> {
    let is_deploy = request.verb.starts_with("deploy");
    let is_undeploy = request.verb.starts_with("undeploy");
    let is_some_components =
        !request.components.is_empty() || !request.offset_component.is_empty();
    let partial_run = is_some_components || !request.limit_component.is_empty();

    // Parse and validate.
    let stack_base_dir = basedir(&request.manifest_filenames);
    let components_base_dir = request
        .components_base_dir
        .clone()
        .unwrap_or_else(|| stack_base_dir.clone());

    let parsed = parser::parse_manifests(
        &request.manifest_filenames,
        &stack_base_dir,
        &components_base_dir,
    )
    .map_err(|e| format!("unable to {}: {}", request.verb, e))?;
    let stack = &parsed.stack;

    let validation_errors = parser::validate_stack(stack, &parsed.components);
    if !validation_errors.is_empty() {
        return Err(format!(
            "invalid stack manifest {}:\n\t{}",
            parsed.filename.display(),
            validation_errors
                .iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("\n\t")
        ));
    }
    if !parser::verb_supported(stack, &request.verb) {
        return Err(format!(
            "verb `{}` is not supported by stack `{}`",
            request.verb, stack.meta.name
        ));
    }
    let mut selectors: Vec<&str> = request.components.iter().map(|c| c.as_str()).collect();
    selectors.push(request.offset_component.as_str());
    selectors.push(request.limit_component.as_str());
    parser::check_components_exist(stack, &selectors)?;

    let environment = params::parse_kv_list(&request.environment_overrides)
        .map_err(|e| format!("unable to parse environment overrides: {}", e))?;

    let mut sink = WarningSink::new();

    let optional_requires = requires::parse_requires_tuning(&stack.lifecycle.requires);
    let mut provides =
        requires::check_stack_requires(&stack.requires, &optional_requires, &mut sink)?;
    requires::merge_platform_provides(&mut provides, &stack.platform.provides);

    // State.
    let _lock_guard = if request.state_filenames.is_empty() {
        None
    } else {
        Some(LockGuard::acquire(&request.state_filenames)?)
    };

    let loaded_state = state::load_state(&request.state_filenames)?;
    if loaded_state.is_none() && is_some_components {
        return Err(format!(
            "component selection given but no state file found in {}",
            request
                .state_filenames
                .iter()
                .map(|f| f.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if let Some(ref loaded) = loaded_state {
        check_state_match(loaded, stack)?;
    }

    let operation_id = uuid::Uuid::new_v4().to_string();

    // hub.deploymentId is stable across re-runs; hub.stackName is the
    // plain prefix of the name.
    let deployment_id = loaded_state
        .as_ref()
        .and_then(|s| {
            s.stack_parameters
                .iter()
                .find(|p| p.name == DEPLOYMENT_ID_PARAMETER)
                .map(|p| p.value.clone())
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let plain_stack_name = plain_name(&stack.meta.name).to_string();

    let extra_expansion_values = vec![
        LockedParameter {
            name: DEPLOYMENT_ID_PARAMETER.to_string(),
            component: String::new(),
            value: deployment_id.clone(),
            env: String::new(),
        },
        LockedParameter {
            name: STACK_NAME_PARAMETER.to_string(),
            component: String::new(),
            value: plain_stack_name.clone(),
            env: String::new(),
        },
    ];

    // Lock stack parameters.
    let state_values = if is_undeploy {
        loaded_state
            .as_ref()
            .map(|s| s.parameter_values())
            .unwrap_or_default()
    } else {
        HashMap::new()
    };
    let lock_ctx = params::LockContext {
        environment: &environment,
        state_values,
        interactive: request.interactive,
        verbose: request.verbose,
    };
    let flat_stack_parameters = params::flatten_parameters(&stack.parameters);
    let mut stack_parameters =
        params::lock_parameters(&flat_stack_parameters, &extra_expansion_values, &lock_ctx)
            .map_err(|errs| {
                format!("failed to lock stack parameters:\n\t{}", errs.join("\n\t"))
            })?;

    // Reconcile with state.
    let mut all_outputs = CapturedOutputs::new();
    if let Some(ref loaded) = loaded_state {
        if is_undeploy || is_some_components {
            for p in &loaded.stack_parameters {
                stack_parameters.entry(p.qname()).or_insert_with(|| p.clone());
            }
            state::seed_provides_from_state(loaded, &mut provides);
        }
        if is_undeploy && !is_some_components {
            state::seed_outputs_from_state(
                loaded,
                "",
                &[],
                &stack.lifecycle.order,
                false,
                &mut all_outputs,
            );
        }
    }

    add_locked_parameter(
        &mut stack_parameters,
        DEPLOYMENT_ID_PARAMETER,
        "DEPLOYMENT_ID",
        &deployment_id,
        request.verbose,
    );
    add_locked_parameter(
        &mut stack_parameters,
        STACK_NAME_PARAMETER,
        "STACK_NAME",
        &plain_stack_name,
        request.verbose,
    );

    let base_manifest = match loaded_state.clone() {
        Some(manifest) => manifest,
        None => StateManifest::new(&stack.kind, &stack.meta.name),
    };
    let mut writer = StateWriter::new(request.state_filenames.clone(), base_manifest);
    writer.set_order(&stack.lifecycle.order);
    writer.set_stack_parameters(stack_parameters.values().cloned().collect());

    // Compute traversal.
    let mut order = stack.lifecycle.order.clone();
    let mut offset_component = request.offset_component.clone();
    let mut offset_guessed = false;
    if is_undeploy {
        order.reverse();

        // Guess which component failed to deploy and start undeploy
        // from it.
        if request.guess_component && !is_some_components {
            if let Some(ref loaded) = loaded_state {
                for (i, name) in order.iter().enumerate() {
                    if loaded.components.contains_key(name) {
                        if i > 0 {
                            if request.verbose {
                                eprintln!(
                                    "State file has an entry for `{}` - setting `--offset {}`",
                                    name, name
                                );
                            }
                            offset_component = name.clone();
                            offset_guessed = true;
                        }
                        break;
                    }
                }
            }
        }
    }

    let offset_index = index_of(&order, &offset_component);
    let limit_index = index_of(&order, &request.limit_component);
    if let (Some(offset), Some(limit)) = (offset_index, limit_index) {
        if limit < offset && !offset_guessed {
            return Err(format!(
                "--limit {} (#{}) is before --offset {} (#{}) in component order",
                request.limit_component, limit, request.offset_component, offset
            ));
        }
    }

    let scratch = ScratchDir::create(&operation_id)?;

    // Start the operation record.
    let argv: Vec<String> = std::env::args().collect();
    writer.update_operation(
        &operation_id,
        &request.verb,
        "in-progress",
        Some(argv.join(" ")),
    );
    writer.sync()?;

    let mut failed_components: Vec<String> = Vec::new();

    'next_component: for (component_index, component_name) in order.iter().enumerate() {
        let selected = (request.components.is_empty()
            || request.components.contains(component_name))
            && offset_index.map_or(true, |offset| component_index >= offset)
            && limit_index.map_or(true, |limit| component_index <= limit);
        if !selected {
            if request.verbose {
                eprintln!("Skip {}", component_name);
            }
            continue;
        }

        // Undeploying something that was never deployed is a no-op.
        if is_undeploy && request.components.is_empty() {
            if let Some(ref loaded) = loaded_state {
                if !loaded.components.contains_key(component_name) {
                    println!("Skipping `{}`: no state entry", component_name);
                    continue;
                }
            }
        }

        println!(
            "{} ***{}*** ({}/{})",
            maybe_test_verb(&request.verb, request.dry_run),
            component_name,
            component_index + 1,
            order.len()
        );

        let component = match stack.component_ref(component_name) {
            Some(c) => c,
            None => return Err(format!("component `{}` not found", component_name)),
        };
        let component_manifest =
            match parser::component_manifest_by_ref(&parsed.components, component) {
                Some(m) => m,
                None => return Err(format!("component `{}` has no manifest", component_name)),
            };

        // Merge prior-phase outputs from state at the offset or for an
        // explicit selection (which resets the working set first).
        if let Some(ref loaded) = loaded_state {
            if offset_index == Some(component_index) || !request.components.is_empty() {
                if !request.components.is_empty() {
                    all_outputs = CapturedOutputs::new();
                }
                state::seed_outputs_from_state(
                    loaded,
                    component_name,
                    &component.depends,
                    &stack.lifecycle.order,
                    is_deploy,
                    &mut all_outputs,
                );
            }
        }

        // Dependency health.
        if is_deploy && !component.depends.is_empty() {
            let failed_deps: Vec<&str> = component
                .depends
                .iter()
                .filter(|d| failed_components.contains(*d))
                .map(|d| d.as_str())
                .collect();
            if !failed_deps.is_empty() {
                let message = format!(
                    "component `{}` failed to {}: depends on failed component `{}`",
                    component_name,
                    request.verb,
                    failed_deps.join(", ")
                );
                component_failed(
                    &mut writer,
                    &operation_id,
                    request,
                    &stack.lifecycle,
                    component_name,
                    message,
                    &mut failed_components,
                    &mut sink,
                )?;
                continue 'next_component;
            }
        }

        // Expand component parameters.
        let flat_component_parameters =
            params::flatten_parameters(&component_manifest.parameters);
        let mut expanded = match params::expand_parameters(
            component_name,
            &component.depends,
            &stack_parameters,
            &all_outputs,
            &flat_component_parameters,
            &environment,
        ) {
            Ok(list) => list,
            Err(errs) => {
                let message = format!(
                    "component `{}` parameters expansion failed:\n\t{}",
                    component_name,
                    errs.join("\n\t")
                );
                component_failed(
                    &mut writer,
                    &operation_id,
                    request,
                    &stack.lifecycle,
                    component_name,
                    message,
                    &mut failed_components,
                    &mut sink,
                )?;
                continue 'next_component;
            }
        };
        if !expanded.iter().any(|p| p.name == PROVIDES_PARAMETER) {
            expanded.push(LockedParameter {
                name: PROVIDES_PARAMETER.to_string(),
                component: component_name.clone(),
                value: provides.keys().cloned().collect::<Vec<_>>().join(" "),
                env: "HUB_PROVIDES".to_string(),
            });
        }
        let all_parameters = params::merge_parameters(&stack_parameters, &expanded);

        // Optional-parameter gate.
        let false_parameters = requires::optional_false_parameters(
            component_name,
            &all_parameters,
            &optional_requires,
            &mut sink,
        );
        if !false_parameters.is_empty() {
            println!(
                "Skipping `{}`: optional parameter {} evaluated to false",
                component_name,
                false_parameters.join(", ")
            );
            continue 'next_component;
        }

        let mut component_parameters = if request.strict_parameters {
            params::merge_parameters(&LockedParameters::new(), &expanded)
        } else {
            all_parameters
        };

        // Requires.
        match requires::prepare_component_requires(
            &provides,
            component_name,
            &component_manifest.requires,
            &mut component_parameters,
            &all_outputs,
            &optional_requires,
            scratch.path(),
            &mut sink,
        ) {
            Ok(not_provided) if !not_provided.is_empty() => {
                println!(
                    "Skipping `{}`: optional requirement(s) {} not provided",
                    component_name,
                    not_provided.join(", ")
                );
                continue 'next_component;
            }
            Ok(_) => {}
            Err(e) => {
                component_failed(
                    &mut writer,
                    &operation_id,
                    request,
                    &stack.lifecycle,
                    component_name,
                    e,
                    &mut failed_components,
                    &mut sink,
                )?;
                continue 'next_component;
            }
        }

        // Persist intent.
        let active = verb_active(&request.verb);
        if is_deploy {
            writer.record_component(
                component_name,
                expanded.clone(),
                IndexMap::new(),
                Vec::new(),
            );
        }
        writer.update_component_status(component_name, &active, "");
        writer.update_stack_status(&active, "");
        writer.update_phase(&operation_id, component_name, "in-progress");
        writer.sync()?;

        // Invoke.
        let dir = component_source_dir(component, &stack_base_dir, &components_base_dir);
        let invocation = invoke::invoke(
            &maybe_test_verb(&request.verb, request.dry_run),
            component_name,
            component_manifest.lifecycle.bare == "allow",
            &component_manifest.templates,
            &component_parameters,
            &dir,
            request.pipe_output_in_realtime,
            &mut sink,
        );

        let mut stdout = String::new();
        let invocation_error = match invocation {
            Err(e) => Some(e),
            Ok(None) => {
                if request.verbose {
                    eprintln!("Skip `{}`: no implementation (bare)", component_name);
                }
                None
            }
            Ok(Some(output)) => {
                stdout = output.stdout.clone();
                if output.success() {
                    None
                } else {
                    Some(format!(
                        "exit code {}{}",
                        output.exit_code,
                        format_stdout_stderr(&output.stdout, &output.stderr)
                    ))
                }
            }
        };

        if let Some(error) = invocation_error {
            writer.append_operation_log(&operation_id, format!("{}: {}", component_name, error));
            let message = format!(
                "component `{}` failed to {}: {}",
                component_name, request.verb, error
            );
            component_failed(
                &mut writer,
                &operation_id,
                request,
                &stack.lifecycle,
                component_name,
                message,
                &mut failed_components,
                &mut sink,
            )?;
            continue 'next_component;
        }

        // Post-invoke: capture outputs and recompute provides.
        let mut raw_outputs = IndexMap::new();
        let mut component_outputs: Vec<CapturedOutput> = Vec::new();
        if is_deploy {
            match capture::capture_outputs(
                component_name,
                &component_parameters,
                &stdout,
                &dir,
                &component_manifest.outputs,
            ) {
                Ok(captured) => {
                    raw_outputs = captured.raw;
                    params::merge_outputs(&mut all_outputs, &captured.outputs);
                    component_outputs = captured.outputs.values().cloned().collect();

                    if request.git_outputs {
                        let git = capture::git_outputs(
                            component_name,
                            &dir,
                            request.git_outputs_status,
                        );
                        component_outputs.extend(git.values().cloned());
                        params::merge_outputs(&mut all_outputs, &git);
                    }

                    let mut capabilities = component_manifest.provides.clone();
                    capabilities.extend(captured.dynamic_provides);
                    requires::merge_provides(&mut provides, component_name, &capabilities);
                }
                Err(errs) => {
                    let message = format!(
                        "component `{}` outputs capture failed:\n\t{}",
                        component_name,
                        errs.join("\n\t")
                    );
                    component_failed(
                        &mut writer,
                        &operation_id,
                        request,
                        &stack.lifecycle,
                        component_name,
                        message,
                        &mut failed_components,
                        &mut sink,
                    )?;
                    continue 'next_component;
                }
            }

            writer.record_component(
                component_name,
                expanded.clone(),
                raw_outputs,
                component_outputs,
            );
            writer.record_provides(requires::no_environment_provides(&provides));

            let final_component = component_index == order.len() - 1
                || (!request.components.is_empty() && request.load_final_state);
            if final_component {
                let merged = params::merge_parameters(&stack_parameters, &expanded);
                let stack_outputs = params::expand_requested_outputs(
                    &merged,
                    &all_outputs,
                    &stack.outputs,
                    &mut sink,
                );
                writer.record_stack_outputs(stack_outputs);
            }

            // Ready conditions.
            if let Err(e) = ready::wait_for_ready_conditions(
                &component_manifest.lifecycle.ready_conditions,
                &component_parameters,
                &all_outputs,
                request.wait_override,
            ) {
                let message = format!(
                    "component `{}` ready condition failed: {}",
                    component_name, e
                );
                component_failed(
                    &mut writer,
                    &operation_id,
                    request,
                    &stack.lifecycle,
                    component_name,
                    message,
                    &mut failed_components,
                    &mut sink,
                )?;
                continue 'next_component;
            }
        }

        writer.update_component_status(component_name, &verb_past(&request.verb), "");
        writer.update_phase(&operation_id, component_name, "success");
        writer.sync()?;
        if request.verbose {
            eprintln!("Component `{}` completed {}", component_name, request.verb);
        }
    }

    // Stack-level ready conditions.
    let mut stack_ready_failed = false;
    if is_deploy {
        if let Err(e) = ready::wait_for_ready_conditions(
            &stack.lifecycle.ready_conditions,
            &stack_parameters,
            &all_outputs,
            request.wait_override,
        ) {
            let message = format!("stack ready condition failed: {}", e);
            writer.update_stack_status("incomplete", &message);
            writer.update_operation(&operation_id, &request.verb, "error", None);
            writer.sync()?;
            sink.warn(message);
            stack_ready_failed = true;
        }
    }

    // Finalize.
    if !stack_ready_failed {
        let (status, message) =
            calculate_stack_status(&request.verb, &failed_components, partial_run);
        writer.update_stack_status(&status, &message);
        let operation_status = if failed_components.is_empty() {
            "success"
        } else {
            "error"
        };
        writer.update_operation(&operation_id, &request.verb, operation_status, None);
        writer.sync()?;
    }

    let stack_outputs = if !writer.manifest().stack_outputs.is_empty() {
        writer.manifest().stack_outputs.clone()
    } else if is_deploy {
        params::expand_requested_outputs(&stack_parameters, &all_outputs, &stack.outputs, &mut sink)
    } else {
        Vec::new()
    };

    // Post-publish; failure is a warning, never fatal.
    if request.save_stack_instance_outputs
        && !request.stack_instance.is_empty()
        && !stack_outputs.is_empty()
    {
        let patch = api::StackInstancePatch {
            outputs: api::transform_stack_outputs(&stack_outputs),
            provides: requires::no_environment_provides(&provides),
        };
        if let Err(e) = api::patch_stack_instance(&request.stack_instance, &patch) {
            sink.warn(format!(
                "unable to send stack outputs to the control plane: {}",
                e
            ));
        }
    }

    sink.print_summary();

    let manifest = writer.manifest();
    Ok(ExecutionReport {
        operation_status: manifest
            .operations
            .iter()
            .find(|o| o.id == operation_id)
            .map(|o| o.status.clone())
            .unwrap_or_default(),
        stack_status: manifest.status.clone(),
        operation_id,
        failed_components,
        stack_outputs,
        warnings: sink.drain(),
    })
}

/// A component is optional iff listed in `lifecycle.optional`, or
/// `mandatory` is non-empty and the component is absent from it.
pub fn optional_component(lifecycle: &Lifecycle, component: &str) -> bool {
    (!lifecycle.mandatory.is_empty() && !lifecycle.mandatory.iter().any(|c| c == component))
        || lifecycle.optional.iter().any(|c| c == component)
}

/// Record a component failure in state and apply the mandatory/optional
/// policy: optional (or forced) failures warn and continue, mandatory
/// failures abort.
#[allow(clippy::too_many_arguments)]
fn component_failed(
    writer: &mut StateWriter,
    operation_id: &str,
    request: &Request,
    lifecycle: &Lifecycle,
    component: &str,
    message: String,
    failed_components: &mut Vec<String>,
    sink: &mut WarningSink,
) -> Result<(), String> {
    failed_components.push(component.to_string());
    writer.update_component_status(component, "error", &message);
    writer.update_phase(operation_id, component, "error");

    if optional_component(lifecycle, component) {
        sink.warn(message);
        writer.sync()?;
        return Ok(());
    }
    writer.update_stack_status("incomplete", &message);
    if request.force {
        sink.warn(message);
        writer.sync()?;
        return Ok(());
    }
    writer.update_operation(operation_id, &request.verb, "error", None);
    writer.sync()?;
    Err(message)
}

fn calculate_stack_status(
    verb: &str,
    failed_components: &[String],
    partial_run: bool,
) -> (String, String) {
    if !failed_components.is_empty() {
        (
            "incomplete".to_string(),
            format!(
                "component(s) failed to {}: {}",
                verb,
                failed_components.join(", ")
            ),
        )
    } else if partial_run {
        ("partial".to_string(), String::new())
    } else {
        (verb_past(verb), String::new())
    }
}

fn check_state_match(loaded: &StateManifest, stack: &Manifest) -> Result<(), String> {
    if !loaded.meta.name.is_empty() && loaded.meta.name != stack.meta.name {
        return Err(format!(
            "state file is for stack `{}`, manifest is `{}`",
            loaded.meta.name, stack.meta.name
        ));
    }
    if !loaded.meta.kind.is_empty() && loaded.meta.kind != stack.kind {
        return Err(format!(
            "state file is for kind `{}`, manifest is `{}`",
            loaded.meta.kind, stack.kind
        ));
    }
    Ok(())
}

/// Insert an implicit parameter unless the user already supplied one.
fn add_locked_parameter(
    parameters: &mut LockedParameters,
    name: &str,
    env: &str,
    value: &str,
    verbose: bool,
) {
    let exists_with_value = parameters
        .get(name)
        .map_or(false, |p| !p.value.is_empty());
    if exists_with_value {
        return;
    }
    let env = parameters
        .get(name)
        .filter(|p| !p.env.is_empty())
        .map(|p| p.env.clone())
        .unwrap_or_else(|| env.to_string());
    if verbose {
        eprintln!("Adding implicit parameter {} = `{}` (env: {})", name, value, env);
    }
    parameters.insert(
        name.to_string(),
        LockedParameter {
            name: name.to_string(),
            component: String::new(),
            value: value.to_string(),
            env,
        },
    );
}

fn maybe_test_verb(verb: &str, dry_run: bool) -> String {
    if dry_run {
        format!("{}-test", verb)
    } else {
        verb.to_string()
    }
}

fn format_stdout_stderr(stdout: &str, stderr: &str) -> String {
    let mut formatted = String::new();
    if !stdout.trim().is_empty() {
        formatted.push_str(&format!("\n--- stdout:\n{}", stdout.trim_end()));
    }
    if !stderr.trim().is_empty() {
        formatted.push_str(&format!("\n--- stderr:\n{}", stderr.trim_end()));
    }
    formatted
}

fn index_of(list: &[String], search: &str) -> Option<usize> {
    if search.is_empty() {
        return None;
    }
    list.iter().position(|v| v == search)
}

/// Directory of the first existing manifest file.
fn basedir(paths: &[PathBuf]) -> PathBuf {
    for path in paths {
        if path.exists() {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            if parent.as_os_str().is_empty() {
                return PathBuf::from(".");
            }
            return parent.to_path_buf();
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
