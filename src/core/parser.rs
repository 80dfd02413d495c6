//! Manifest parsing and validation.
//!
//! Parses stack manifests (optionally multi-document, with component
//! manifests appended) and validates structural constraints:
//! - every referenced component has a manifest
//! - lifecycle.order lists every component exactly once
//! - depends edges point to components earlier in the order
//! - mandatory and optional sets are disjoint
//! - lifecycle verbs are recognized

use super::types::*;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Verbs the engine knows how to dispatch.
pub const KNOWN_VERBS: [&str; 3] = ["deploy", "undeploy", "backup"];

/// Candidate manifest filename inside a component source directory.
const COMPONENT_MANIFEST_FILENAME: &str = "component.yaml";

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn err(errors: &mut Vec<ValidationError>, message: String) {
    errors.push(ValidationError { message });
}

/// Result of parsing a stack manifest and its component manifests.
#[derive(Debug)]
pub struct ParsedManifests {
    pub stack: Manifest,
    pub components: Vec<Manifest>,
    /// The manifest file that was actually read.
    pub filename: PathBuf,
}

/// Parse all YAML documents in a string.
pub fn parse_documents(content: &str) -> Result<Vec<Manifest>, String> {
    let mut docs = Vec::new();
    for document in serde_yaml_ng::Deserializer::from_str(content) {
        let manifest =
            Manifest::deserialize(document).map_err(|e| format!("YAML parse error: {}", e))?;
        docs.push(manifest);
    }
    if docs.is_empty() {
        return Err("no YAML documents found".to_string());
    }
    Ok(docs)
}

/// Parse the stack manifest from the first existing candidate file. The
/// first document must be the stack; any `kind: component` documents
/// that follow are collected as component manifests. Components whose
/// manifest is not embedded are loaded from `component.yaml` in their
/// source directory.
pub fn parse_manifests(
    filenames: &[PathBuf],
    stack_base_dir: &Path,
    components_base_dir: &Path,
) -> Result<ParsedManifests, String> {
    let filename = filenames
        .iter()
        .find(|f| f.exists())
        .ok_or_else(|| {
            format!(
                "no manifest found; tried: {}",
                filenames
                    .iter()
                    .map(|f| f.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })?
        .clone();

    let content = std::fs::read_to_string(&filename)
        .map_err(|e| format!("failed to read {}: {}", filename.display(), e))?;
    let mut docs = parse_documents(&content)
        .map_err(|e| format!("{}: {}", filename.display(), e))?;

    let stack = docs.remove(0);
    let mut components: Vec<Manifest> = docs
        .into_iter()
        .filter(|d| d.kind == "component")
        .collect();

    for component in &stack.components {
        if components.iter().any(|m| m.meta.name == component.name) {
            continue;
        }
        let dir = component_source_dir(component, stack_base_dir, components_base_dir);
        let candidate = dir.join(COMPONENT_MANIFEST_FILENAME);
        if !candidate.exists() {
            continue; // reported by validate_stack
        }
        let content = std::fs::read_to_string(&candidate)
            .map_err(|e| format!("failed to read {}: {}", candidate.display(), e))?;
        let mut docs = parse_documents(&content)
            .map_err(|e| format!("{}: {}", candidate.display(), e))?;
        let mut manifest = docs.remove(0);
        if manifest.meta.name.is_empty() {
            manifest.meta.name = component.name.clone();
        }
        components.push(manifest);
    }

    Ok(ParsedManifests {
        stack,
        components,
        filename,
    })
}

/// Find a component manifest by component reference.
pub fn component_manifest_by_ref<'a>(
    components: &'a [Manifest],
    component: &ComponentRef,
) -> Option<&'a Manifest> {
    components.iter().find(|m| m.meta.name == component.name)
}

/// Is `verb` dispatchable against this stack?
pub fn verb_supported(stack: &Manifest, verb: &str) -> bool {
    BUILTIN_VERBS.contains(&verb) || stack.lifecycle.verbs.iter().any(|v| v == verb)
}

/// Verify that every selector names a known component.
pub fn check_components_exist(stack: &Manifest, names: &[&str]) -> Result<(), String> {
    for name in names {
        if name.is_empty() {
            continue;
        }
        if stack.component_ref(name).is_none() {
            return Err(format!(
                "component `{}` is not defined in the stack manifest",
                name
            ));
        }
    }
    Ok(())
}

/// Validate a parsed stack against its component manifests. Returns a
/// list of errors (empty = valid).
pub fn validate_stack(stack: &Manifest, components: &[Manifest]) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if stack.kind != "stack" {
        err(
            &mut errors,
            format!("manifest kind must be \"stack\", got \"{}\"", stack.kind),
        );
    }
    if stack.meta.name.is_empty() {
        err(&mut errors, "stack name must not be empty".to_string());
    }
    if stack.components.is_empty() {
        err(&mut errors, "stack declares no components".to_string());
    }

    let order = &stack.lifecycle.order;
    let component_names: Vec<&str> = stack.components.iter().map(|c| c.name.as_str()).collect();

    // Every component appears in the order exactly once, and vice versa.
    for name in &component_names {
        match order.iter().filter(|o| o == name).count() {
            0 => err(
                &mut errors,
                format!("component `{}` is missing from lifecycle.order", name),
            ),
            1 => {}
            n => err(
                &mut errors,
                format!("component `{}` appears {} times in lifecycle.order", name, n),
            ),
        }
    }
    for name in order {
        if !component_names.contains(&name.as_str()) {
            err(
                &mut errors,
                format!("lifecycle.order names unknown component `{}`", name),
            );
        }
    }

    for verb in &stack.lifecycle.verbs {
        if !KNOWN_VERBS.contains(&verb.as_str()) {
            err(
                &mut errors,
                format!(
                    "lifecycle verb `{}` is not supported; known verbs: {}",
                    verb,
                    KNOWN_VERBS.join(", ")
                ),
            );
        }
    }

    for name in &stack.lifecycle.mandatory {
        if stack.lifecycle.optional.contains(name) {
            err(
                &mut errors,
                format!("component `{}` is both mandatory and optional", name),
            );
        }
        if !component_names.contains(&name.as_str()) {
            err(
                &mut errors,
                format!("lifecycle.mandatory names unknown component `{}`", name),
            );
        }
    }
    for name in &stack.lifecycle.optional {
        if !component_names.contains(&name.as_str()) {
            err(
                &mut errors,
                format!("lifecycle.optional names unknown component `{}`", name),
            );
        }
    }

    // depends must reference known components that precede the dependent.
    for component in &stack.components {
        let position = order.iter().position(|o| o == &component.name);
        for dep in &component.depends {
            if dep == &component.name {
                err(
                    &mut errors,
                    format!("component `{}` depends on itself", component.name),
                );
                continue;
            }
            if !component_names.contains(&dep.as_str()) {
                err(
                    &mut errors,
                    format!(
                        "component `{}` depends on unknown component `{}`",
                        component.name, dep
                    ),
                );
                continue;
            }
            let dep_position = order.iter().position(|o| o == dep);
            if let (Some(pos), Some(dep_pos)) = (position, dep_position) {
                if dep_pos > pos {
                    err(
                        &mut errors,
                        format!(
                            "component `{}` depends on `{}` which comes later in lifecycle.order",
                            component.name, dep
                        ),
                    );
                }
            }
        }

        if component_manifest_by_ref(components, component).is_none() {
            err(
                &mut errors,
                format!("component `{}` has no manifest", component.name),
            );
        }
    }

    // requires.optional `capability:component` entries must target known
    // components (or the `*` wildcard).
    for entry in &stack.lifecycle.requires.optional {
        if let Some((_, target)) = entry.split_once(':') {
            if target != "*" && !component_names.contains(&target) {
                err(
                    &mut errors,
                    format!(
                        "lifecycle.requires.optional `{}` targets unknown component `{}`",
                        entry, target
                    ),
                );
            }
        }
    }

    errors
}
