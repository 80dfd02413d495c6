//! Parameter store: locking, `${ref}` expansion, captured outputs.
//!
//! Stack parameters are locked once per operation using the precedence
//! explicit override > manifest value > fromEnv > fromFile > state
//! (undeploy) > default > interactive prompt. Component parameters are
//! expanded on top of the locked stack set against upstream captured
//! outputs. References expand to fixpoint with a bounded depth.

use super::types::*;
use crate::warn::WarningSink;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::IsTerminal;

/// Maximum number of substitution passes before a cycle is assumed.
pub const MAX_EXPANSION_DEPTH: usize = 16;

/// Values considered false for optional-parameter gates.
pub const FALSE_PARAMETER_VALUES: [&str; 5] = ["", "false", "0", "no", "(unknown)"];

/// A parameter after resolution, expansion, and binding to a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockedParameter {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component: String,

    pub value: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env: String,
}

impl LockedParameter {
    pub fn qname(&self) -> String {
        parameter_qname(&self.name, &self.component)
    }
}

/// Locked parameters keyed by qualified name, insertion-ordered.
pub type LockedParameters = IndexMap<String, LockedParameter>;

/// A value produced by a component, addressable downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub name: String,

    /// Component of origin.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component: String,

    pub value: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

impl CapturedOutput {
    pub fn qname(&self) -> String {
        output_qname(&self.component, &self.name)
    }
}

/// Captured outputs keyed by `component|name`.
pub type CapturedOutputs = IndexMap<String, CapturedOutput>;

/// A stack-level output after expansion, as persisted in state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpandedOutput {
    pub name: String,

    pub value: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub brief: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

/// Insert a locked parameter keyed by its qualified name.
pub fn insert_locked(params: &mut LockedParameters, parameter: LockedParameter) {
    params.insert(parameter.qname(), parameter);
}

/// Merge an overlay of locked parameters over a base set. Overlay wins.
pub fn merge_parameters(base: &LockedParameters, overlay: &[LockedParameter]) -> LockedParameters {
    let mut merged = base.clone();
    for p in overlay {
        merged.insert(p.qname(), p.clone());
    }
    merged
}

/// Merge captured outputs; newer values win.
pub fn merge_outputs(into: &mut CapturedOutputs, outputs: &CapturedOutputs) {
    for (qname, output) in outputs {
        into.insert(qname.clone(), output.clone());
    }
}

/// Flatten nested parameter declarations into dotted names. A child
/// inherits the parent's `component` unless it sets its own.
pub fn flatten_parameters(declared: &[Parameter]) -> Vec<Parameter> {
    let mut flat = Vec::new();
    for p in declared {
        flatten_into(p, "", "", &mut flat);
    }
    flat
}

fn flatten_into(p: &Parameter, prefix: &str, component: &str, flat: &mut Vec<Parameter>) {
    let name = if prefix.is_empty() {
        p.name.clone()
    } else {
        format!("{}.{}", prefix, p.name)
    };
    let component = if p.component.is_empty() {
        component.to_string()
    } else {
        p.component.clone()
    };
    if p.parameters.is_empty() {
        let mut leaf = p.clone();
        leaf.name = name;
        leaf.component = component;
        flat.push(leaf);
    } else {
        for child in &p.parameters {
            flatten_into(child, &name, &component, flat);
        }
    }
}

/// Parse `NAME=VALUE` pairs from `--environment` flags. A single flag
/// may carry several comma-separated pairs.
pub fn parse_kv_list(entries: &[String]) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for entry in entries {
        for pair in entry.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("`{}` is not a NAME=VALUE pair", pair))?;
            map.insert(key.trim().to_string(), value.to_string());
        }
    }
    Ok(map)
}

// ============================================================================
// Expansion
// ============================================================================

/// Everything a `${ref}` may resolve against.
pub struct ExpansionContext<'a> {
    pub parameters: &'a LockedParameters,
    pub outputs: &'a CapturedOutputs,
    pub environment: &'a HashMap<String, String>,
    /// Current component, or empty for stack-level expansion.
    pub component: &'a str,
    pub depends: &'a [String],
}

fn resolve_ref(reference: &str, ctx: &ExpansionContext) -> Option<String> {
    if reference.contains('|') {
        // `component|name` output reference; also accept a parameter's
        // own `name|component` qualified form.
        if let Some(output) = ctx.outputs.get(reference) {
            return Some(output.value.clone());
        }
        return ctx.parameters.get(reference).map(|p| p.value.clone());
    }

    if !ctx.component.is_empty() {
        let qualified = parameter_qname(reference, ctx.component);
        if let Some(p) = ctx.parameters.get(&qualified) {
            return Some(p.value.clone());
        }
    }
    if let Some(p) = ctx.parameters.get(reference) {
        return Some(p.value.clone());
    }

    // Outputs of upstream depends first, then a unique match anywhere.
    for dep in ctx.depends {
        if let Some(output) = ctx.outputs.get(&output_qname(dep, reference)) {
            return Some(output.value.clone());
        }
    }
    let mut matches = ctx.outputs.values().filter(|o| o.name == reference);
    if let Some(first) = matches.next() {
        if matches.next().is_none() {
            return Some(first.value.clone());
        }
    }

    ctx.environment.get(reference).cloned()
}

/// Expand `${ref}` substitutions in a string until fixpoint. Unresolved
/// references and expansion past the depth bound (a cycle) are errors.
pub fn expand_string(raw: &str, ctx: &ExpansionContext) -> Result<String, Vec<String>> {
    let mut current = raw.to_string();
    for _ in 0..MAX_EXPANSION_DEPTH {
        if !current.contains("${") {
            return Ok(current);
        }
        let (next, unresolved) = expand_pass(&current, ctx);
        if !unresolved.is_empty() {
            return Err(unresolved
                .into_iter()
                .map(|r| format!("unresolved reference `${{{}}}`", r))
                .collect());
        }
        if next == current {
            // Only unterminated `${` left — keep it literal.
            return Ok(next);
        }
        current = next;
    }
    Err(vec![format!(
        "expansion of `{}` did not converge after {} passes (reference cycle?)",
        raw, MAX_EXPANSION_DEPTH
    )])
}

/// One substitution pass. Returns the rewritten string and any
/// references that could not be resolved.
fn expand_pass(input: &str, ctx: &ExpansionContext) -> (String, Vec<String>) {
    let mut result = String::with_capacity(input.len());
    let mut unresolved = Vec::new();
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        result.push_str(&rest[..open]);
        let tail = &rest[open + 2..];
        match tail.find('}') {
            Some(close) => {
                let reference = tail[..close].trim();
                match resolve_ref(reference, ctx) {
                    Some(value) => result.push_str(&value),
                    None => unresolved.push(reference.to_string()),
                }
                rest = &tail[close + 1..];
            }
            None => {
                // Unterminated `${` — keep the literal remainder.
                result.push_str(&rest[open..]);
                rest = "";
                break;
            }
        }
    }
    result.push_str(rest);
    (result, unresolved)
}

// ============================================================================
// Locking
// ============================================================================

/// Inputs to stack parameter locking.
pub struct LockContext<'a> {
    /// Explicit `--environment NAME=VALUE` overrides.
    pub environment: &'a HashMap<String, String>,
    /// Parameter values recovered from state (undeploy only), by qname.
    pub state_values: HashMap<String, String>,
    /// Prompt on a terminal for otherwise-unresolved parameters.
    pub interactive: bool,
    pub verbose: bool,
}

/// Lock stack-level parameters in declaration order. `extra` values
/// (e.g. the deployment id) participate in expansion without being
/// locked themselves. Errors are aggregated across all parameters.
pub fn lock_parameters(
    declared: &[Parameter],
    extra: &[LockedParameter],
    ctx: &LockContext,
) -> Result<LockedParameters, Vec<String>> {
    let mut locked = LockedParameters::new();
    let mut errors = Vec::new();
    let no_outputs = CapturedOutputs::new();

    for p in declared {
        let qname = p.qname();
        let raw = resolve_parameter_value(p, &qname, ctx);

        let raw = match raw {
            Some(v) => v,
            None => {
                if p.empty == "allow" {
                    String::new()
                } else {
                    errors.push(format!("parameter `{}` has no value", qname));
                    continue;
                }
            }
        };

        let mut expansion_base = locked.clone();
        for e in extra {
            expansion_base.entry(e.qname()).or_insert_with(|| e.clone());
        }
        let expansion = ExpansionContext {
            parameters: &expansion_base,
            outputs: &no_outputs,
            environment: ctx.environment,
            component: &p.component,
            depends: &[],
        };
        let value = match expand_string(&raw, &expansion) {
            Ok(v) => v,
            Err(errs) => {
                for e in errs {
                    errors.push(format!("parameter `{}`: {}", qname, e));
                }
                continue;
            }
        };

        if value.is_empty() && p.empty != "allow" {
            errors.push(format!("parameter `{}` resolved to an empty value", qname));
            continue;
        }

        if ctx.verbose && !value.is_empty() {
            let shown = if looks_like_secret(&qname) {
                "(masked)"
            } else {
                value.as_str()
            };
            eprintln!("Locked `{}` = `{}`", qname, shown);
        }
        insert_locked(
            &mut locked,
            LockedParameter {
                name: p.name.clone(),
                component: p.component.clone(),
                value,
                env: p.env.clone(),
            },
        );
    }

    if errors.is_empty() {
        Ok(locked)
    } else {
        Err(errors)
    }
}

/// Resolve a parameter's raw value by precedence. None means no source
/// produced a value.
fn resolve_parameter_value(p: &Parameter, qname: &str, ctx: &LockContext) -> Option<String> {
    if let Some(v) = ctx.environment.get(qname).or_else(|| ctx.environment.get(&p.name)) {
        return Some(v.clone());
    }
    if let Some(ref v) = p.value {
        return Some(yaml_value_to_string(v));
    }
    if !p.from_env.is_empty() {
        if let Ok(v) = std::env::var(&p.from_env) {
            return Some(v);
        }
    }
    if !p.from_file.is_empty() {
        if let Ok(content) = std::fs::read_to_string(&p.from_file) {
            return Some(content.trim().to_string());
        }
    }
    if let Some(v) = ctx.state_values.get(qname) {
        return Some(v.clone());
    }
    if let Some(ref v) = p.default {
        return Some(yaml_value_to_string(v));
    }
    if ctx.interactive {
        return ask_on_terminal(qname);
    }
    None
}

fn ask_on_terminal(prompt: &str) -> Option<String> {
    if !std::io::stdin().is_terminal() {
        return None;
    }
    print!("{}: ", prompt);
    use std::io::Write;
    let _ = std::io::stdout().flush();
    let mut input = String::new();
    match std::io::stdin().read_line(&mut input) {
        Ok(read) if read > 0 && !input.trim().is_empty() => Some(input.trim().to_string()),
        _ => None,
    }
}

/// Expand a component's declared parameters on top of the locked stack
/// set. Returns the component's own locked parameters (declaration
/// order); errors are aggregated.
pub fn expand_parameters(
    component: &str,
    depends: &[String],
    stack_parameters: &LockedParameters,
    outputs: &CapturedOutputs,
    declared: &[Parameter],
    environment: &HashMap<String, String>,
) -> Result<Vec<LockedParameter>, Vec<String>> {
    let mut expanded: Vec<LockedParameter> = Vec::new();
    let mut errors = Vec::new();

    for p in declared {
        // A declaration targeting another component instance is not ours.
        if !p.component.is_empty() && p.component != component {
            continue;
        }
        let qname = parameter_qname(&p.name, component);

        let raw = environment
            .get(&qname)
            .or_else(|| environment.get(&p.name))
            .cloned()
            .or_else(|| p.value.as_ref().map(yaml_value_to_string))
            .or_else(|| {
                stack_parameters
                    .get(&qname)
                    .or_else(|| stack_parameters.get(&p.name))
                    .map(|sp| sp.value.clone())
            })
            .or_else(|| {
                if p.from_env.is_empty() {
                    None
                } else {
                    std::env::var(&p.from_env).ok()
                }
            })
            .or_else(|| p.default.as_ref().map(yaml_value_to_string));

        let raw = match raw {
            Some(v) => v,
            None => {
                if p.empty == "allow" {
                    String::new()
                } else {
                    errors.push(format!(
                        "component `{}` parameter `{}` has no value",
                        component, p.name
                    ));
                    continue;
                }
            }
        };

        let base = merge_parameters(stack_parameters, &expanded);
        let ctx = ExpansionContext {
            parameters: &base,
            outputs,
            environment,
            component,
            depends,
        };
        match expand_string(&raw, &ctx) {
            Ok(value) => expanded.push(LockedParameter {
                name: p.name.clone(),
                component: component.to_string(),
                value,
                env: p.env.clone(),
            }),
            Err(errs) => {
                for e in errs {
                    errors.push(format!(
                        "component `{}` parameter `{}`: {}",
                        component, p.name, e
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(expanded)
    } else {
        Err(errors)
    }
}

/// Expand declared stack outputs against parameters and captured
/// outputs. Best-effort: an output that cannot be resolved is skipped
/// with a warning.
pub fn expand_requested_outputs(
    parameters: &LockedParameters,
    outputs: &CapturedOutputs,
    declared: &[Output],
    sink: &mut WarningSink,
) -> Vec<ExpandedOutput> {
    let mut result = Vec::new();
    let environment = HashMap::new();
    for output in declared {
        let ctx = ExpansionContext {
            parameters,
            outputs,
            environment: &environment,
            component: "",
            depends: &[],
        };
        let resolved = match output.value {
            Some(ref v) => expand_string(&yaml_value_to_string(v), &ctx).ok(),
            None => resolve_ref(&output.name, &ctx),
        };
        match resolved {
            Some(value) => result.push(ExpandedOutput {
                name: output.name.clone(),
                value,
                brief: output.brief.clone(),
                kind: output.kind.clone(),
            }),
            None => sink.warn(format!("unable to expand stack output `{}`", output.name)),
        }
    }
    result
}

// ============================================================================
// Secrets
// ============================================================================

const SECRET_SUFFIXES: [&str; 4] = [".password", ".secret", ".key", ".cert"];
const NOT_A_SECRET: [&str; 1] = ["cloud.sshKey"];

/// Should this parameter's value be masked in diagnostics?
pub fn looks_like_secret(qname: &str) -> bool {
    let (name, _) = split_qname(qname);
    if NOT_A_SECRET.contains(&name) {
        return false;
    }
    SECRET_SUFFIXES.iter().any(|suf| name.ends_with(suf))
}

/// Render locked parameters for diagnostics, masking secrets.
pub fn print_locked_parameters(params: &LockedParameters) {
    let mut qnames: Vec<&String> = params.keys().collect();
    qnames.sort();
    for qname in qnames {
        let p = &params[qname.as_str()];
        let value = if looks_like_secret(qname) {
            "(masked)"
        } else {
            p.value.as_str()
        };
        eprintln!("  {} = `{}`", qname, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locked(name: &str, value: &str) -> LockedParameter {
        LockedParameter {
            name: name.to_string(),
            component: String::new(),
            value: value.to_string(),
            env: String::new(),
        }
    }

    fn output(component: &str, name: &str, value: &str) -> CapturedOutput {
        CapturedOutput {
            name: name.to_string(),
            component: component.to_string(),
            value: value.to_string(),
            kind: String::new(),
        }
    }

    fn param(name: &str) -> Parameter {
        Parameter {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn lock_ctx(environment: &HashMap<String, String>) -> LockContext {
        LockContext {
            environment,
            state_values: HashMap::new(),
            interactive: false,
            verbose: false,
        }
    }

    #[test]
    fn test_params_flatten_nested() {
        let yaml = r#"
- name: database
  parameters:
    - name: user
      env: DB_USER
    - name: admin
      parameters:
        - name: password
          env: DB_ADMIN_PASSWORD
"#;
        let declared: Vec<Parameter> = serde_yaml_ng::from_str(yaml).unwrap();
        let flat = flatten_parameters(&declared);
        let names: Vec<&str> = flat.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["database.user", "database.admin.password"]);
        assert_eq!(flat[0].env, "DB_USER");
    }

    #[test]
    fn test_params_flatten_inherits_component() {
        let mut parent = param("database");
        parent.component = "db".to_string();
        parent.parameters = vec![param("user")];
        let flat = flatten_parameters(&[parent]);
        assert_eq!(flat[0].component, "db");
        assert_eq!(flat[0].qname(), "database.user|db");
    }

    #[test]
    fn test_params_lock_precedence_override_beats_default() {
        let mut p = param("dns.domain");
        p.default = Some(serde_yaml_ng::Value::String("default.example.com".into()));
        let mut environment = HashMap::new();
        environment.insert("dns.domain".to_string(), "override.example.com".to_string());
        let locked =
            lock_parameters(&[p], &[], &lock_ctx(&environment)).unwrap();
        assert_eq!(locked["dns.domain"].value, "override.example.com");
    }

    #[test]
    fn test_params_lock_from_env() {
        std::env::set_var("STACKSMITH_TEST_FROM_ENV", "from-env-value");
        let mut p = param("cloud.region");
        p.from_env = "STACKSMITH_TEST_FROM_ENV".to_string();
        p.default = Some(serde_yaml_ng::Value::String("fallback".into()));
        let environment = HashMap::new();
        let locked = lock_parameters(&[p], &[], &lock_ctx(&environment)).unwrap();
        assert_eq!(locked["cloud.region"].value, "from-env-value");
        std::env::remove_var("STACKSMITH_TEST_FROM_ENV");
    }

    #[test]
    fn test_params_lock_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("token");
        std::fs::write(&file, "  sekret\n").unwrap();
        let mut p = param("api.token");
        p.from_file = file.to_str().unwrap().to_string();
        let environment = HashMap::new();
        let locked = lock_parameters(&[p], &[], &lock_ctx(&environment)).unwrap();
        assert_eq!(locked["api.token"].value, "sekret");
    }

    #[test]
    fn test_params_lock_state_value_for_undeploy() {
        let p = param("dns.domain");
        let environment = HashMap::new();
        let mut ctx = lock_ctx(&environment);
        ctx.state_values
            .insert("dns.domain".to_string(), "recovered.example.com".to_string());
        let locked = lock_parameters(&[p], &[], &ctx).unwrap();
        assert_eq!(locked["dns.domain"].value, "recovered.example.com");
    }

    #[test]
    fn test_params_lock_errors_aggregate() {
        let environment = HashMap::new();
        let result = lock_parameters(&[param("one"), param("two")], &[], &lock_ctx(&environment));
        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("`one`"));
        assert!(errors[1].contains("`two`"));
    }

    #[test]
    fn test_params_lock_empty_allow() {
        let mut p = param("notes");
        p.empty = "allow".to_string();
        let environment = HashMap::new();
        let locked = lock_parameters(&[p], &[], &lock_ctx(&environment)).unwrap();
        assert_eq!(locked["notes"].value, "");
    }

    #[test]
    fn test_params_lock_expands_earlier_parameters() {
        let mut base = param("dns.domain");
        base.value = Some(serde_yaml_ng::Value::String("example.com".into()));
        let mut derived = param("api.url");
        derived.value = Some(serde_yaml_ng::Value::String(
            "https://api.${dns.domain}".into(),
        ));
        let environment = HashMap::new();
        let locked =
            lock_parameters(&[base, derived], &[], &lock_ctx(&environment)).unwrap();
        assert_eq!(locked["api.url"].value, "https://api.example.com");
    }

    #[test]
    fn test_params_lock_expands_extra_values() {
        let mut p = param("bucket.name");
        p.value = Some(serde_yaml_ng::Value::String("${hub.stackName}-files".into()));
        let extra = vec![locked("hub.stackName", "wordpress")];
        let environment = HashMap::new();
        let result = lock_parameters(&[p], &extra, &lock_ctx(&environment)).unwrap();
        assert_eq!(result["bucket.name"].value, "wordpress-files");
        // Extra values are not locked themselves.
        assert!(!result.contains_key("hub.stackName"));
    }

    #[test]
    fn test_params_expand_unresolved_reference() {
        let mut p = param("broken");
        p.value = Some(serde_yaml_ng::Value::String("${no.such.thing}".into()));
        let environment = HashMap::new();
        let errors =
            lock_parameters(&[p], &[], &lock_ctx(&environment)).unwrap_err();
        assert!(errors[0].contains("unresolved reference `${no.such.thing}`"));
    }

    #[test]
    fn test_params_expand_cycle_detected() {
        let mut params = LockedParameters::new();
        insert_locked(&mut params, locked("a", "${b}"));
        insert_locked(&mut params, locked("b", "${a}"));
        let outputs = CapturedOutputs::new();
        let environment = HashMap::new();
        let ctx = ExpansionContext {
            parameters: &params,
            outputs: &outputs,
            environment: &environment,
            component: "",
            depends: &[],
        };
        let errors = expand_string("${a}", &ctx).unwrap_err();
        assert!(errors[0].contains("did not converge"));
    }

    #[test]
    fn test_params_expand_output_reference() {
        let params = LockedParameters::new();
        let mut outputs = CapturedOutputs::new();
        let o = output("database", "endpoint", "db.internal:5432");
        outputs.insert(o.qname(), o);
        let environment = HashMap::new();
        let ctx = ExpansionContext {
            parameters: &params,
            outputs: &outputs,
            environment: &environment,
            component: "app",
            depends: &[],
        };
        assert_eq!(
            expand_string("postgres://${database|endpoint}/app", &ctx).unwrap(),
            "postgres://db.internal:5432/app"
        );
    }

    #[test]
    fn test_params_expand_depends_output_unqualified() {
        let params = LockedParameters::new();
        let mut outputs = CapturedOutputs::new();
        for (component, value) in [("database", "db:5432"), ("cache", "cache:6379")] {
            let o = output(component, "endpoint", value);
            outputs.insert(o.qname(), o);
        }
        let environment = HashMap::new();
        let depends = vec!["cache".to_string()];
        let ctx = ExpansionContext {
            parameters: &params,
            outputs: &outputs,
            environment: &environment,
            component: "app",
            depends: &depends,
        };
        // Ambiguous across all outputs, but depends disambiguates.
        assert_eq!(expand_string("${endpoint}", &ctx).unwrap(), "cache:6379");
    }

    #[test]
    fn test_params_expand_component_qualified_parameter_wins() {
        let mut params = LockedParameters::new();
        insert_locked(&mut params, locked("flavor", "plain"));
        insert_locked(
            &mut params,
            LockedParameter {
                name: "flavor".to_string(),
                component: "database".to_string(),
                value: "fancy".to_string(),
                env: String::new(),
            },
        );
        let outputs = CapturedOutputs::new();
        let environment = HashMap::new();
        let ctx = ExpansionContext {
            parameters: &params,
            outputs: &outputs,
            environment: &environment,
            component: "database",
            depends: &[],
        };
        assert_eq!(expand_string("${flavor}", &ctx).unwrap(), "fancy");
    }

    #[test]
    fn test_params_expand_parameters_for_component() {
        let mut stack = LockedParameters::new();
        insert_locked(&mut stack, locked("dns.domain", "example.com"));
        let mut outputs = CapturedOutputs::new();
        let o = output("storage", "bucket", "files-bucket");
        outputs.insert(o.qname(), o);

        let mut url = param("app.url");
        url.value = Some(serde_yaml_ng::Value::String(
            "https://app.${dns.domain}/${storage|bucket}".into(),
        ));
        url.env = "APP_URL".to_string();

        let environment = HashMap::new();
        let depends = vec!["storage".to_string()];
        let expanded =
            expand_parameters("app", &depends, &stack, &outputs, &[url], &environment).unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].value, "https://app.example.com/files-bucket");
        assert_eq!(expanded[0].component, "app");
        assert_eq!(expanded[0].env, "APP_URL");
    }

    #[test]
    fn test_params_expand_parameters_inherits_stack_value() {
        let mut stack = LockedParameters::new();
        insert_locked(&mut stack, locked("dns.domain", "example.com"));
        let outputs = CapturedOutputs::new();
        let environment = HashMap::new();
        let expanded = expand_parameters(
            "app",
            &[],
            &stack,
            &outputs,
            &[param("dns.domain")],
            &environment,
        )
        .unwrap();
        assert_eq!(expanded[0].value, "example.com");
    }

    #[test]
    fn test_params_expand_parameters_skips_other_component() {
        let stack = LockedParameters::new();
        let outputs = CapturedOutputs::new();
        let environment = HashMap::new();
        let mut p = param("flavor");
        p.component = "other".to_string();
        p.value = Some(serde_yaml_ng::Value::String("x".into()));
        let expanded =
            expand_parameters("app", &[], &stack, &outputs, &[p], &environment).unwrap();
        assert!(expanded.is_empty());
    }

    #[test]
    fn test_params_expand_parameters_error_names_component() {
        let stack = LockedParameters::new();
        let outputs = CapturedOutputs::new();
        let environment = HashMap::new();
        let mut p = param("app.url");
        p.value = Some(serde_yaml_ng::Value::String("${database|endpoint}".into()));
        let errors =
            expand_parameters("app", &[], &stack, &outputs, &[p], &environment).unwrap_err();
        assert!(errors[0].contains("component `app`"));
        assert!(errors[0].contains("unresolved reference `${database|endpoint}`"));
    }

    #[test]
    fn test_params_expand_requested_outputs() {
        let mut params = LockedParameters::new();
        insert_locked(&mut params, locked("dns.domain", "example.com"));
        let mut outputs = CapturedOutputs::new();
        let o = output("database", "database.endpoint", "db:5432");
        outputs.insert(o.qname(), o);

        let declared = vec![
            Output {
                name: "database.endpoint".to_string(),
                ..Default::default()
            },
            Output {
                name: "stack.url".to_string(),
                value: Some(serde_yaml_ng::Value::String("https://${dns.domain}".into())),
                ..Default::default()
            },
            Output {
                name: "missing.output".to_string(),
                ..Default::default()
            },
        ];
        let mut sink = WarningSink::new();
        let expanded = expand_requested_outputs(&params, &outputs, &declared, &mut sink);
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].value, "db:5432");
        assert_eq!(expanded[1].value, "https://example.com");
        assert!(!sink.is_empty());
    }

    #[test]
    fn test_params_parse_kv_list() {
        let parsed = parse_kv_list(&[
            "dns.domain=example.com".to_string(),
            "a=1,b=2".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed["dns.domain"], "example.com");
        assert_eq!(parsed["a"], "1");
        assert_eq!(parsed["b"], "2");
        assert!(parse_kv_list(&["broken".to_string()]).is_err());
    }

    #[test]
    fn test_params_looks_like_secret() {
        assert!(looks_like_secret("database.password"));
        assert!(looks_like_secret("tls.cert|ingress"));
        assert!(looks_like_secret("signing.key"));
        assert!(!looks_like_secret("cloud.sshKey"));
        assert!(!looks_like_secret("dns.domain"));
    }

    #[test]
    fn test_params_merge_outputs_later_wins() {
        let mut all = CapturedOutputs::new();
        let first = output("a", "x", "1");
        all.insert(first.qname(), first);
        let mut newer = CapturedOutputs::new();
        let second = output("a", "x", "2");
        newer.insert(second.qname(), second);
        merge_outputs(&mut all, &newer);
        assert_eq!(all["a|x"].value, "2");
    }

    #[test]
    fn test_params_unterminated_reference_kept_literal() {
        let params = LockedParameters::new();
        let outputs = CapturedOutputs::new();
        let environment = HashMap::new();
        let ctx = ExpansionContext {
            parameters: &params,
            outputs: &outputs,
            environment: &environment,
            component: "",
            depends: &[],
        };
        assert_eq!(expand_string("broken ${ref", &ctx).unwrap(), "broken ${ref");
    }
}
