//! Manifest schema types for stacks and components.
//!
//! Defines the YAML schema for stack and component manifests: component
//! references, lifecycle, parameters, outputs, and ready conditions.
//! All types derive Serialize/Deserialize for YAML roundtripping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Where a component's implementation lives. Only local directories are
/// supported; sources are assumed already fetched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceLocation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
}

/// Manifest metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub brief: String,

    #[serde(default, skip_serializing_if = "source_is_empty")]
    pub source: SourceLocation,
}

fn source_is_empty(s: &SourceLocation) -> bool {
    s.dir.is_empty()
}

/// Reference to a component within a stack manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentRef {
    pub name: String,

    #[serde(default, skip_serializing_if = "source_is_empty")]
    pub source: SourceLocation,

    /// Upstream components whose outputs this component consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
}

/// Capabilities provided by the platform the stack lands on, as opposed
/// to capabilities deployed by the stack itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
}

/// Tuning of `requires` checking: entries are either `capability`
/// (optional everywhere), `capability:component`, or a dotted parameter
/// name whose false value disables a component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequiresTuning {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional: Vec<String>,
}

/// A probe that gates success of a component or stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadyCondition {
    /// Hostname that must resolve.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns: String,

    /// URL that must answer 2xx/3xx to a GET.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Total probe budget in seconds.
    #[serde(default, rename = "waitSeconds", skip_serializing_if = "is_zero")]
    pub wait_seconds: u64,

    /// Pause between probes in seconds; with no dns/url this is a fixed delay.
    #[serde(default, rename = "pauseSeconds", skip_serializing_if = "is_zero")]
    pub pause_seconds: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Lifecycle block of a stack or component manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lifecycle {
    /// "allow" permits silent skip when no implementation exists.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bare: String,

    /// Extension verbs recognized beyond deploy/undeploy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verbs: Vec<String>,

    /// Canonical traversal order; must be a topological extension of the
    /// `depends` graph.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mandatory: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional: Vec<String>,

    #[serde(default, skip_serializing_if = "tuning_is_empty")]
    pub requires: RequiresTuning,

    #[serde(
        default,
        rename = "readyConditions",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ready_conditions: Vec<ReadyCondition>,
}

fn tuning_is_empty(t: &RequiresTuning) -> bool {
    t.optional.is_empty()
}

/// A declared output of a component or stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Output {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub brief: String,

    /// Literal value, possibly containing `${ref}` substitutions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_yaml_ng::Value>,

    /// Read the value from the component's terraform.tfstate instead of stdout.
    #[serde(default, rename = "fromTfVar", skip_serializing_if = "String::is_empty")]
    pub from_tf_var: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

/// A declared parameter, possibly nested.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,

    /// Target a specific component instance.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub brief: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_yaml_ng::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_yaml_ng::Value>,

    /// "allow" permits locking to an empty value.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub empty: String,

    #[serde(default, rename = "fromEnv", skip_serializing_if = "String::is_empty")]
    pub from_env: String,

    #[serde(default, rename = "fromFile", skip_serializing_if = "String::is_empty")]
    pub from_file: String,

    /// Environment variable the value is exposed through on invocation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env: String,

    /// Nested parameters; flattened as `parent.child` by the parser.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

impl Parameter {
    pub fn qname(&self) -> String {
        parameter_qname(&self.name, &self.component)
    }
}

/// Files in a component's source tree rendered with parameter values
/// before invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateSetup {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

/// A stack or component manifest. The same schema serves both; `kind`
/// distinguishes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub version: u32,

    pub kind: String,

    pub meta: Metadata,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,

    #[serde(default, skip_serializing_if = "platform_is_empty")]
    pub platform: PlatformMetadata,

    #[serde(default)]
    pub lifecycle: Lifecycle,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Output>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    #[serde(default, skip_serializing_if = "templates_is_empty")]
    pub templates: TemplateSetup,
}

fn platform_is_empty(p: &PlatformMetadata) -> bool {
    p.provides.is_empty()
}

fn templates_is_empty(t: &TemplateSetup) -> bool {
    t.files.is_empty()
}

impl Manifest {
    /// Find a component reference by name.
    pub fn component_ref(&self, name: &str) -> Option<&ComponentRef> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Qualified parameter name: `name|component` when component is set.
pub fn parameter_qname(name: &str, component: &str) -> String {
    if component.is_empty() {
        name.to_string()
    } else {
        format!("{}|{}", name, component)
    }
}

/// Qualified output name: `component|name`.
pub fn output_qname(component: &str, name: &str) -> String {
    format!("{}|{}", component, name)
}

/// Split a qualified name on the first `|`.
pub fn split_qname(qname: &str) -> (&str, &str) {
    match qname.split_once('|') {
        Some((head, tail)) => (head, tail),
        None => (qname, ""),
    }
}

/// Stack name truncated at the first `:` (instance qualifier).
pub fn plain_name(name: &str) -> &str {
    match name.split_once(':') {
        Some((head, _)) => head,
        None => name,
    }
}

/// Resolve the source directory for a component.
pub fn component_source_dir(
    component: &ComponentRef,
    stack_base_dir: &Path,
    components_base_dir: &Path,
) -> PathBuf {
    let dir = &component.source.dir;
    if dir.is_empty() {
        return components_base_dir.join(&component.name);
    }
    let path = Path::new(dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else if components_base_dir == stack_base_dir {
        stack_base_dir.join(path)
    } else {
        components_base_dir.join(path)
    }
}

/// Convert a YAML scalar to its parameter-value string form.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

/// Verbs always recognized regardless of `lifecycle.verbs`.
pub const BUILTIN_VERBS: [&str; 2] = ["deploy", "undeploy"];

/// Past tense of a verb, for component and stack status.
pub fn verb_past(verb: &str) -> String {
    format!("{}ed", verb)
}

/// Present participle of a verb, for in-flight status.
pub fn verb_active(verb: &str) -> String {
    format!("{}ing", verb)
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_stack_manifest_parse() {
        let yaml = r#"
version: 1
kind: stack
meta:
  name: wordpress:1
components:
  - name: storage
    source:
      dir: components/storage
  - name: database
    source:
      dir: components/database
    depends: [storage]
requires: [kubernetes]
lifecycle:
  order: [storage, database]
  optional: [database]
  readyConditions:
    - url: http://example.com/healthz
      waitSeconds: 600
      pauseSeconds: 10
parameters:
  - name: dns.domain
    env: DOMAIN
    fromEnv: DOMAIN
outputs:
  - name: database.endpoint
"#;
        let m: Manifest = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(m.kind, "stack");
        assert_eq!(m.meta.name, "wordpress:1");
        assert_eq!(m.components.len(), 2);
        assert_eq!(m.components[1].depends, vec!["storage"]);
        assert_eq!(m.lifecycle.order, vec!["storage", "database"]);
        assert_eq!(m.lifecycle.ready_conditions[0].wait_seconds, 600);
        assert_eq!(m.parameters[0].from_env, "DOMAIN");
    }

    #[test]
    fn test_types_nested_parameters_parse() {
        let yaml = r#"
kind: component
meta:
  name: database
parameters:
  - name: database
    parameters:
      - name: user
        env: DB_USER
      - name: password
        env: DB_PASSWORD
"#;
        let m: Manifest = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(m.parameters[0].parameters.len(), 2);
    }

    #[test]
    fn test_types_qname_roundtrip() {
        assert_eq!(parameter_qname("dns.domain", ""), "dns.domain");
        assert_eq!(parameter_qname("flavor", "database"), "flavor|database");
        assert_eq!(split_qname("flavor|database"), ("flavor", "database"));
        assert_eq!(split_qname("dns.domain"), ("dns.domain", ""));
        assert_eq!(output_qname("database", "endpoint"), "database|endpoint");
    }

    #[test]
    fn test_types_plain_name() {
        assert_eq!(plain_name("wordpress:1"), "wordpress");
        assert_eq!(plain_name("wordpress"), "wordpress");
        assert_eq!(plain_name(""), "");
    }

    #[test]
    fn test_types_component_source_dir() {
        let c = ComponentRef {
            name: "database".to_string(),
            source: SourceLocation {
                dir: "components/database".to_string(),
            },
            depends: vec![],
        };
        let dir = component_source_dir(&c, Path::new("/stack"), Path::new("/stack"));
        assert_eq!(dir, PathBuf::from("/stack/components/database"));

        let bare = ComponentRef {
            name: "cache".to_string(),
            ..Default::default()
        };
        let dir = component_source_dir(&bare, Path::new("/stack"), Path::new("/components"));
        assert_eq!(dir, PathBuf::from("/components/cache"));
    }

    #[test]
    fn test_types_verb_forms() {
        assert_eq!(verb_past("deploy"), "deployed");
        assert_eq!(verb_active("undeploy"), "undeploying");
    }

    #[test]
    fn test_types_yaml_value_to_string() {
        assert_eq!(
            yaml_value_to_string(&serde_yaml_ng::Value::String("x".into())),
            "x"
        );
        assert_eq!(yaml_value_to_string(&serde_yaml_ng::Value::Bool(false)), "false");
        assert_eq!(yaml_value_to_string(&serde_yaml_ng::Value::Null), "");
    }

    #[test]
    fn test_types_manifest_serialize_skips_empty() {
        let m = Manifest {
            kind: "component".to_string(),
            meta: Metadata {
                name: "storage".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let yaml = serde_yaml_ng::to_string(&m).unwrap();
        assert!(!yaml.contains("components:"));
        assert!(!yaml.contains("requires:"));
        assert!(!yaml.contains("outputs:"));
    }
}
