//! State manifest: the persisted record of an operation.
//!
//! The writer buffers a single snapshot and exposes transition methods;
//! `sync` flushes to every target path with an atomic temp-file +
//! rename. A `.lock` file per state path guards against concurrent
//! operations and is released on drop.

use super::params::{CapturedOutput, CapturedOutputs, ExpandedOutput, LockedParameter};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Capabilities by provider list; last entry is the effective provider.
pub type ProvidesMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateLifecycle {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
}

/// Per-component block of the state manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    pub status: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,

    /// Input parameters the component was invoked with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<LockedParameter>,

    /// `name = value` lines as read from stdout.
    #[serde(
        default,
        rename = "rawOutputs",
        skip_serializing_if = "IndexMap::is_empty"
    )]
    pub raw_outputs: IndexMap<String, String>,

    #[serde(
        default,
        rename = "capturedOutputs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub captured_outputs: Vec<CapturedOutput>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationPhase {
    pub component: String,
    pub status: String,
}

/// One run of a verb against the stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,

    pub operation: String,

    pub status: String,

    /// Argv snapshot of the invocation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    pub started: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finished: String,

    /// Per-component phases in encounter order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<OperationPhase>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

/// The whole persisted state document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateManifest {
    #[serde(default)]
    pub version: u32,

    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,

    pub meta: StateMetadata,

    #[serde(default, skip_serializing_if = "lifecycle_is_empty")]
    pub lifecycle: StateLifecycle,

    #[serde(
        default,
        rename = "stackParameters",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub stack_parameters: Vec<LockedParameter>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub components: IndexMap<String, ComponentState>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(
        default,
        rename = "stackOutputs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub stack_outputs: Vec<ExpandedOutput>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provides: ProvidesMap,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<Operation>,
}

fn lifecycle_is_empty(l: &StateLifecycle) -> bool {
    l.order.is_empty()
}

impl StateManifest {
    pub fn new(stack_kind: &str, stack_name: &str) -> Self {
        StateManifest {
            version: 1,
            kind: "state".to_string(),
            meta: StateMetadata {
                kind: stack_kind.to_string(),
                name: stack_name.to_string(),
            },
            ..Default::default()
        }
    }

    /// Values of stack parameters by qualified name.
    pub fn parameter_values(&self) -> HashMap<String, String> {
        self.stack_parameters
            .iter()
            .map(|p| (p.qname(), p.value.clone()))
            .collect()
    }
}

/// Merge captured outputs recorded in state into a working set. With an
/// empty `component`, outputs of every component are merged; otherwise
/// outputs of components preceding `component` in `order`, plus (when
/// deploying) outputs of the component's direct `depends`.
pub fn seed_outputs_from_state(
    state: &StateManifest,
    component: &str,
    depends: &[String],
    order: &[String],
    is_deploy: bool,
    into: &mut CapturedOutputs,
) {
    let limit = if component.is_empty() {
        order.len()
    } else {
        order.iter().position(|o| o == component).unwrap_or(0)
    };
    for (index, name) in order.iter().enumerate() {
        let wanted = index < limit || (is_deploy && depends.contains(name));
        if !wanted {
            continue;
        }
        if let Some(cs) = state.components.get(name) {
            for output in &cs.captured_outputs {
                into.insert(output.qname(), output.clone());
            }
        }
    }
}

/// Merge provides recorded in state into a working registry.
pub fn seed_provides_from_state(state: &StateManifest, into: &mut ProvidesMap) {
    for (capability, providers) in &state.provides {
        let list = into.entry(capability.clone()).or_default();
        for provider in providers {
            if !list.contains(provider) {
                list.push(provider.clone());
            }
        }
    }
}

// ============================================================================
// Files
// ============================================================================

/// Load state from the first readable path. `Ok(None)` when no path
/// exists yet.
pub fn load_state(paths: &[PathBuf]) -> Result<Option<StateManifest>, String> {
    for path in paths {
        if !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let manifest: StateManifest = serde_yaml_ng::from_str(&content)
            .map_err(|e| format!("invalid state file {}: {}", path.display(), e))?;
        return Ok(Some(manifest));
    }
    Ok(None)
}

fn write_state_file(path: &Path, manifest: &StateManifest) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
        }
    }
    let yaml = serde_yaml_ng::to_string(manifest).map_err(|e| format!("serialize error: {}", e))?;

    // Atomic write: temp file + rename.
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "cannot rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;
    Ok(())
}

/// Lock file guarding a state path.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut locked = path.as_os_str().to_owned();
    locked.push(".lock");
    PathBuf::from(locked)
}

/// Refuse to operate when another process is believed to hold the state.
pub fn ensure_no_locks(paths: &[PathBuf]) -> Result<(), String> {
    let held: Vec<String> = paths
        .iter()
        .map(|p| lock_path(p))
        .filter(|l| l.exists())
        .map(|l| l.display().to_string())
        .collect();
    if held.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "state lock file(s) exist, another operation may be in progress: {}",
            held.join(", ")
        ))
    }
}

/// Holds lock files for the duration of an operation; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    paths: Vec<PathBuf>,
}

impl LockGuard {
    pub fn acquire(state_paths: &[PathBuf]) -> Result<Self, String> {
        ensure_no_locks(state_paths)?;
        let mut held = Vec::new();
        for path in state_paths {
            let lock = lock_path(path);
            if let Some(parent) = lock.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
                }
            }
            std::fs::write(&lock, format!("{}\n", std::process::id()))
                .map_err(|e| format!("cannot write lock {}: {}", lock.display(), e))?;
            held.push(lock);
        }
        Ok(LockGuard { paths: held })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        for lock in &self.paths {
            let _ = std::fs::remove_file(lock);
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Buffered state writer. Mutators touch the in-memory snapshot only;
/// `sync` flushes it to every target path.
#[derive(Debug)]
pub struct StateWriter {
    paths: Vec<PathBuf>,
    manifest: StateManifest,
    dirty: bool,
}

impl StateWriter {
    pub fn new(paths: Vec<PathBuf>, manifest: StateManifest) -> Self {
        StateWriter {
            paths,
            manifest,
            dirty: false,
        }
    }

    /// A writer that tracks state in memory but never touches disk.
    pub fn detached(manifest: StateManifest) -> Self {
        Self::new(Vec::new(), manifest)
    }

    pub fn manifest(&self) -> &StateManifest {
        &self.manifest
    }

    pub fn set_order(&mut self, order: &[String]) {
        self.manifest.lifecycle.order = order.to_vec();
        self.dirty = true;
    }

    pub fn set_stack_parameters(&mut self, parameters: Vec<LockedParameter>) {
        self.manifest.stack_parameters = parameters;
        self.dirty = true;
    }

    pub fn update_component_status(&mut self, component: &str, status: &str, message: &str) {
        let entry = self
            .manifest
            .components
            .entry(component.to_string())
            .or_default();
        entry.status = status.to_string();
        entry.message = message.to_string();
        entry.timestamp = now_iso8601();
        self.dirty = true;
    }

    pub fn update_stack_status(&mut self, status: &str, message: &str) {
        self.manifest.status = status.to_string();
        self.manifest.message = message.to_string();
        self.dirty = true;
    }

    /// Append a new operation record, or update the status of an
    /// existing one. Terminal statuses stamp `finished`.
    pub fn update_operation(
        &mut self,
        id: &str,
        verb: &str,
        status: &str,
        description: Option<String>,
    ) {
        let now = now_iso8601();
        let terminal = status != "in-progress";
        match self.manifest.operations.iter_mut().find(|o| o.id == id) {
            Some(op) => {
                op.status = status.to_string();
                if terminal {
                    op.finished = now;
                }
                if let Some(d) = description {
                    op.description = d;
                }
            }
            None => self.manifest.operations.push(Operation {
                id: id.to_string(),
                operation: verb.to_string(),
                status: status.to_string(),
                description: description.unwrap_or_default(),
                started: now.clone(),
                finished: if terminal { now } else { String::new() },
                phases: Vec::new(),
                logs: Vec::new(),
            }),
        }
        self.dirty = true;
    }

    /// Upsert a per-component phase within an operation, preserving
    /// encounter order.
    pub fn update_phase(&mut self, operation_id: &str, component: &str, status: &str) {
        if let Some(op) = self
            .manifest
            .operations
            .iter_mut()
            .find(|o| o.id == operation_id)
        {
            match op.phases.iter_mut().find(|p| p.component == component) {
                Some(phase) => phase.status = status.to_string(),
                None => op.phases.push(OperationPhase {
                    component: component.to_string(),
                    status: status.to_string(),
                }),
            }
            self.dirty = true;
        }
    }

    pub fn append_operation_log(&mut self, operation_id: &str, entry: String) {
        if let Some(op) = self
            .manifest
            .operations
            .iter_mut()
            .find(|o| o.id == operation_id)
        {
            op.logs.push(entry);
            self.dirty = true;
        }
    }

    /// Record a component's inputs and outputs.
    pub fn record_component(
        &mut self,
        component: &str,
        parameters: Vec<LockedParameter>,
        raw_outputs: IndexMap<String, String>,
        captured_outputs: Vec<CapturedOutput>,
    ) {
        let entry = self
            .manifest
            .components
            .entry(component.to_string())
            .or_default();
        entry.parameters = parameters;
        if !raw_outputs.is_empty() {
            entry.raw_outputs = raw_outputs;
        }
        if !captured_outputs.is_empty() {
            entry.captured_outputs = captured_outputs;
        }
        entry.timestamp = now_iso8601();
        self.dirty = true;
    }

    pub fn record_provides(&mut self, provides: ProvidesMap) {
        self.manifest.provides = provides;
        self.dirty = true;
    }

    pub fn record_stack_outputs(&mut self, outputs: Vec<ExpandedOutput>) {
        self.manifest.stack_outputs = outputs;
        self.dirty = true;
    }

    /// Flush the snapshot to every target path. A no-op when nothing
    /// changed since the last sync, or for a detached writer.
    pub fn sync(&mut self) -> Result<(), String> {
        if self.paths.is_empty() || !self.dirty {
            return Ok(());
        }
        self.manifest.timestamp = now_iso8601();
        for path in &self.paths {
            write_state_file(path, &self.manifest)?;
        }
        self.dirty = false;
        Ok(())
    }
}

/// ISO 8601 UTC timestamp without sub-second precision.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = dur.as_secs();
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    let mut y = 1970i64;
    let mut remaining = days as i64;
    loop {
        let year_days = if is_leap(y) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        y += 1;
    }
    let leap = is_leap(y);
    let month_days = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut m = 0;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md as i64 {
            m = i + 1;
            break;
        }
        remaining -= md as i64;
    }
    let d = remaining + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y, m, d, hours, minutes, seconds
    )
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> StateManifest {
        let mut state = StateManifest::new("stack", "wordpress:1");
        state.lifecycle.order = vec!["storage".to_string(), "database".to_string()];
        state.stack_parameters = vec![LockedParameter {
            name: "dns.domain".to_string(),
            component: String::new(),
            value: "example.com".to_string(),
            env: "DOMAIN".to_string(),
        }];
        let mut cs = ComponentState {
            status: "deployed".to_string(),
            ..Default::default()
        };
        cs.raw_outputs.insert("bucket".to_string(), "files".to_string());
        cs.captured_outputs.push(CapturedOutput {
            name: "bucket".to_string(),
            component: "storage".to_string(),
            value: "files".to_string(),
            kind: String::new(),
        });
        state.components.insert("storage".to_string(), cs);
        state
            .provides
            .insert("kubernetes".to_string(), vec!["storage".to_string()]);
        state.operations.push(Operation {
            id: "op-1".to_string(),
            operation: "deploy".to_string(),
            status: "success".to_string(),
            description: "deploy -m hub.yaml".to_string(),
            started: "2026-01-01T00:00:00Z".to_string(),
            finished: "2026-01-01T00:01:00Z".to_string(),
            phases: vec![OperationPhase {
                component: "storage".to_string(),
                status: "success".to_string(),
            }],
            logs: vec![],
        });
        state
    }

    #[test]
    fn test_state_roundtrip_deep_equal() {
        let state = sample_state();
        let yaml = serde_yaml_ng::to_string(&state).unwrap();
        let reloaded: StateManifest = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(state, reloaded);
        // And re-serialization is stable.
        assert_eq!(yaml, serde_yaml_ng::to_string(&reloaded).unwrap());
    }

    #[test]
    fn test_state_write_and_load_first_available() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("state.yaml");
        let replica = dir.path().join("replica.yaml");
        let mut writer = StateWriter::new(vec![primary.clone(), replica.clone()], sample_state());
        writer.update_stack_status("deployed", "");
        writer.sync().unwrap();

        assert!(primary.exists());
        assert!(replica.exists());

        // Reads return the first available.
        std::fs::remove_file(&primary).unwrap();
        let loaded = load_state(&[primary, replica]).unwrap().unwrap();
        assert_eq!(loaded.status, "deployed");
        assert_eq!(loaded.meta.name, "wordpress:1");
    }

    #[test]
    fn test_state_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_state(&[dir.path().join("nope.yaml")]).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_state_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yaml");
        let mut writer = StateWriter::new(vec![path.clone()], sample_state());
        writer.update_stack_status("deployed", "");
        writer.sync().unwrap();
        assert!(path.exists());
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        assert!(!PathBuf::from(tmp).exists());
    }

    #[test]
    fn test_state_sync_skips_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yaml");
        let mut writer = StateWriter::new(vec![path.clone()], sample_state());
        writer.sync().unwrap();
        // No mutation yet — nothing flushed.
        assert!(!path.exists());
        writer.update_stack_status("deploying", "");
        writer.sync().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_state_lock_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yaml");
        let lock = lock_path(&path);
        {
            let _guard = LockGuard::acquire(std::slice::from_ref(&path)).unwrap();
            assert!(lock.exists());
            // Second acquisition refuses.
            let conflict = LockGuard::acquire(std::slice::from_ref(&path));
            assert!(conflict.is_err());
            assert!(conflict.unwrap_err().contains("lock"));
        }
        assert!(!lock.exists(), "lock released on drop");
    }

    #[test]
    fn test_state_operation_lifecycle() {
        let mut writer = StateWriter::detached(StateManifest::new("stack", "s"));
        writer.update_operation("op-9", "deploy", "in-progress", Some("argv".to_string()));
        writer.update_phase("op-9", "a", "in-progress");
        writer.update_phase("op-9", "b", "in-progress");
        writer.update_phase("op-9", "a", "success");
        writer.append_operation_log("op-9", "b exploded".to_string());
        writer.update_operation("op-9", "deploy", "error", None);

        let op = &writer.manifest().operations[0];
        assert_eq!(op.status, "error");
        assert!(!op.finished.is_empty());
        assert_eq!(op.description, "argv");
        // Encounter order preserved, statuses updated in place.
        assert_eq!(op.phases.len(), 2);
        assert_eq!(op.phases[0].component, "a");
        assert_eq!(op.phases[0].status, "success");
        assert_eq!(op.phases[1].status, "in-progress");
        assert_eq!(op.logs, vec!["b exploded"]);
    }

    #[test]
    fn test_state_seed_outputs_full() {
        let state = sample_state();
        let mut outputs = CapturedOutputs::new();
        seed_outputs_from_state(&state, "", &[], &state.lifecycle.order.clone(), false, &mut outputs);
        assert_eq!(outputs["storage|bucket"].value, "files");
    }

    #[test]
    fn test_state_seed_outputs_respects_offset() {
        let state = sample_state();
        let order = state.lifecycle.order.clone();
        let mut outputs = CapturedOutputs::new();
        // Components at or after the offset are not seeded.
        seed_outputs_from_state(&state, "storage", &[], &order, true, &mut outputs);
        assert!(outputs.is_empty());
        // A later offset picks up the preceding component's outputs.
        seed_outputs_from_state(&state, "database", &[], &order, true, &mut outputs);
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn test_state_seed_provides_merges() {
        let state = sample_state();
        let mut provides = ProvidesMap::new();
        provides.insert("kubernetes".to_string(), vec!["*environment*".to_string()]);
        seed_provides_from_state(&state, &mut provides);
        assert_eq!(provides["kubernetes"], vec!["*environment*", "storage"]);
        // Idempotent.
        seed_provides_from_state(&state, &mut provides);
        assert_eq!(provides["kubernetes"].len(), 2);
    }

    #[test]
    fn test_state_parameter_values() {
        let state = sample_state();
        let values = state.parameter_values();
        assert_eq!(values["dns.domain"], "example.com");
    }

    #[test]
    fn test_state_now_iso8601_format() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.contains('T'));
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
    }

    #[test]
    fn test_state_is_leap() {
        assert!(is_leap(2000));
        assert!(!is_leap(1900));
        assert!(is_leap(2024));
        assert!(!is_leap(2026));
    }
}
