//! Component invoker.
//!
//! Locates the implementation for a (component, verb) pair — an
//! executable named after the verb, a `<verb>.sh` script, or a Makefile
//! target — renders declared templates, builds the child environment
//! from parameter `env` bindings, and runs the child with both output
//! pipes drained concurrently.

pub mod outputs;

use crate::core::params::{expand_string, CapturedOutputs, ExpansionContext, LockedParameters};
use crate::core::types::TemplateSetup;
use crate::warn::WarningSink;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};

pub const COMPONENT_NAME_ENV: &str = "COMPONENT_NAME";
pub const TOOL_COMPONENT_ENV: &str = "STACKSMITH_COMPONENT";

/// Output from executing a component implementation.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Invoke a component's implementation for a verb. `Ok(None)` means no
/// implementation exists and the manifest permits bare mode.
pub fn invoke(
    verb: &str,
    component: &str,
    bare_allowed: bool,
    templates: &TemplateSetup,
    parameters: &LockedParameters,
    dir: &Path,
    pipe_output_in_realtime: bool,
    sink: &mut WarningSink,
) -> Result<Option<ExecOutput>, String> {
    render_templates(dir, templates, parameters)?;

    let mut cmd = match find_implementation(dir, verb) {
        Ok(cmd) => cmd,
        Err(e) => {
            if bare_allowed {
                return Ok(None);
            }
            return Err(e);
        }
    };

    for (name, value) in build_env(component, parameters, sink) {
        cmd.env(name, value);
    }

    exec(cmd, pipe_output_in_realtime).map(Some)
}

/// Probe a component directory for a verb implementation: an executable
/// named `<verb>`, a `<verb>.sh` script, or a Makefile with a `<verb>:`
/// target.
pub fn find_implementation(dir: &Path, verb: &str) -> Result<Command, String> {
    let executable = dir.join(verb);
    if is_executable(&executable) {
        let absolute = std::fs::canonicalize(&executable)
            .map_err(|e| format!("cannot resolve {}: {}", executable.display(), e))?;
        let mut cmd = Command::new(absolute);
        cmd.current_dir(dir);
        return Ok(cmd);
    }

    let script = dir.join(format!("{}.sh", verb));
    if script.is_file() {
        let absolute = std::fs::canonicalize(&script)
            .map_err(|e| format!("cannot resolve {}: {}", script.display(), e))?;
        let mut cmd = Command::new("sh");
        cmd.arg(absolute).current_dir(dir);
        return Ok(cmd);
    }

    for makefile in ["Makefile", "makefile"] {
        let path = dir.join(makefile);
        if !path.is_file() {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        if content
            .lines()
            .any(|line| line.starts_with(&format!("{}:", verb)))
        {
            let mut cmd = Command::new("make");
            cmd.arg(verb).current_dir(dir);
            return Ok(cmd);
        }
    }

    Err(format!(
        "no `{}` implementation in {}: tried `{}`, `{}.sh`, Makefile target",
        verb,
        dir.display(),
        verb,
        verb
    ))
}

fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match path.metadata() {
            Ok(meta) => meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Substitute `${qname}` placeholders in declared template files. A
/// `.template` suffix is stripped from the rendered filename.
pub fn render_templates(
    dir: &Path,
    templates: &TemplateSetup,
    parameters: &LockedParameters,
) -> Result<(), String> {
    let outputs = CapturedOutputs::new();
    let environment = HashMap::new();
    let ctx = ExpansionContext {
        parameters,
        outputs: &outputs,
        environment: &environment,
        component: "",
        depends: &[],
    };
    let mut errors = Vec::new();
    for file in &templates.files {
        let path = dir.join(file);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                errors.push(format!("cannot read template {}: {}", path.display(), e));
                continue;
            }
        };
        let rendered = match expand_string(&content, &ctx) {
            Ok(r) => r,
            Err(errs) => {
                for e in errs {
                    errors.push(format!("template {}: {}", path.display(), e));
                }
                continue;
            }
        };
        let target = match file.strip_suffix(".template") {
            Some(stripped) => dir.join(stripped),
            None => path.clone(),
        };
        if let Err(e) = std::fs::write(&target, rendered) {
            errors.push(format!("cannot write {}: {}", target.display(), e));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "failed to process templates:\n\t{}",
            errors.join("\n\t")
        ))
    }
}

/// Build the child environment from parameter `env` bindings. Values
/// are whitespace-trimmed; conflicting bindings warn and the later
/// parameter wins. Entries come back sorted.
pub fn build_env(
    component: &str,
    parameters: &LockedParameters,
    sink: &mut WarningSink,
) -> Vec<(String, String)> {
    let mut values: HashMap<String, String> = HashMap::new();
    let mut set_by: HashMap<String, String> = HashMap::new();

    for parameter in parameters.values() {
        if parameter.env.is_empty() {
            continue;
        }
        let value = parameter.value.trim().to_string();
        let qname = parameter.qname();
        if let Some(previous_by) = set_by.get(&parameter.env) {
            let previous = &values[&parameter.env];
            if previous != &value {
                sink.warn(format!(
                    "env var `{}={}` set by `{}` overridden by `{}` to `{}`",
                    parameter.env, previous, previous_by, qname, value
                ));
            }
        }
        set_by.insert(parameter.env.clone(), qname);
        values.insert(parameter.env.clone(), value);
    }

    if !values.contains_key(COMPONENT_NAME_ENV) {
        values.insert(COMPONENT_NAME_ENV.to_string(), component.to_string());
    }
    values.insert(TOOL_COMPONENT_ENV.to_string(), component.to_string());

    let mut entries: Vec<(String, String)> = values.into_iter().collect();
    entries.sort();
    entries
}

/// Run the child, draining stdout and stderr concurrently with the
/// wait. With `tee` the streams are forwarded to the parent's as they
/// arrive, in addition to being captured.
fn exec(mut cmd: Command, tee: bool) -> Result<ExecOutput, String> {
    let program = cmd.get_program().to_string_lossy().to_string();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn `{}`: {}", program, e))?;

    let stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| "child stdout not captured".to_string())?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| "child stderr not captured".to_string())?;

    let (stdout, stderr) = std::thread::scope(|scope| {
        let out = scope.spawn(move || drain(stdout_pipe, tee, false));
        let err = scope.spawn(move || drain(stderr_pipe, tee, true));
        (
            out.join().unwrap_or_default(),
            err.join().unwrap_or_default(),
        )
    });

    let status = child.wait().map_err(|e| format!("wait error: {}", e))?;

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

fn drain(mut pipe: impl Read, tee: bool, to_stderr: bool) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                captured.extend_from_slice(&buf[..n]);
                if tee {
                    if to_stderr {
                        let _ = std::io::stderr().write_all(&buf[..n]);
                    } else {
                        let _ = std::io::stdout().write_all(&buf[..n]);
                    }
                }
            }
        }
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::{insert_locked, LockedParameter};

    fn locked_env(name: &str, value: &str, env: &str) -> LockedParameter {
        LockedParameter {
            name: name.to_string(),
            component: String::new(),
            value: value.to_string(),
            env: env.to_string(),
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn test_invoke_executable_verb() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy", "echo deployed-by-executable");
        let params = LockedParameters::new();
        let mut sink = WarningSink::new();
        let output = invoke(
            "deploy",
            "web",
            false,
            &TemplateSetup::default(),
            &params,
            dir.path(),
            false,
            &mut sink,
        )
        .unwrap()
        .unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("deployed-by-executable"));
    }

    #[test]
    fn test_invoke_verb_sh_script() {
        let dir = tempfile::tempdir().unwrap();
        // Not executable — still runnable via `sh`.
        std::fs::write(dir.path().join("deploy.sh"), "echo from-script\n").unwrap();
        let params = LockedParameters::new();
        let mut sink = WarningSink::new();
        let output = invoke(
            "deploy",
            "web",
            false,
            &TemplateSetup::default(),
            &params,
            dir.path(),
            false,
            &mut sink,
        )
        .unwrap()
        .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "from-script");
    }

    #[test]
    fn test_invoke_makefile_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Makefile"),
            "undeploy:\n\t@echo undeployed-by-make\n",
        )
        .unwrap();
        let params = LockedParameters::new();
        let mut sink = WarningSink::new();
        let output = invoke(
            "undeploy",
            "web",
            false,
            &TemplateSetup::default(),
            &params,
            dir.path(),
            false,
            &mut sink,
        )
        .unwrap()
        .unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("undeployed-by-make"));
    }

    #[test]
    fn test_invoke_executable_preferred_over_script() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy", "echo executable-wins");
        std::fs::write(dir.path().join("deploy.sh"), "echo script-loses\n").unwrap();
        let cmd = find_implementation(dir.path(), "deploy").unwrap();
        assert!(cmd.get_program().to_string_lossy().ends_with("deploy"));
    }

    #[test]
    fn test_invoke_missing_implementation() {
        let dir = tempfile::tempdir().unwrap();
        let params = LockedParameters::new();
        let mut sink = WarningSink::new();
        let result = invoke(
            "deploy",
            "web",
            false,
            &TemplateSetup::default(),
            &params,
            dir.path(),
            false,
            &mut sink,
        );
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("no `deploy` implementation"));
    }

    #[test]
    fn test_invoke_bare_allowed_skips() {
        let dir = tempfile::tempdir().unwrap();
        let params = LockedParameters::new();
        let mut sink = WarningSink::new();
        let output = invoke(
            "deploy",
            "web",
            true,
            &TemplateSetup::default(),
            &params,
            dir.path(),
            false,
            &mut sink,
        )
        .unwrap();
        assert!(output.is_none());
    }

    #[test]
    fn test_invoke_nonzero_exit_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deploy.sh"), "echo broken >&2\nexit 3\n").unwrap();
        let params = LockedParameters::new();
        let mut sink = WarningSink::new();
        let output = invoke(
            "deploy",
            "web",
            false,
            &TemplateSetup::default(),
            &params,
            dir.path(),
            false,
            &mut sink,
        )
        .unwrap()
        .unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, 3);
        assert!(output.stderr.contains("broken"));
    }

    #[test]
    fn test_invoke_parameters_in_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("deploy.sh"),
            "echo domain=$DOMAIN component=$COMPONENT_NAME tool=$STACKSMITH_COMPONENT\n",
        )
        .unwrap();
        let mut params = LockedParameters::new();
        insert_locked(&mut params, locked_env("dns.domain", "  example.com  ", "DOMAIN"));
        let mut sink = WarningSink::new();
        let output = invoke(
            "deploy",
            "web",
            false,
            &TemplateSetup::default(),
            &params,
            dir.path(),
            false,
            &mut sink,
        )
        .unwrap()
        .unwrap();
        // Values are trimmed; component names injected.
        assert_eq!(
            output.stdout.trim(),
            "domain=example.com component=web tool=web"
        );
    }

    #[test]
    fn test_invoke_env_conflict_warns_later_wins() {
        let mut params = LockedParameters::new();
        insert_locked(&mut params, locked_env("first.name", "one", "SHARED"));
        insert_locked(&mut params, locked_env("second.name", "two", "SHARED"));
        let mut sink = WarningSink::new();
        let env = build_env("web", &params, &mut sink);
        let shared = env.iter().find(|(k, _)| k == "SHARED").unwrap();
        assert_eq!(shared.1, "two");
        assert!(sink.drain()[0].contains("overridden by `second.name`"));
    }

    #[test]
    fn test_invoke_env_sorted_deterministic() {
        let mut params = LockedParameters::new();
        insert_locked(&mut params, locked_env("z.last", "1", "ZZZ"));
        insert_locked(&mut params, locked_env("a.first", "2", "AAA"));
        let mut sink = WarningSink::new();
        let env = build_env("web", &params, &mut sink);
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_invoke_component_name_param_not_clobbered() {
        let mut params = LockedParameters::new();
        insert_locked(
            &mut params,
            locked_env("component.alias", "custom", COMPONENT_NAME_ENV),
        );
        let mut sink = WarningSink::new();
        let env = build_env("web", &params, &mut sink);
        let name = env.iter().find(|(k, _)| k == COMPONENT_NAME_ENV).unwrap();
        assert_eq!(name.1, "custom");
        // The tool-owned variable still reflects the real component.
        let tool = env.iter().find(|(k, _)| k == TOOL_COMPONENT_ENV).unwrap();
        assert_eq!(tool.1, "web");
    }

    #[test]
    fn test_invoke_renders_templates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("app.conf.template"),
            "domain = ${dns.domain}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("deploy.sh"), "cat app.conf\n").unwrap();
        let mut params = LockedParameters::new();
        insert_locked(&mut params, locked_env("dns.domain", "example.com", ""));
        let templates = TemplateSetup {
            files: vec!["app.conf.template".to_string()],
        };
        let mut sink = WarningSink::new();
        let output = invoke(
            "deploy",
            "web",
            false,
            &templates,
            &params,
            dir.path(),
            false,
            &mut sink,
        )
        .unwrap()
        .unwrap();
        assert_eq!(output.stdout.trim(), "domain = example.com");
    }

    #[test]
    fn test_invoke_template_unresolved_reference_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.conf.template"), "x = ${missing}\n").unwrap();
        let params = LockedParameters::new();
        let templates = TemplateSetup {
            files: vec!["app.conf.template".to_string()],
        };
        let result = render_templates(dir.path(), &templates, &params);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("unresolved reference"));
    }
}
