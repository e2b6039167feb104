//! Fixtures shared by the unit tests of this crate

use crate::adapter::{Adapter, Dependency, ScriptRef, TemplateRef};
use crate::types::Phase;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An adapter with the given dependencies and nothing else
pub fn adapter(id: &str, deps: &[&str]) -> Adapter {
    Adapter {
        id: id.to_string(),
        version: "1.0.0".to_string(),
        dependencies: deps
            .iter()
            .map(|d| Dependency::parse(d).expect("valid dependency spec"))
            .collect(),
        templates: Vec::new(),
        scripts: Vec::new(),
        defaults: IndexMap::new(),
        target: None,
        root: PathBuf::from("/adapters").join(id),
    }
}

/// Same as [`adapter`], wrapped for APIs that take shared adapters
pub fn shared(id: &str, deps: &[&str]) -> Arc<Adapter> {
    Arc::new(adapter(id, deps))
}

/// A script reference without precheck or overrides
pub fn script(phase: Phase, path: &str) -> ScriptRef {
    ScriptRef {
        phase,
        path: PathBuf::from(path),
        precheck: None,
        args: Vec::new(),
        timeout: None,
        transient_exit_codes: Vec::new(),
    }
}

/// An adapter with one script per listed phase, rooted at `root/<id>`
pub fn scripted(root: &Path, id: &str, deps: &[&str], phases: &[Phase]) -> Adapter {
    let mut a = adapter(id, deps);
    a.root = root.join(id);
    a.scripts = phases
        .iter()
        .map(|p| script(*p, &format!("{}.sh", p.as_str())))
        .collect();
    a
}

/// Write a template file under the adapter root and register it
pub fn add_template(adapter: &mut Adapter, name: &str, source: &str) {
    let rel = PathBuf::from("templates").join(format!("{name}.j2"));
    let path = adapter.root.join(&rel);
    std::fs::create_dir_all(path.parent().expect("template has a parent")).expect("mkdir");
    std::fs::write(&path, source).expect("write template");
    adapter.templates.push(TemplateRef {
        name: name.to_string(),
        path: rel,
        output: name.to_string(),
    });
}

/// Write an executable shell script under the adapter root
#[cfg(unix)]
pub fn write_script(adapter: &Adapter, rel: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let path = adapter.root.join(rel);
    std::fs::create_dir_all(path.parent().expect("script has a parent")).expect("mkdir");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
}
