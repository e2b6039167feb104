//! Template loading and expansion
//!
//! Templates are read and compiled when the pipeline is generated, so a
//! missing file or a syntax error stops the run before any script starts.
//! Expansion happens later, inside the render stage, with undefined
//! variables treated as errors.

use crate::adapter::Adapter;
use crate::context::Context;
use crate::error::{Error, Result};
use artifacts::FileSet;
use minijinja::{Environment, UndefinedBehavior};

/// One loaded template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedTemplate {
    pub name: String,
    pub output: String,
    pub source: String,
}

/// The templates of one adapter, loaded and syntax-checked
#[derive(Debug, Clone)]
pub struct TemplateSet {
    adapter_id: String,
    templates: Vec<LoadedTemplate>,
    version: String,
}

impl TemplateSet {
    /// Read and compile every template of `adapter`
    pub fn load(adapter: &Adapter) -> Result<Self> {
        let templates = adapter
            .templates
            .iter()
            .map(|t| {
                let path = adapter.resolve_path(&t.path);
                let source = std::fs::read_to_string(&path).map_err(|e| Error::Render {
                    adapter: adapter.id.clone(),
                    template: t.name.clone(),
                    cause: format!("cannot read {}: {e}", path.display()),
                })?;
                Ok(LoadedTemplate {
                    name: t.name.clone(),
                    output: t.output.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Self::from_sources(&adapter.id, templates)
    }

    /// Build a set from in-memory sources
    pub fn from_sources(adapter_id: &str, templates: Vec<LoadedTemplate>) -> Result<Self> {
        let set = Self {
            adapter_id: adapter_id.to_string(),
            version: version_of(&templates),
            templates,
        };
        // Compiling surfaces syntax errors now rather than mid-run.
        set.environment()?;
        Ok(set)
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn templates(&self) -> &[LoadedTemplate] {
        &self.templates
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Digest over template names, output paths and sources
    pub fn version(&self) -> &str {
        &self.version
    }

    fn render_error(&self, template: &str, cause: impl Into<String>) -> Error {
        Error::Render {
            adapter: self.adapter_id.clone(),
            template: template.to_string(),
            cause: cause.into(),
        }
    }

    fn environment(&self) -> Result<Environment<'_>> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        for template in &self.templates {
            env.add_template(&template.name, &template.source)
                .map_err(|e| self.render_error(&template.name, e.to_string()))?;
        }
        Ok(env)
    }

    /// Expand every template against `context`
    ///
    /// Output paths that would escape the adapter's output directory, or
    /// two templates writing the same path, are render errors.
    pub fn render(&self, context: &Context) -> Result<FileSet> {
        let env = self.environment()?;
        let mut files = FileSet::new();
        for template in &self.templates {
            if artifacts::check_relative_path(&template.output).is_err() {
                return Err(self.render_error(
                    &template.name,
                    format!("output path '{}' escapes the output root", template.output),
                ));
            }
            let rendered = env
                .get_template(&template.name)
                .and_then(|t| t.render(context))
                .map_err(|e| self.render_error(&template.name, e.to_string()))?;
            if files
                .insert(template.output.clone(), rendered.into_bytes())
                .is_some()
            {
                return Err(self.render_error(
                    &template.name,
                    format!("output path '{}' is written twice", template.output),
                ));
            }
        }
        Ok(files)
    }
}

fn version_of(templates: &[LoadedTemplate]) -> String {
    let mut hasher = blake3::Hasher::new();
    for template in templates {
        for part in [&template.name, &template.output, &template.source] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::resolver::resolve;
    use crate::testing::{add_template, adapter};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn loaded(name: &str, source: &str) -> LoadedTemplate {
        LoadedTemplate {
            name: name.into(),
            output: name.into(),
            source: source.into(),
        }
    }

    fn context_for(a: &Adapter) -> Arc<Context> {
        let order = resolve(&[Arc::new(a.clone())]).unwrap();
        ContextBuilder::new(Path::new("/out")).build(a, &order)
    }

    #[test]
    fn test_load_and_render() {
        let tmp = TempDir::new().unwrap();
        let mut a = adapter("cilium", &[]);
        a.root = tmp.path().join("cilium");
        add_template(&mut a, "values.yaml", "adapter: {{ adapter_id }}\nversion: {{ version }}\n");

        let set = TemplateSet::load(&a).unwrap();
        let files = set.render(&context_for(&a)).unwrap();
        assert_eq!(
            files["values.yaml"],
            b"adapter: cilium\nversion: 1.0.0\n".to_vec()
        );
    }

    #[test]
    fn test_missing_template_file() {
        let mut a = adapter("cilium", &[]);
        a.templates.push(crate::adapter::TemplateRef {
            name: "values".into(),
            path: "templates/missing.j2".into(),
            output: "values.yaml".into(),
        });
        match TemplateSet::load(&a) {
            Err(Error::Render {
                adapter, template, ..
            }) => {
                assert_eq!(adapter, "cilium");
                assert_eq!(template, "values");
            }
            other => panic!("expected render error, got {other:?}"),
        }
    }

    #[test]
    fn test_syntax_error_at_load() {
        let result = TemplateSet::from_sources("a", vec![loaded("bad", "{% if %}")]);
        assert!(matches!(result, Err(Error::Render { .. })));
    }

    #[test]
    fn test_undefined_variable_fails() {
        let a = adapter("a", &[]);
        let set = TemplateSet::from_sources("a", vec![loaded("x", "{{ no_such_key }}")]).unwrap();
        match set.render(&context_for(&a)) {
            Err(Error::Render { template, .. }) => assert_eq!(template, "x"),
            other => panic!("expected render error, got {other:?}"),
        }
    }

    #[test]
    fn test_escaping_output_rejected() {
        let a = adapter("a", &[]);
        let mut template = loaded("x", "hi");
        template.output = "../escape".into();
        let set = TemplateSet::from_sources("a", vec![template]).unwrap();
        assert!(matches!(
            set.render(&context_for(&a)),
            Err(Error::Render { .. })
        ));
    }

    #[test]
    fn test_version_tracks_content() {
        let one = TemplateSet::from_sources("a", vec![loaded("x", "1")]).unwrap();
        let same = TemplateSet::from_sources("a", vec![loaded("x", "1")]).unwrap();
        let other = TemplateSet::from_sources("a", vec![loaded("x", "2")]).unwrap();
        assert_eq!(one.version(), same.version());
        assert_ne!(one.version(), other.version());
    }
}
