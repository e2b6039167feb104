//! Adapter descriptors and their strict schema validation
//!
//! A descriptor is a TOML document. Every key is checked against a fixed
//! schema so that a typo or a missing field is reported at load time with
//! the adapter id and the offending field path (e.g. `scripts[1].phase`),
//! instead of surfacing as a missing context key deep inside a run.

use crate::error::{Error, Result};
use crate::types::Phase;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

const TOP_LEVEL_FIELDS: &[&str] = &[
    "id",
    "version",
    "dependencies",
    "templates",
    "scripts",
    "defaults",
    "target",
];
const TEMPLATE_FIELDS: &[&str] = &["name", "path", "output"];
const SCRIPT_FIELDS: &[&str] = &[
    "phase",
    "path",
    "precheck",
    "args",
    "timeout_secs",
    "transient_exit_codes",
];

/// A dependency on another adapter, optionally pinned to an exact version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub id: String,
    /// Exact version required (`id@version`); `None` accepts any version
    pub version: Option<String>,
}

impl Dependency {
    /// Parse `"id"` or `"id@version"`
    pub fn parse(spec: &str) -> Option<Self> {
        let (id, version) = match spec.split_once('@') {
            Some((id, version)) => (id, Some(version)),
            None => (spec, None),
        };
        if !is_valid_id(id) || version.is_some_and(str::is_empty) {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            version: version.map(str::to_string),
        })
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{version}", self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// A template to expand during the render phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    /// Template name (unique within the adapter)
    pub name: String,
    /// Source path, relative to the adapter root
    pub path: PathBuf,
    /// Output path, relative to the adapter's output directory
    pub output: String,
}

/// A script bound to one of the script phases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRef {
    pub phase: Phase,
    /// Executable path, relative to the adapter root
    pub path: PathBuf,
    /// Optional idempotency check; exit 0 means the desired state already holds
    pub precheck: Option<PathBuf>,
    pub args: Vec<String>,
    /// Overrides the engine's default script timeout
    pub timeout: Option<Duration>,
    /// Exit codes that mark a failure as transient (in addition to the defaults)
    pub transient_exit_codes: Vec<i32>,
}

/// A validated adapter
#[derive(Debug, Clone)]
pub struct Adapter {
    pub id: String,
    pub version: String,
    pub dependencies: Vec<Dependency>,
    pub templates: Vec<TemplateRef>,
    pub scripts: Vec<ScriptRef>,
    /// Adapter-declared context defaults
    pub defaults: IndexMap<String, Value>,
    /// Resource key (e.g. target node) that script stages serialize on
    pub target: Option<String>,
    /// Directory that relative template and script paths resolve against
    pub root: PathBuf,
}

impl Adapter {
    /// Parse and validate a descriptor
    ///
    /// `source` names the descriptor in errors when its `id` is unreadable.
    pub fn parse(text: &str, root: &Path, source: &str) -> Result<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| Error::config(source, "<document>", e.message()))?;

        let label = table
            .get("id")
            .and_then(toml::Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or(source)
            .to_string();
        let reader = FieldReader::new(&label, String::new(), &table);
        reader.check_known(TOP_LEVEL_FIELDS)?;

        let id = reader.required_str("id")?;
        if !is_valid_id(&id) {
            return Err(reader.error("id", "must be non-empty without '/', '@' or whitespace"));
        }
        let version = reader.required_str("version")?;
        if version.trim().is_empty() {
            return Err(reader.error("version", "must not be empty"));
        }

        let mut dependencies: Vec<Dependency> = Vec::new();
        for (i, spec) in reader.string_list("dependencies")?.iter().enumerate() {
            let field = format!("dependencies[{i}]");
            let dep = Dependency::parse(spec)
                .ok_or_else(|| reader.error(&field, format!("invalid dependency '{spec}'")))?;
            if dependencies.iter().any(|d| d.id == dep.id) {
                return Err(reader.error(&field, format!("duplicate dependency '{}'", dep.id)));
            }
            dependencies.push(dep);
        }

        let mut templates: Vec<TemplateRef> = Vec::new();
        for (i, entry) in reader.table_list("templates")?.into_iter().enumerate() {
            let template = parse_template(&label, i, entry)?;
            if templates.iter().any(|t| t.name == template.name) {
                return Err(reader.error(
                    &format!("templates[{i}].name"),
                    format!("duplicate template '{}'", template.name),
                ));
            }
            templates.push(template);
        }

        let scripts = reader
            .table_list("scripts")?
            .into_iter()
            .enumerate()
            .map(|(i, entry)| parse_script(&label, i, entry))
            .collect::<Result<Vec<_>>>()?;

        let defaults = match table.get("defaults") {
            None => IndexMap::new(),
            Some(toml::Value::Table(t)) => t
                .iter()
                .map(|(k, v)| Ok((k.clone(), serde_json::to_value(v)?)))
                .collect::<Result<IndexMap<_, _>>>()?,
            Some(_) => return Err(reader.error("defaults", "expected a table")),
        };

        let target = reader.optional_str("target")?;
        if target.as_deref().is_some_and(|t| !is_single_segment(t)) {
            return Err(reader.error("target", "must be a single relative path segment"));
        }

        Ok(Self {
            id,
            version,
            dependencies,
            templates,
            scripts,
            defaults,
            target,
            root: root.to_path_buf(),
        })
    }

    /// Ids of direct dependencies
    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.id.as_str())
    }

    /// Scripts of one phase in declaration order
    pub fn scripts_for(&self, phase: Phase) -> impl Iterator<Item = &ScriptRef> {
        self.scripts.iter().filter(move |s| s.phase == phase)
    }

    /// Resolve a descriptor-relative path against the adapter root
    pub fn resolve_path(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }
}

fn parse_template(adapter: &str, index: usize, table: &toml::Table) -> Result<TemplateRef> {
    let reader = FieldReader::new(adapter, format!("templates[{index}]."), table);
    reader.check_known(TEMPLATE_FIELDS)?;

    let name = reader.required_str("name")?;
    if name.trim().is_empty() {
        return Err(reader.error("name", "must not be empty"));
    }
    let path = reader.relative_path("path")?;
    let output = reader.optional_str("output")?.unwrap_or_else(|| name.clone());
    if artifacts::check_relative_path(&output).is_err() {
        return Err(reader.error("output", format!("'{output}' must stay inside the output root")));
    }

    Ok(TemplateRef { name, path, output })
}

fn parse_script(adapter: &str, index: usize, table: &toml::Table) -> Result<ScriptRef> {
    let reader = FieldReader::new(adapter, format!("scripts[{index}]."), table);
    reader.check_known(SCRIPT_FIELDS)?;

    let phase = match reader.required_str("phase")?.as_str() {
        "pre_work" => Phase::PreWork,
        "bootstrap" => Phase::Bootstrap,
        "post_work" => Phase::PostWork,
        "render" => return Err(reader.error("phase", "render is not a script phase")),
        other => return Err(reader.error("phase", format!("unknown phase '{other}'"))),
    };
    let path = reader.relative_path("path")?;
    let precheck = match reader.optional_str("precheck")? {
        Some(_) => Some(reader.relative_path("precheck")?),
        None => None,
    };
    let timeout = reader.optional_u64("timeout_secs")?.map(Duration::from_secs);
    let transient_exit_codes = reader
        .int_list("transient_exit_codes")?
        .into_iter()
        .map(|code| {
            i32::try_from(code)
                .map_err(|_| reader.error("transient_exit_codes", format!("{code} is out of range")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ScriptRef {
        phase,
        path,
        precheck,
        args: reader.string_list("args")?,
        timeout,
        transient_exit_codes,
    })
}

/// Adapter ids are used in stage ids and output paths
pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && !id.chars().any(|c| c == '/' || c == '@' || c == '\\' || c.is_whitespace())
}

/// Typed access to one descriptor table, producing field-qualified errors
struct FieldReader<'a> {
    adapter: &'a str,
    prefix: String,
    table: &'a toml::Table,
}

impl<'a> FieldReader<'a> {
    fn new(adapter: &'a str, prefix: String, table: &'a toml::Table) -> Self {
        Self {
            adapter,
            prefix,
            table,
        }
    }

    fn error(&self, field: &str, message: impl Into<String>) -> Error {
        Error::config(self.adapter, format!("{}{field}", self.prefix), message)
    }

    fn check_known(&self, known: &[&str]) -> Result<()> {
        match self.table.keys().find(|k| !known.contains(&k.as_str())) {
            Some(unknown) => Err(self.error(unknown, "unknown field")),
            None => Ok(()),
        }
    }

    fn required_str(&self, key: &str) -> Result<String> {
        self.optional_str(key)?
            .ok_or_else(|| self.error(key, "missing required field"))
    }

    fn optional_str(&self, key: &str) -> Result<Option<String>> {
        match self.table.get(key) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.error(key, "expected a string")),
        }
    }

    fn relative_path(&self, key: &str) -> Result<PathBuf> {
        let raw = self.required_str(key)?;
        if artifacts::check_relative_path(&raw).is_err() {
            return Err(self.error(key, format!("'{raw}' must be relative to the adapter root")));
        }
        Ok(PathBuf::from(raw))
    }

    fn optional_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.table.get(key) {
            None => Ok(None),
            Some(toml::Value::Integer(n)) if *n > 0 => Ok(Some(*n as u64)),
            Some(_) => Err(self.error(key, "expected a positive integer")),
        }
    }

    fn string_list(&self, key: &str) -> Result<Vec<String>> {
        match self.table.get(key) {
            None => Ok(Vec::new()),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| self.error(key, "expected a list of strings"))
                })
                .collect(),
            Some(_) => Err(self.error(key, "expected a list of strings")),
        }
    }

    fn int_list(&self, key: &str) -> Result<Vec<i64>> {
        match self.table.get(key) {
            None => Ok(Vec::new()),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_integer()
                        .ok_or_else(|| self.error(key, "expected a list of integers"))
                })
                .collect(),
            Some(_) => Err(self.error(key, "expected a list of integers")),
        }
    }

    fn table_list(&self, key: &str) -> Result<Vec<&'a toml::Table>> {
        match self.table.get(key) {
            None => Ok(Vec::new()),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_table()
                        .ok_or_else(|| self.error(key, "expected an array of tables"))
                })
                .collect(),
            Some(_) => Err(self.error(key, "expected an array of tables")),
        }
    }
}

fn is_single_segment(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !value.contains(['/', '\\'])
}
