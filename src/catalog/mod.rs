//! Offline discovery of lesson scripts into a JSON catalog.
//!
//! Scripts are never executed: metadata comes from the parsed syntax tree, the
//! module docstring, and plain substring checks over the source text.

pub mod docstring;
pub mod source;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::LessonsConfig;
use crate::error::{GatewayError, Result};

use self::docstring::{legacy_description, legacy_name, DocstringMeta};
use self::source::{ArgumentCall, ImportSummary, Literal, OutputSchema, ScriptSource};

/// Argparse options that belong to the shared model-selection flags.
const RESERVED_PARAMS: [&str; 6] = ["provider", "model", "temperature", "help", "version", "h"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Boolean,
    Integer,
    Float,
}

impl ParamType {
    fn from_doc(type_name: &str) -> Self {
        match type_name.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" => ParamType::Integer,
            "float" | "number" => ParamType::Float,
            "bool" | "boolean" => ParamType::Boolean,
            _ => ParamType::String,
        }
    }
}

/// Presentation hint for a parameter input. Has no effect on execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UiType {
    Checkbox,
    Number,
    FilePdf,
    FileCsv,
    FileAny,
    Url,
    Email,
    Textarea,
    Select,
    Text,
}

const LONG_TEXT_HINTS: [&str; 7] = [
    "query",
    "topic",
    "content",
    "message",
    "description",
    "text",
    "prompt",
];

impl UiType {
    pub fn infer(name: &str, description: &str, param_type: ParamType) -> Self {
        match param_type {
            ParamType::Boolean => return UiType::Checkbox,
            ParamType::Integer | ParamType::Float => return UiType::Number,
            ParamType::String => {}
        }
        let name = name.to_ascii_lowercase();
        let desc = description.to_ascii_lowercase();
        if name.contains("pdf") || desc.contains("pdf") {
            UiType::FilePdf
        } else if name.contains("csv") || desc.contains("csv") {
            UiType::FileCsv
        } else if name.contains("file") || name.contains("path") {
            UiType::FileAny
        } else if name.contains("url") || name.contains("link") {
            UiType::Url
        } else if name.contains("email") {
            UiType::Email
        } else if LONG_TEXT_HINTS.iter().any(|hint| name.contains(hint)) {
            UiType::Textarea
        } else if desc.contains(':') && desc.contains('/') {
            UiType::Select
        } else {
            UiType::Text
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    pub is_positional: bool,
    pub default: String,
    #[serde(default)]
    pub description: String,
    pub ui_type: UiType,
}

impl Param {
    fn new(
        name: impl Into<String>,
        param_type: ParamType,
        is_positional: bool,
        default: String,
        description: String,
    ) -> Self {
        let name = name.into();
        let ui_type = UiType::infer(&name, &description, param_type);
        Self {
            name,
            param_type,
            required: is_positional,
            is_positional,
            default,
            description,
            ui_type,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AgentKind {
    #[default]
    Agent,
    Team,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub description: String,
    /// Entry file, relative to the project root, `/`-separated.
    pub path: String,
    /// Directory containing the entry file; relative paths in the lesson resolve from here.
    pub dir: String,
    #[serde(default)]
    pub path_parts: Vec<String>,
    pub params: Vec<Param>,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    pub tools: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub output_schemas: Vec<OutputSchema>,
    #[serde(default)]
    pub imports: ImportSummary,
    #[serde(default)]
    pub example_number: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct CatalogReport {
    pub entries: Vec<CatalogEntry>,
    pub errors: Vec<DiscoveryFailure>,
}

impl CatalogReport {
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }

    /// Lessons per capability tag, most common first.
    pub fn tool_counts(&self) -> Vec<(String, usize)> {
        distribution(self.entries.iter().flat_map(|e| e.tools.iter().cloned()))
    }

    pub fn category_counts(&self) -> Vec<(String, usize)> {
        distribution(self.entries.iter().map(|e| e.category.clone()))
    }
}

fn distribution(items: impl Iterator<Item = String>) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for item in items {
        *counts.entry(item).or_default() += 1;
    }
    let mut sorted: Vec<_> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted
}

/// Static analyser that turns entry files into [`CatalogEntry`] records.
#[derive(Debug, Clone)]
pub struct CatalogBuilder {
    root: PathBuf,
    entry_file: String,
    skip_markers: Vec<String>,
}

impl CatalogBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entry_file: "main.py".into(),
            skip_markers: vec!["__pycache__".into(), "_template".into()],
        }
    }

    pub fn from_config(cfg: &LessonsConfig) -> Self {
        Self {
            root: cfg.root.clone(),
            entry_file: cfg.entry_file.clone(),
            skip_markers: cfg.skip_markers.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_file(&self) -> &str {
        &self.entry_file
    }

    pub fn is_skipped(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.skip_markers.iter().any(|marker| text.contains(marker.as_str()))
    }

    /// Entry files under `dir`, in path order.
    pub fn discover(&self, dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for item in WalkDir::new(dir).sort_by_file_name() {
            let item = match item {
                Ok(item) => item,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable path during discovery");
                    continue;
                }
            };
            if item.file_type().is_file()
                && item.file_name().to_str() == Some(self.entry_file.as_str())
                && !self.is_skipped(item.path())
            {
                found.push(item.into_path());
            }
        }
        found
    }

    /// Scans each directory (relative to the root) and analyses every entry file.
    /// A file that fails analysis is logged and recorded in the report, never fatal.
    pub fn build(&self, scan_dirs: &[PathBuf]) -> CatalogReport {
        let mut report = CatalogReport::default();
        let mut seen = HashSet::new();
        for dir in scan_dirs {
            let dir = if dir.is_absolute() {
                dir.clone()
            } else {
                self.root.join(dir)
            };
            for path in self.discover(&dir) {
                match self.analyze(&path) {
                    Ok(entry) => {
                        tracing::info!(
                            name = %entry.name,
                            params = entry.params.len(),
                            tools = entry.tools.len(),
                            "parsed lesson"
                        );
                        if seen.insert(entry.id.clone()) {
                            report.entries.push(entry);
                        } else {
                            tracing::warn!(id = %entry.id, "duplicate catalog id ignored");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping lesson");
                        report.errors.push(DiscoveryFailure {
                            path,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }
        report.entries.sort_by(|a, b| {
            (a.example_number.unwrap_or(999), &a.path).cmp(&(b.example_number.unwrap_or(999), &b.path))
        });
        report
    }

    pub fn analyze(&self, path: &Path) -> Result<CatalogEntry> {
        let discovery = |reason: String| GatewayError::Discovery {
            path: path.to_path_buf(),
            reason,
        };
        let bytes = fs::read(path).map_err(|err| discovery(err.to_string()))?;
        let content = String::from_utf8(bytes).map_err(|err| discovery(err.to_string()))?;
        let source = ScriptSource::parse(content).map_err(discovery)?;
        if let Some(line) = source.syntax_error_line() {
            tracing::warn!(path = %path.display(), line, "syntax error, metadata is best effort");
        }
        Ok(self.describe(path, &source))
    }

    /// Builds the entry for an already-parsed script.
    pub fn describe(&self, path: &Path, source: &ScriptSource) -> CatalogEntry {
        let content = source.text();
        let rel_path = path.strip_prefix(&self.root).unwrap_or(path);
        let path_parts = dir_parts(rel_path);

        let doc = source.docstring().unwrap_or_default();
        let meta = DocstringMeta::parse(&doc);
        let defaults = source.default_config();
        let params = merge_params(&meta, &source.argument_calls(), &defaults);

        let (category, subcategory) = match meta.category.as_deref() {
            Some(declared) => {
                let mut parts = declared.split('/');
                let category = humanize(parts.next().unwrap_or_default().trim());
                let sub = parts.next().map(|s| humanize(s.trim()));
                (category, sub)
            }
            None if path_parts.len() >= 3 => {
                (humanize(&path_parts[1]), Some(humanize(&path_parts[2])))
            }
            None if path_parts.len() == 2 => ("Root".to_string(), None),
            None => ("General".to_string(), None),
        };

        let name = meta
            .name
            .clone()
            .or_else(|| legacy_name(&doc))
            .unwrap_or_else(|| {
                humanize(
                    &path
                        .parent()
                        .and_then(Path::file_name)
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                )
            });
        let description = meta
            .description
            .clone()
            .unwrap_or_else(|| legacy_description(&doc));

        let kind = if content.contains("Team(") {
            AgentKind::Team
        } else {
            AgentKind::Agent
        };

        let mut tools: BTreeSet<String> = detect_tools(content).into_iter().collect();
        for pattern in &meta.patterns {
            let lowered = pattern.to_ascii_lowercase();
            for (key, tool) in PATTERN_TOOLS {
                if lowered.contains(key) {
                    tools.insert(tool.to_string());
                }
            }
        }

        let rel = slash_path(rel_path);
        CatalogEntry {
            id: catalog_id(rel_path),
            name,
            category,
            subcategory,
            description,
            dir: slash_path(rel_path.parent().unwrap_or(Path::new(""))),
            path: rel,
            path_parts,
            params,
            kind,
            tools: tools.into_iter().collect(),
            patterns: meta.patterns.clone(),
            output_schemas: source.output_schemas(),
            imports: source.imports(),
            example_number: meta.example_number,
        }
    }
}

const PATTERN_TOOLS: [(&str, &str); 11] = [
    ("tools", "web"),
    ("duckduckgo", "web"),
    ("web", "web"),
    ("knowledge", "rag"),
    ("rag", "rag"),
    ("memory", "memory"),
    ("structured", "structured"),
    ("structured output", "structured"),
    ("team", "team"),
    ("teams", "team"),
    ("reasoning", "reasoning"),
];

const TOOL_MARKERS: [(&str, &[&str]); 9] = [
    ("web", &["DuckDuckGoTools", "TavilyTools", "SerpApiTools", "EXATools"]),
    ("rag", &["LanceDb", "Pinecone", "Qdrant", "Knowledge(", "knowledge="]),
    (
        "memory",
        &["SqliteDb", "PostgresDb", "enable_user_memories", "add_history_to_context"],
    ),
    ("structured", &["response_model=", "output_schema=", "BaseModel"]),
    ("team", &["Team(", "from agno.team"]),
    ("reasoning", &["reasoning=True", "Reasoner("]),
    ("files", &["FileTools", "PDFTools", "CsvTools"]),
    ("code", &["PythonTools", "ShellTools", "CodeInterpreter"]),
    ("api", &["ApiTools", "requests.", "httpx."]),
];

pub fn detect_tools(content: &str) -> Vec<String> {
    TOOL_MARKERS
        .iter()
        .filter(|(_, markers)| markers.iter().any(|m| content.contains(m)))
        .map(|(tag, _)| tag.to_string())
        .collect()
}

fn argparse_params(calls: &[ArgumentCall]) -> Vec<Param> {
    let mut params = Vec::new();
    for call in calls {
        let Some(first) = call.flags.first() else {
            continue;
        };
        let is_positional = !first.starts_with('-');
        let name = if is_positional {
            first.clone()
        } else {
            let long = call
                .flags
                .iter()
                .find(|f| f.starts_with("--"))
                .unwrap_or(first);
            long.trim_start_matches('-').replace('-', "_")
        };
        if RESERVED_PARAMS.contains(&name.as_str()) {
            continue;
        }

        let action = call.keyword("action").map(Literal::default_text);
        let param_type = match (action.as_deref(), call.keyword("type")) {
            (Some("store_true" | "store_false"), _) => ParamType::Boolean,
            (_, Some(Literal::Expr(t))) if t == "int" => ParamType::Integer,
            (_, Some(Literal::Expr(t))) if t == "float" => ParamType::Float,
            _ => ParamType::String,
        };
        let default = match call.keyword("default") {
            Some(Literal::Expr(expr)) if expr.contains("DEFAULT_CONFIG") => String::new(),
            Some(lit) => lit.default_text(),
            None => String::new(),
        };
        let description = match call.keyword("help") {
            Some(Literal::Str(help)) => help.clone(),
            _ => String::new(),
        };

        let mut param = Param::new(name, param_type, is_positional, default, description);
        param.required = if is_positional {
            !matches!(call.keyword("nargs"), Some(Literal::Str(n)) if n == "?" || n == "*")
        } else {
            matches!(call.keyword("required"), Some(Literal::Bool(true)))
        };
        params.push(param);
    }
    params
}

/// Docstring arguments first, then argparse flags, then remaining DEFAULT_CONFIG keys.
fn merge_params(
    meta: &DocstringMeta,
    calls: &[ArgumentCall],
    defaults: &[(String, Literal)],
) -> Vec<Param> {
    let config_default = |name: &str| {
        defaults
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, lit)| lit.default_text())
            .unwrap_or_default()
    };
    let mut params = Vec::new();
    let mut seen = HashSet::new();

    for arg in &meta.arguments {
        let default = if arg.default.is_empty() {
            config_default(&arg.name)
        } else {
            arg.default.clone()
        };
        params.push(Param::new(
            arg.name.clone(),
            ParamType::from_doc(&arg.type_name),
            false,
            default,
            arg.description.clone(),
        ));
        seen.insert(arg.name.clone());
    }

    let documented = !meta.arguments.is_empty();
    for mut param in argparse_params(calls) {
        if seen.contains(&param.name) {
            continue;
        }
        // CLI aliases of documented DEFAULT_CONFIG keys (e.g. --company for company_name).
        if documented
            && param.default.is_empty()
            && defaults
                .iter()
                .any(|(key, _)| key.contains(&param.name) || param.name.contains(key.as_str()))
        {
            continue;
        }
        if param.default.is_empty() {
            param.default = config_default(&param.name);
        }
        seen.insert(param.name.clone());
        params.push(param);
    }

    for (key, value) in defaults {
        if seen.contains(key) {
            continue;
        }
        let param_type = match value {
            Literal::Number(n) if n.contains('.') => ParamType::Float,
            Literal::Number(_) => ParamType::Integer,
            Literal::Bool(_) => ParamType::Boolean,
            _ => ParamType::String,
        };
        params.push(Param::new(
            key.clone(),
            param_type,
            false,
            value.default_text(),
            String::new(),
        ));
        seen.insert(key.clone());
    }
    params
}

/// `business_ops` -> `Business Ops`.
pub fn humanize(raw: &str) -> String {
    raw.replace('_', " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn dir_parts(rel_path: &Path) -> Vec<String> {
    rel_path
        .parent()
        .map(|parent| {
            parent
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Stable id: the relative path with separators folded into `__` and the extension dropped.
pub fn catalog_id(rel_path: &Path) -> String {
    let without_ext = rel_path.with_extension("");
    slash_path(&without_ext).replace('/', "__")
}

/// The prebuilt catalog artifact, immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(Self {
            entries: serde_json::from_str(&raw)?,
        })
    }

    /// Missing or unreadable catalogs degrade to an empty one.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(catalog) => catalog,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "catalog unavailable, starting empty");
                Self::default()
            }
        }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Result<&CatalogEntry> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| GatewayError::NotFound(format!("agent `{id}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_fold_separators_and_drop_extension() {
        let id = catalog_id(Path::new("07_real_world/business/sales/01_lead/main.py"));
        assert_eq!(id, "07_real_world__business__sales__01_lead__main");
    }

    #[test]
    fn humanizes_directory_names() {
        assert_eq!(humanize("01_hello_agent"), "01 Hello Agent");
        assert_eq!(humanize("business_OPS"), "Business Ops");
    }

    #[test]
    fn infers_ui_types() {
        assert_eq!(UiType::infer("pdf_path", "", ParamType::String), UiType::FilePdf);
        assert_eq!(UiType::infer("source_url", "", ParamType::String), UiType::Url);
        assert_eq!(UiType::infer("input_file", "", ParamType::String), UiType::FileAny);
        assert_eq!(UiType::infer("topic", "", ParamType::String), UiType::Textarea);
        assert_eq!(UiType::infer("verbose", "", ParamType::Boolean), UiType::Checkbox);
        assert_eq!(UiType::infer("mode", "one of: fast/slow", ParamType::String), UiType::Select);
        assert_eq!(UiType::infer("company", "", ParamType::String), UiType::Text);
    }

    #[test]
    fn argparse_conventions() {
        let src = ScriptSource::parse(
            r#"
parser.add_argument("query", nargs="?", default="What is Rust?")
parser.add_argument("--output-dir", "-o", default=None)
parser.add_argument("--model", "-m", default=None)
parser.add_argument("-t", "--temperature", type=float, default=0.7)
parser.add_argument("--limit", type=int, default=10, help="Max rows")
"#,
        )
        .unwrap();
        let params = argparse_params(&src.argument_calls());
        assert_eq!(params.len(), 3);
        assert!(params[0].is_positional);
        assert!(!params[0].required);
        assert_eq!(params[0].default, "What is Rust?");
        assert_eq!(params[1].name, "output_dir");
        assert_eq!(params[1].default, "");
        assert_eq!(params[2].param_type, ParamType::Integer);
        assert_eq!(params[2].default, "10");
        assert_eq!(params[2].description, "Max rows");
    }

    #[test]
    fn detects_tools_by_substring() {
        let tools = detect_tools("from agno.team import Team\nagent = Agent(tools=[DuckDuckGoTools()])");
        assert_eq!(tools, vec!["web", "team"]);
    }

    #[test]
    fn missing_catalog_is_empty() {
        let catalog = Catalog::load_or_empty("/no/such/catalog.json");
        assert!(catalog.entries().is_empty());
        assert!(matches!(catalog.get("x"), Err(GatewayError::NotFound(_))));
    }
}
