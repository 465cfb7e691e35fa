//! Runtime index of `<module>/<lesson>` directories, built by re-walking the tree.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use walkdir::WalkDir;

use crate::agent::{LessonAgent, ModuleLoader};
use crate::catalog::{humanize, CatalogBuilder, CatalogEntry};
use crate::error::{GatewayError, Result};
use crate::models::{ModelHandle, ModelResolver, ModelSelection};

const MESSAGE_PARAMS: [&str; 4] = ["message", "query", "prompt", "question"];

#[derive(Debug, Clone, Serialize)]
pub struct LessonEntry {
    #[serde(flatten)]
    pub entry: CatalogEntry,
    pub module: String,
    pub lesson: String,
    pub key: String,
    pub title: String,
    pub readme_summary: String,
    pub has_readme: bool,
    pub default_message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleSummary {
    pub id: String,
    pub title: String,
    pub lessons: Vec<LessonEntry>,
}

/// An agent together with the model it was built against.
pub struct LoadedAgent {
    pub agent: Box<dyn LessonAgent>,
    pub model: ModelHandle,
}

pub struct LessonRegistry {
    root: PathBuf,
    entry_file: String,
    modules: Vec<(String, String)>,
    lessons: BTreeMap<String, LessonEntry>,
    loader: Arc<dyn ModuleLoader>,
    resolver: Arc<dyn ModelResolver>,
}

fn numbered_dirs(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|item| item.file_type().is_dir())
        .filter(|item| {
            item.file_name()
                .to_str()
                .and_then(|name| name.chars().next())
                .is_some_and(|c| c.is_ascii_digit())
        })
        .map(|item| item.into_path())
        .collect()
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `01_getting_started` -> `Getting Started`.
pub fn module_title(id: &str) -> String {
    humanize(id.trim_start_matches(|c: char| c.is_ascii_digit()).trim_start_matches('_'))
}

/// The README's `# ` heading and the first paragraph line after it.
fn readme_heading(readme: &str) -> (Option<String>, String) {
    let mut title = None;
    let mut summary = String::new();
    for line in readme.lines().map(str::trim) {
        if title.is_none() {
            if let Some(heading) = line.strip_prefix("# ") {
                title = Some(heading.trim().to_string());
            }
            continue;
        }
        if !line.is_empty() && !line.starts_with('#') {
            summary = line.to_string();
            break;
        }
    }
    (title, summary)
}

fn default_message(entry: &CatalogEntry) -> String {
    entry
        .params
        .iter()
        .find(|p| p.is_positional)
        .or_else(|| {
            entry
                .params
                .iter()
                .find(|p| MESSAGE_PARAMS.contains(&p.name.as_str()))
        })
        .map(|p| p.default.clone())
        .unwrap_or_default()
}

impl LessonRegistry {
    /// Walks `<root>/<NN_module>/<NN_lesson>/<entry_file>`. Lessons that fail analysis
    /// are logged and left out.
    pub fn scan(
        builder: &CatalogBuilder,
        loader: Arc<dyn ModuleLoader>,
        resolver: Arc<dyn ModelResolver>,
    ) -> Self {
        let mut modules = Vec::new();
        let mut lessons = BTreeMap::new();

        for module_dir in numbered_dirs(builder.root()) {
            let module = dir_name(&module_dir);
            if builder.is_skipped(&module_dir) {
                continue;
            }
            let mut found = 0usize;
            for lesson_dir in numbered_dirs(&module_dir) {
                let entry_path = lesson_dir.join(builder.entry_file());
                if !entry_path.is_file() || builder.is_skipped(&lesson_dir) {
                    continue;
                }
                let entry = match builder.analyze(&entry_path) {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!(path = %entry_path.display(), error = %err, "skipping lesson");
                        continue;
                    }
                };
                let lesson = dir_name(&lesson_dir);
                let readme = fs::read_to_string(lesson_dir.join("README.md")).ok();
                let (heading, readme_summary) = readme
                    .as_deref()
                    .map(readme_heading)
                    .unwrap_or_default();
                let key = format!("{module}/{lesson}");
                lessons.insert(
                    key.clone(),
                    LessonEntry {
                        title: heading.unwrap_or_else(|| entry.name.clone()),
                        readme_summary,
                        has_readme: readme.is_some(),
                        default_message: default_message(&entry),
                        module: module.clone(),
                        lesson,
                        key,
                        entry,
                    },
                );
                found += 1;
            }
            if found > 0 {
                modules.push((module.clone(), module_title(&module)));
            }
        }
        tracing::info!(modules = modules.len(), lessons = lessons.len(), "lesson registry built");

        // Absolute, so resolution is unaffected by a switched process cwd.
        let root = builder
            .root()
            .canonicalize()
            .unwrap_or_else(|_| builder.root().to_path_buf());
        Self {
            root,
            entry_file: builder.entry_file().to_string(),
            modules,
            lessons,
            loader,
            resolver,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.lessons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lessons.is_empty()
    }

    pub fn get(&self, key: &str) -> Result<&LessonEntry> {
        self.lessons
            .get(key)
            .ok_or_else(|| GatewayError::NotFound(format!("lesson `{key}`")))
    }

    pub fn lesson(&self, module: &str, lesson: &str) -> Result<&LessonEntry> {
        self.get(&format!("{module}/{lesson}"))
    }

    pub fn lessons(&self) -> impl Iterator<Item = &LessonEntry> {
        self.lessons.values()
    }

    pub fn modules(&self) -> Vec<ModuleSummary> {
        self.modules
            .iter()
            .map(|(id, title)| ModuleSummary {
                id: id.clone(),
                title: title.clone(),
                lessons: self
                    .lessons
                    .values()
                    .filter(|lesson| &lesson.module == id)
                    .cloned()
                    .collect(),
            })
            .collect()
    }

    /// Path of a file given relative to the project root.
    pub fn resolve(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// README text, empty when the lesson has none.
    pub fn readme(&self, key: &str) -> Result<String> {
        let entry = self.get(key)?;
        let path = self.resolve(&entry.entry.dir).join("README.md");
        Ok(fs::read_to_string(path).unwrap_or_default())
    }

    pub fn source(&self, key: &str) -> Result<String> {
        let entry = self.get(key)?;
        let path = self.resolve(&entry.entry.dir).join(&self.entry_file);
        fs::read_to_string(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => GatewayError::NotFound(format!("source of `{key}`")),
            _ => GatewayError::Io(err),
        })
    }

    /// Loads `path` fresh, checks its entry point, resolves the model and builds the agent.
    pub fn instantiate(&self, path: &Path, selection: &ModelSelection) -> Result<LoadedAgent> {
        let module = self.loader.load(path)?;
        if !module.has_entry_point() {
            return Err(GatewayError::MissingEntryPoint(module.name().to_string()));
        }
        let model = self.resolver.resolve(selection)?;
        tracing::debug!(module = module.name(), provider = %model.provider, model = %model.id, "instantiating agent");
        let agent = module.get_agent(Some(model.clone()))?;
        Ok(LoadedAgent { agent, model })
    }

    pub fn get_agent_instance(
        &self,
        module: &str,
        lesson: &str,
        selection: &ModelSelection,
    ) -> Result<Box<dyn LessonAgent>> {
        let entry = self.lesson(module, lesson)?;
        Ok(self.instantiate(&self.resolve(&entry.entry.path), selection)?.agent)
    }
}
