//! Seams between the execution engine and whatever actually runs a lesson.
//!
//! A [`ModuleLoader`] turns an entry file into a [`LessonModule`]; the module's
//! `get_agent` builds a [`LessonAgent`] for one run, which yields a stream of
//! [`RunChunk`]s.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::models::ModelHandle;

/// Usage figures attached to a chunk by the upstream provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetrics {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunChunk {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub metrics: Option<ChunkMetrics>,
}

impl RunChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            metrics: None,
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.metrics = Some(ChunkMetrics {
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
        });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunInput {
    pub query: String,
    pub kwargs: BTreeMap<String, Value>,
}

/// Per-run environment handed to the agent instead of mutating process state.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    /// Directory relative file references in the lesson resolve against.
    pub base_dir: PathBuf,
}

impl RunContext {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

pub type ChunkStream = BoxStream<'static, Result<RunChunk>>;

/// A configured agent ready for a single streamed run.
pub trait LessonAgent: Send {
    fn run(self: Box<Self>, input: RunInput, ctx: RunContext) -> Result<ChunkStream>;
}

/// A loaded lesson module exposing the `get_agent` entry point.
pub trait LessonModule: Send {
    fn name(&self) -> &str;

    /// Whether a `get_agent` taking zero or one argument is exposed.
    fn has_entry_point(&self) -> bool;

    fn get_agent(&self, model: Option<ModelHandle>) -> Result<Box<dyn LessonAgent>>;
}

pub trait ModuleLoader: Send + Sync {
    /// Loads a fresh, isolated module instance from `path`.
    fn load(&self, path: &Path) -> Result<Box<dyn LessonModule>>;
}
