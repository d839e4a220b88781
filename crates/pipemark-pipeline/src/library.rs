//! Named collection of validated pipelines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use pipemark_types::{PipemarkError, Result};

use crate::engine::PipelineExecutor;
use crate::pipeline::Pipeline;
use crate::tools::ExecutionTools;

/// Pipeline sources are Markdown files.
const SOURCE_PATTERN: &str = "**/*.md";

/// Pipelines keyed by their URL, or by title when they declare none.
///
/// The library is an ordinary value owned by the caller; pipelines are
/// shared with the executors created from it.
#[derive(Debug, Clone, Default)]
pub struct PipelineLibrary {
    pipelines: BTreeMap<String, Arc<Pipeline>>,
}

impl PipelineLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile, validate and register every source.
    pub fn from_sources<'a>(sources: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut library = Self::new();
        for source in sources {
            library.add_source(source)?;
        }
        Ok(library)
    }

    /// Compile and register one source, returning the key it is stored under.
    pub fn add_source(&mut self, source: &str) -> Result<String> {
        self.add_pipeline(Pipeline::from_source(source)?)
    }

    pub fn add_pipeline(&mut self, pipeline: Pipeline) -> Result<String> {
        let key = pipeline
            .source_url()
            .unwrap_or_else(|| pipeline.title())
            .to_string();
        if self.pipelines.contains_key(&key) {
            return Err(PipemarkError::DuplicatePipeline { name: key });
        }
        tracing::debug!(pipeline = %key, steps = pipeline.steps().len(), "Registered pipeline");
        self.pipelines.insert(key.clone(), Arc::new(pipeline));
        Ok(key)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Pipeline>> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| PipemarkError::PipelineNotFound { name: name.into() })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn create_executor(&self, name: &str, tools: ExecutionTools) -> Result<PipelineExecutor> {
        Ok(PipelineExecutor::new(self.get(name)?, tools))
    }

    /// Register every `*.md` file below `dir`, recursively, in path order.
    /// Returns the keys of the pipelines that were added.
    pub async fn load_directory(&mut self, dir: &Path) -> Result<Vec<String>> {
        let set = source_globset()?;
        let mut files = Vec::new();
        collect_sources(dir, dir, &set, &mut files).await?;
        files.sort();

        let mut keys = Vec::with_capacity(files.len());
        for file in files {
            let source = tokio::fs::read_to_string(&file).await?;
            let pipeline = Pipeline::from_source(&source).map_err(|e| match e {
                PipemarkError::Syntax {
                    message,
                    source_snippet,
                } => PipemarkError::Syntax {
                    message: format!("{}: {message}", file.display()),
                    source_snippet,
                },
                PipemarkError::Validation { rule, message } => PipemarkError::Validation {
                    rule,
                    message: format!("{}: {message}", file.display()),
                },
                other => other,
            })?;
            keys.push(self.add_pipeline(pipeline)?);
        }
        tracing::info!(dir = %dir.display(), count = keys.len(), "Loaded pipeline library");
        Ok(keys)
    }
}

fn source_globset() -> Result<GlobSet> {
    let glob = Glob::new(SOURCE_PATTERN).map_err(|e| PipemarkError::Configuration(e.to_string()))?;
    let mut builder = GlobSetBuilder::new();
    builder.add(glob);
    builder
        .build()
        .map_err(|e| PipemarkError::Configuration(e.to_string()))
}

/// Recursively collect files matching a globset.
async fn collect_sources(
    base: &Path,
    current: &Path,
    set: &GlobSet,
    matches: &mut Vec<PathBuf>,
) -> Result<()> {
    let meta = tokio::fs::metadata(current).await?;
    if meta.is_file() {
        if let Ok(rel) = current.strip_prefix(base) {
            if set.is_match(rel) {
                matches.push(current.to_path_buf());
            }
        }
    } else if meta.is_dir() {
        let mut read_dir = tokio::fs::read_dir(current).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            Box::pin(collect_sources(base, &entry.path(), set, matches)).await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn source(title: &str, url: Option<&str>) -> String {
        let url_line = url.map(|u| format!("- PIPELINE URL {u}\n")).unwrap_or_default();
        format!(
            "# {title}\n\n{url_line}\n## Write\n\n- EXECUTE SIMPLE TEMPLATE\n\n```\nhello\n```\n\n-> {{greeting}}\n"
        )
    }

    #[test]
    fn keys_are_url_or_title() {
        let a = source("Alpha", Some("https://example.com/alpha.md"));
        let b = source("Beta", None);
        let library = PipelineLibrary::from_sources([a.as_str(), b.as_str()]).unwrap();
        assert_eq!(library.len(), 2);
        let names: Vec<_> = library.names().collect();
        assert_eq!(names, vec!["Beta", "https://example.com/alpha.md"]);
        assert_eq!(library.get("Beta").unwrap().title(), "Beta");
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut library = PipelineLibrary::new();
        library.add_source(&source("Alpha", None)).unwrap();
        let err = library.add_source(&source("Alpha", None)).unwrap_err();
        assert!(matches!(err, PipemarkError::DuplicatePipeline { ref name } if name == "Alpha"));
    }

    #[test]
    fn missing_pipeline_is_not_found() {
        let library = PipelineLibrary::new();
        assert!(library.is_empty());
        let err = library.get("nope").unwrap_err();
        assert!(matches!(err, PipemarkError::PipelineNotFound { ref name } if name == "nope"));
        assert!(library.create_executor("nope", ExecutionTools::new()).is_err());
    }

    #[tokio::test]
    async fn executor_from_library_runs() {
        let library = PipelineLibrary::from_sources([source("Alpha", None).as_str()]).unwrap();
        let executor = library.create_executor("Alpha", ExecutionTools::new()).unwrap();
        let result = executor.execute(Default::default()).await.unwrap();
        assert_eq!(result.parameters["greeting"], "hello");
    }
}
