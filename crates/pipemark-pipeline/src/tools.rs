//! The execution backends a pipeline run calls into.

use std::sync::Arc;

use pipemark_llm::NaturalLanguageTools;
use pipemark_tools::{ScriptTool, UserInterfaceTools};

use crate::postprocessing::PostprocessingRegistry;

/// Tools supplied by the caller for one or more runs.
///
/// Every backend is optional; a step whose backend is missing fails with a
/// configuration error when it is reached. Script tools are tried in the
/// order they were added.
#[derive(Clone, Default)]
pub struct ExecutionTools {
    pub natural_language: Option<Arc<dyn NaturalLanguageTools>>,
    pub script: Vec<Arc<dyn ScriptTool>>,
    pub user_interface: Option<Arc<dyn UserInterfaceTools>>,
    pub postprocessing: PostprocessingRegistry,
}

impl ExecutionTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_natural_language(mut self, tools: impl NaturalLanguageTools + 'static) -> Self {
        self.natural_language = Some(Arc::new(tools));
        self
    }

    pub fn with_script_tool(mut self, tool: impl ScriptTool + 'static) -> Self {
        self.script.push(Arc::new(tool));
        self
    }

    pub fn with_user_interface(mut self, tools: impl UserInterfaceTools + 'static) -> Self {
        self.user_interface = Some(Arc::new(tools));
        self
    }

    pub fn with_postprocessing(mut self, registry: PostprocessingRegistry) -> Self {
        self.postprocessing = registry;
        self
    }
}

impl std::fmt::Debug for ExecutionTools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTools")
            .field(
                "natural_language",
                &self.natural_language.as_ref().map(|t| t.name().to_string()),
            )
            .field(
                "script",
                &self.script.iter().map(|t| t.name().to_string()).collect::<Vec<_>>(),
            )
            .field("user_interface", &self.user_interface.is_some())
            .field("postprocessing", &self.postprocessing)
            .finish()
    }
}
