//! Engine registry for the binary.

use actors::{CommandEngine, EngineOutput, EngineRegistry, analysis_engine};

#[derive(Debug, thiserror::Error)]
pub enum EngineSpecError {
    #[error("engine entry '{0}' is not of the form tool=program [args...]")]
    Malformed(String),

    #[error("tool '{0}' is registered twice")]
    Duplicate(String),
}

/// One `tool=program args...` entry of `DISPATCH_ENGINES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub tool: String,
    pub program: String,
    pub args: Vec<String>,
}

/// Parse a `;`-separated list of `tool=program [args...]` entries.
pub fn parse_engine_specs(raw: &str) -> Result<Vec<CommandSpec>, EngineSpecError> {
    let mut specs: Vec<CommandSpec> = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (tool, command) = entry
            .split_once('=')
            .ok_or_else(|| EngineSpecError::Malformed(entry.to_string()))?;
        let tool = tool.trim();
        let mut words = command.split_whitespace();
        let program = words
            .next()
            .filter(|_| !tool.is_empty())
            .ok_or_else(|| EngineSpecError::Malformed(entry.to_string()))?;
        if specs.iter().any(|s| s.tool == tool) {
            return Err(EngineSpecError::Duplicate(tool.to_string()));
        }
        specs.push(CommandSpec {
            tool: tool.to_string(),
            program: program.to_string(),
            args: words.map(str::to_string).collect(),
        });
    }
    Ok(specs)
}

/// Built-in `byte-count` engine plus every command engine in `DISPATCH_ENGINES`.
pub fn build_registry() -> Result<EngineRegistry, EngineSpecError> {
    let mut registry = EngineRegistry::new().with(analysis_engine!(
        "byte-count",
        |dataset, request| {
            tracing::debug!("Counting {} for item {}", request.dataset, request.item_id);
            Ok(EngineOutput::success(dataset.len().to_string()))
        }
    ));

    let raw = std::env::var("DISPATCH_ENGINES").unwrap_or_default();
    for spec in parse_engine_specs(&raw)? {
        if registry.has_engine(&spec.tool) {
            return Err(EngineSpecError::Duplicate(spec.tool));
        }
        tracing::info!("Registering command engine {} ({})", spec.tool, spec.program);
        registry.register(CommandEngine::new(spec.tool, spec.program).with_args(spec.args));
    }
    Ok(registry)
}
