//! Analysis engine trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use dispatch_core::{DatasetRef, JobId, WorkItemId, WorkMessage};
use tokio::io::AsyncWriteExt;

/// What an engine is asked to do for one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub job_id: JobId,
    pub item_id: WorkItemId,
    pub tool: String,
    pub query: String,
    pub dataset: DatasetRef,
}

impl From<&WorkMessage> for AnalysisRequest {
    fn from(message: &WorkMessage) -> Self {
        Self {
            job_id: message.job_id,
            item_id: message.item_id,
            tool: message.tool.clone(),
            query: message.query.clone(),
            dataset: message.dataset.clone(),
        }
    }
}

/// What an engine produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    /// Result blob, stored as the artifact on success.
    pub result: Bytes,
    pub success: bool,
    /// Human-readable detail, recorded on the item when `success` is false.
    pub diagnostic: Option<String>,
}

impl EngineOutput {
    pub fn success(result: impl Into<Bytes>) -> Self {
        Self {
            result: result.into(),
            success: true,
            diagnostic: None,
        }
    }

    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self {
            result: Bytes::new(),
            success: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// Result type for engine invocations. `Err` means the engine could not be
/// run at all.
pub type EngineResult = Result<EngineOutput, String>;

/// Future type for async engine invocations.
pub type EngineFuture = Pin<Box<dyn Future<Output = EngineResult> + Send>>;

/// Trait for analysis engines.
///
/// Implement this trait to plug a tool into the worker pool. An engine may
/// fail, hang or panic; the pool bounds every call with a timeout and
/// restarts the unit after a panic.
pub trait AnalysisEngine: Send + Sync + 'static {
    /// The tool identifier this engine handles.
    fn tool(&self) -> &str;

    /// Analyse one dataset.
    fn analyze(&self, dataset: Bytes, request: &AnalysisRequest) -> EngineFuture;
}

/// Registry for analysis engines.
///
/// Maps tool identifiers to their engines for dynamic dispatch.
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn AnalysisEngine>>,
}

impl EngineRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    /// Register an engine for its tool.
    pub fn register<E: AnalysisEngine>(&mut self, engine: E) {
        let tool = engine.tool().to_string();
        self.engines.insert(tool, Arc::new(engine));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<E: AnalysisEngine>(mut self, engine: E) -> Self {
        self.register(engine);
        self
    }

    /// Get the engine for a tool.
    pub fn get(&self, tool: &str) -> Option<Arc<dyn AnalysisEngine>> {
        self.engines.get(tool).cloned()
    }

    /// Check if an engine exists for a tool.
    pub fn has_engine(&self, tool: &str) -> bool {
        self.engines.contains_key(tool)
    }

    /// List all registered tools, sorted.
    pub fn tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = self.engines.keys().cloned().collect();
        tools.sort();
        tools
    }
}

/// A simple function-based engine.
pub struct FnEngine<F>
where
    F: Fn(Bytes, &AnalysisRequest) -> EngineFuture + Send + Sync + 'static,
{
    tool: String,
    engine: F,
}

impl<F> FnEngine<F>
where
    F: Fn(Bytes, &AnalysisRequest) -> EngineFuture + Send + Sync + 'static,
{
    /// Create a new function-based engine.
    pub fn new(tool: impl Into<String>, engine: F) -> Self {
        Self {
            tool: tool.into(),
            engine,
        }
    }
}

impl<F> AnalysisEngine for FnEngine<F>
where
    F: Fn(Bytes, &AnalysisRequest) -> EngineFuture + Send + Sync + 'static,
{
    fn tool(&self) -> &str {
        &self.tool
    }

    fn analyze(&self, dataset: Bytes, request: &AnalysisRequest) -> EngineFuture {
        (self.engine)(dataset, request)
    }
}

/// Helper macro for creating engines from async closures.
///
/// ```ignore
/// let engine = analysis_engine!("count", |dataset, request| {
///     Ok(EngineOutput::success(dataset.len().to_string()))
/// });
/// ```
#[macro_export]
macro_rules! analysis_engine {
    ($tool:expr, |$dataset:ident, $request:ident| $body:expr) => {
        $crate::FnEngine::new(
            $tool,
            |$dataset: ::bytes::Bytes, $request: &$crate::AnalysisRequest| {
                let $request = $request.clone();
                Box::pin(async move {
                    let result: $crate::EngineResult = $body;
                    result
                }) as $crate::EngineFuture
            },
        )
    };
}

/// Engine that runs an external program per work item.
///
/// The dataset is written to the program's stdin and its stdout becomes
/// the result. A zero exit status means success; stderr is kept as the
/// diagnostic. The request is passed in `DISPATCH_*` environment variables.
/// The child is killed if the invocation times out.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    tool: String,
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(tool: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl AnalysisEngine for CommandEngine {
    fn tool(&self) -> &str {
        &self.tool
    }

    fn analyze(&self, dataset: Bytes, request: &AnalysisRequest) -> EngineFuture {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env("DISPATCH_TOOL", &request.tool)
            .env("DISPATCH_QUERY", &request.query)
            .env("DISPATCH_DATASET", request.dataset.as_str())
            .env("DISPATCH_JOB_ID", request.job_id.to_string())
            .env("DISPATCH_ITEM_ID", request.item_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let program = self.program.display().to_string();

        Box::pin(async move {
            let mut child = command
                .spawn()
                .map_err(|e| format!("failed to start {program}: {e}"))?;

            // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe.
            let stdin = child.stdin.take();
            let feeder = async move {
                if let Some(mut stdin) = stdin {
                    // A child that exits without reading its input is not an error here.
                    let _ = stdin.write_all(&dataset).await;
                    let _ = stdin.shutdown().await;
                }
            };
            let (_, output) = tokio::join!(feeder, child.wait_with_output());
            let output = output.map_err(|e| format!("failed to wait for {program}: {e}"))?;

            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if output.status.success() {
                Ok(EngineOutput {
                    result: Bytes::from(output.stdout),
                    success: true,
                    diagnostic: (!stderr.is_empty()).then_some(stderr),
                })
            } else {
                let diagnostic = if stderr.is_empty() {
                    format!("{program} exited with {}", output.status)
                } else {
                    format!("{program} exited with {}: {stderr}", output.status)
                };
                Ok(EngineOutput {
                    result: Bytes::from(output.stdout),
                    success: false,
                    diagnostic: Some(diagnostic),
                })
            }
        })
    }
}
