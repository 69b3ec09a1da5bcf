use std::{
    collections::BTreeMap,
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::{fs, sync::Semaphore};
use tracing::{debug, error, info, warn};

use super::{
    assets::{AssetResolver, AssetResolverConfig},
    diagnostics,
    invoker::ProcessRunner,
    profile::{BackendProfile, BackendProfiles},
    types::{
        Artifact, CompilationFailure, CompilationRequest, CompilationResult, CompilerOutcome,
        ExitKind, FailureClass, OutputKind, labels,
    },
    workspace::Workspace,
};

pub const METRIC_COMPILATIONS_TOTAL: &str = "texrender_compilations_total";
pub const METRIC_COMPILE_MS: &str = "texrender_compile_ms";
pub const METRIC_ASSET_BYTES_TOTAL: &str = "texrender_asset_bytes_total";
pub const METRIC_COMPILATIONS_IN_FLIGHT: &str = "texrender_compilations_in_flight";

/// Everything the pipeline needs at construction time.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub scratch_root: PathBuf,
    pub max_concurrent: usize,
    pub deadline: Duration,
    pub profiles: BackendProfiles,
    pub assets: AssetResolverConfig,
}

impl From<&crate::config::Settings> for PipelineConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            scratch_root: settings.compile.scratch_dir.clone(),
            max_concurrent: settings.compile.max_concurrent.get() as usize,
            deadline: settings.compile.deadline,
            profiles: BackendProfiles::from(&settings.compile),
            assets: AssetResolverConfig::from(&settings.assets),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineInitError {
    #[error("failed to prepare scratch directory: {0}")]
    ScratchDir(#[source] io::Error),
    #[error("failed to build asset HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Compiles one document per call: stage the source, fetch assets, run the
/// backend, read the artifact. The workspace is released on every path.
pub struct CompilationPipeline {
    scratch_root: PathBuf,
    resolver: AssetResolver,
    runner: Arc<dyn ProcessRunner>,
    profiles: BackendProfiles,
    admission: Semaphore,
    deadline: Duration,
}

impl CompilationPipeline {
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self, PipelineInitError> {
        std::fs::create_dir_all(&config.scratch_root).map_err(PipelineInitError::ScratchDir)?;
        let resolver = AssetResolver::new(config.assets).map_err(PipelineInitError::HttpClient)?;

        Ok(Self {
            scratch_root: config.scratch_root,
            resolver,
            runner,
            profiles: config.profiles,
            admission: Semaphore::new(config.max_concurrent.max(1)),
            deadline: config.deadline,
        })
    }

    /// Stop admitting new compilations. Admitted ones run to completion;
    /// queued and later requests fail as unavailable.
    pub fn close_admission(&self) {
        self.admission.close();
    }

    /// Validate raw request parts, then compile. Invalid input never reaches
    /// the filesystem or the compiler.
    pub async fn submit(
        &self,
        source: String,
        assets: BTreeMap<String, String>,
        output: OutputKind,
    ) -> CompilationResult {
        match CompilationRequest::new(source, assets, output) {
            Ok(request) => self.compile(request).await,
            Err(err) => {
                let failure = CompilationFailure::from(err);
                record_outcome(output, &Err(failure.clone()), Instant::now());
                Err(failure)
            }
        }
    }

    /// Run the whole pipeline under the overall request deadline.
    ///
    /// Hitting the deadline drops the in-flight stage, which cancels asset
    /// downloads, kills the compiler and releases the workspace in `Drop`.
    pub async fn compile(&self, request: CompilationRequest) -> CompilationResult {
        let started_at = Instant::now();
        let output = request.output();

        let result = match tokio::time::timeout(self.deadline, self.run_admitted(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(
                CompilationFailure::new(FailureClass::Unavailable, labels::DEADLINE_EXCEEDED)
                    .with_detail(format!(
                        "request exceeded {}s deadline",
                        self.deadline.as_secs()
                    )),
            ),
        };

        record_outcome(output, &result, started_at);
        match &result {
            Ok(artifact) => info!(
                target = "application::compile::pipeline",
                op = "pipeline::compile",
                result = "success",
                output = %output,
                assets = request.assets().len(),
                artifact_bytes = artifact.bytes.len(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Document compiled"
            ),
            Err(failure) => warn!(
                target = "application::compile::pipeline",
                op = "pipeline::compile",
                result = "error",
                output = %output,
                class = failure.class.as_str(),
                label = failure.label,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Document compilation failed"
            ),
        }

        result
    }

    async fn run_admitted(&self, request: &CompilationRequest) -> CompilationResult {
        let _permit = self.admission.acquire().await.map_err(|_| {
            CompilationFailure::new(FailureClass::Unavailable, labels::SHUTTING_DOWN)
        })?;
        let _in_flight = InFlight::enter();

        let mut workspace = Workspace::acquire(&self.scratch_root);
        let result = self.run_stages(request, &mut workspace).await;
        workspace.release().await;
        result
    }

    async fn run_stages(
        &self,
        request: &CompilationRequest,
        workspace: &mut Workspace,
    ) -> CompilationResult {
        let profile = self.profiles.get(request.output());

        // Staging
        workspace.stage(request.source()).await.map_err(|err| {
            error!(
                target = "application::compile::pipeline",
                op = "pipeline::stage",
                result = "error",
                workspace_id = %workspace.id(),
                error = %err,
                "Failed to write compiler input"
            );
            CompilationFailure::new(FailureClass::Internal, labels::CANNOT_WRITE_INPUT)
        })?;

        // Resolving assets
        if !request.assets().is_empty() {
            let resolved = self
                .resolver
                .resolve(request.assets(), workspace)
                .await
                .map_err(|err| {
                    CompilationFailure::new(FailureClass::Asset, labels::ASSET_FETCH_FAILED)
                        .with_detail(err.to_string())
                })?;
            counter!(METRIC_ASSET_BYTES_TOTAL)
                .increment(resolved.iter().map(|asset| asset.size_bytes).sum());
            workspace.adopt_assets(resolved);
        }

        // Compiling
        debug!(
            target = "application::compile::pipeline",
            op = "pipeline::invoke",
            workspace_id = %workspace.id(),
            program = %profile.program.display(),
            "Invoking compiler"
        );
        let outcome = self
            .runner
            .run(&profile.invocation(workspace))
            .await
            .map_err(|err| {
                error!(
                    target = "application::compile::pipeline",
                    op = "pipeline::invoke",
                    result = "error",
                    workspace_id = %workspace.id(),
                    error = ?err,
                    "Compiler could not be started"
                );
                CompilationFailure::new(FailureClass::Internal, labels::COMPILER_UNAVAILABLE)
            })?;

        if !outcome.exit.success() {
            let outcome = attach_diagnostics(outcome, workspace).await;
            return Err(compilation_failure(profile, &outcome));
        }

        // Reading output
        let raw = fs::read(profile.output_path(workspace))
            .await
            .map_err(|err| {
                error!(
                    target = "application::compile::pipeline",
                    op = "pipeline::read_output",
                    result = "error",
                    workspace_id = %workspace.id(),
                    error = %err,
                    "Compiler reported success but output is unreadable"
                );
                CompilationFailure::new(FailureClass::Internal, labels::CANNOT_READ_OUTPUT)
            })?;

        Ok(Artifact {
            content_type: profile.content_type,
            bytes: profile.finish(raw),
        })
    }
}

/// Admitted-compilation gauge guard. Decrements on drop, so requests
/// cancelled by the deadline are counted out as well.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        gauge!(METRIC_COMPILATIONS_IN_FLIGHT).increment(1.0);
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        gauge!(METRIC_COMPILATIONS_IN_FLIGHT).decrement(1.0);
    }
}

/// Summarise a failed run, preferring stderr and falling back to the log
/// file when the compiler wrote nothing there.
async fn attach_diagnostics(outcome: CompilerOutcome, workspace: &Workspace) -> CompilerOutcome {
    let raw = if outcome.stderr.trim().is_empty() {
        match fs::read(workspace.log_path()).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                debug!(
                    target = "application::compile::pipeline",
                    op = "pipeline::diagnostics",
                    workspace_id = %workspace.id(),
                    error = %err,
                    "No compiler log available"
                );
                String::new()
            }
        }
    } else {
        outcome.stderr.clone()
    };

    let summary = workspace.redact(diagnostics::extract(&raw).trim_end());
    CompilerOutcome {
        diagnostics: (!summary.is_empty()).then_some(summary),
        ..outcome
    }
}

fn compilation_failure(profile: &BackendProfile, outcome: &CompilerOutcome) -> CompilationFailure {
    let summary = outcome.diagnostics.as_deref().unwrap_or_default();
    let detail = match outcome.exit {
        ExitKind::TimedOut { after_secs } if summary.is_empty() => {
            format!("compilation timed out after {after_secs}s")
        }
        ExitKind::TimedOut { after_secs } => {
            format!("compilation timed out after {after_secs}s\n{summary}")
        }
        ExitKind::Failed { code: Some(code) } if summary.is_empty() => {
            format!("compiler exited with status {code}")
        }
        _ => summary.to_string(),
    };

    CompilationFailure::new(FailureClass::Compilation, profile.failure_label).with_detail(detail)
}

fn record_outcome(output: OutputKind, result: &CompilationResult, started_at: Instant) {
    let class = match result {
        Ok(_) => "success",
        Err(failure) => failure.class.as_str(),
    };
    counter!(
        METRIC_COMPILATIONS_TOTAL,
        "output" => output.as_str(),
        "result" => class
    )
    .increment(1);
    histogram!(METRIC_COMPILE_MS, "output" => output.as_str())
        .record(started_at.elapsed().as_secs_f64() * 1000.0);
}
