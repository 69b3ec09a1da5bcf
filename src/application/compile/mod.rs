//! Document compilation pipeline.
//!
//! A request flows through staging, asset resolution, compiler invocation
//! and output reading inside a scratch workspace that is always released.
//! The external compiler is opaque: only its exit status, stderr, output
//! file and log file are observed.

mod assets;
mod diagnostics;
mod invoker;
mod pipeline;
mod profile;
mod types;
mod workspace;

pub use assets::{AssetError, AssetResolver, AssetResolverConfig};
pub use diagnostics::{ERROR_MARKER, extract as extract_diagnostics};
pub use invoker::{ChildProcessRunner, Invocation, InvokeError, ProcessRunner};
pub use pipeline::{
    CompilationPipeline, METRIC_ASSET_BYTES_TOTAL, METRIC_COMPILATIONS_IN_FLIGHT,
    METRIC_COMPILATIONS_TOTAL, METRIC_COMPILE_MS, PipelineConfig, PipelineInitError,
};
pub use profile::{
    ArgPart, BackendProfile, BackendProfiles, Finish, HTML_CONTENT_TYPE, LATEXML_STYLESHEET,
    PDF_CONTENT_TYPE,
};
pub use types::{
    Artifact, CompilationFailure, CompilationRequest, CompilationResult, CompilerOutcome, ExitKind,
    FailureClass, OutputKind, RequestError, ResolvedAsset, labels,
};
pub use workspace::Workspace;
