use std::{collections::BTreeMap, fmt, path::PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::workspace::asset_file_name;

/// Output kind requested by the caller; selects the backend profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// HTML fragment with an inline stylesheet, produced by LaTeXML.
    HtmlFragment,
    /// PDF document produced by pdflatex.
    Pdf,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::HtmlFragment => "html",
            OutputKind::Pdf => "pdf",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated compilation request handed to the pipeline.
///
/// Asset names are map keys, so uniqueness holds by construction. The source
/// is guaranteed non-empty once [`CompilationRequest::new`] succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationRequest {
    source: String,
    assets: BTreeMap<String, Url>,
    output: OutputKind,
}

impl CompilationRequest {
    pub fn new(
        source: impl Into<String>,
        assets: BTreeMap<String, String>,
        output: OutputKind,
    ) -> Result<Self, RequestError> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(RequestError::EmptySource);
        }

        let mut resolved = BTreeMap::new();
        for (name, reference) in assets {
            if asset_file_name(&name).is_none() {
                return Err(RequestError::InvalidAssetName { name });
            }
            let url = match Url::parse(reference.trim()) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => url,
                _ => return Err(RequestError::InvalidAssetUrl { name }),
            };
            resolved.insert(name, url);
        }

        Ok(Self {
            source,
            assets: resolved,
            output,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn assets(&self) -> &BTreeMap<String, Url> {
        &self.assets
    }

    pub fn output(&self) -> OutputKind {
        self.output
    }
}

/// Input errors detected before any filesystem or process work happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("content is required")]
    EmptySource,
    #[error("asset `{name}` has no usable file name")]
    InvalidAssetName { name: String },
    #[error("asset `{name}` must reference an http(s) URL")]
    InvalidAssetUrl { name: String },
}

/// Asset fetched into a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// How the compiler process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Failed { code: Option<i32> },
    TimedOut { after_secs: u64 },
}

impl ExitKind {
    pub fn success(&self) -> bool {
        matches!(self, ExitKind::Success)
    }
}

/// Result of one compiler run. `diagnostics` is only populated for failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOutcome {
    pub exit: ExitKind,
    pub stderr: String,
    pub diagnostics: Option<String>,
}

/// Rendered artifact returned on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub content_type: &'static str,
    pub bytes: Bytes,
}

/// Which side is at fault; drives the transport status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Malformed or missing input; the compiler was never invoked.
    Input,
    /// An asset could not be fetched or stored.
    Asset,
    /// The compiler rejected the document or ran out of time.
    Compilation,
    /// The pipeline itself is broken (write/read faults, missing binary).
    Internal,
    /// The request could not be served in time.
    Unavailable,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Input => "input",
            FailureClass::Asset => "asset",
            FailureClass::Compilation => "compilation",
            FailureClass::Internal => "internal",
            FailureClass::Unavailable => "unavailable",
        }
    }

    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            FailureClass::Input | FailureClass::Asset | FailureClass::Compilation
        )
    }
}

pub mod labels {
    pub const CONTENT_REQUIRED: &str = "content is required";
    pub const INVALID_ASSET: &str = "invalid asset reference";
    pub const ASSET_FETCH_FAILED: &str = "asset fetch failed";
    pub const RENDER_FAILED: &str = "render failed";
    pub const PDF_RENDER_FAILED: &str = "pdf render failed";
    pub const CANNOT_WRITE_INPUT: &str = "cannot write input";
    pub const CANNOT_READ_OUTPUT: &str = "cannot read output";
    pub const COMPILER_UNAVAILABLE: &str = "compiler unavailable";
    pub const DEADLINE_EXCEEDED: &str = "request deadline exceeded";
    pub const SHUTTING_DOWN: &str = "service shutting down";
}

/// Structured failure crossing the boundary to the transport adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationFailure {
    pub class: FailureClass,
    pub label: &'static str,
    pub detail: Option<String>,
}

impl CompilationFailure {
    pub fn new(class: FailureClass, label: &'static str) -> Self {
        Self {
            class,
            label,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.is_empty() {
            self.detail = Some(detail);
        }
        self
    }
}

impl From<RequestError> for CompilationFailure {
    fn from(error: RequestError) -> Self {
        match error {
            RequestError::EmptySource => {
                CompilationFailure::new(FailureClass::Input, labels::CONTENT_REQUIRED)
            }
            other => CompilationFailure::new(FailureClass::Input, labels::INVALID_ASSET)
                .with_detail(other.to_string()),
        }
    }
}

impl fmt::Display for CompilationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.label),
            None => f.write_str(self.label),
        }
    }
}

pub type CompilationResult = Result<Artifact, CompilationFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    fn assets(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(name, url)| (name.to_string(), url.to_string()))
            .collect()
    }

    #[test]
    fn rejects_blank_source() {
        let err = CompilationRequest::new("  \n\t", BTreeMap::new(), OutputKind::Pdf)
            .expect_err("blank source must be rejected");
        assert_eq!(err, RequestError::EmptySource);
        assert_eq!(
            CompilationFailure::from(err).label,
            labels::CONTENT_REQUIRED
        );
    }

    #[test]
    fn rejects_non_http_asset_urls() {
        let err = CompilationRequest::new(
            "\\documentclass{article}",
            assets(&[("logo.png", "file:///etc/passwd")]),
            OutputKind::HtmlFragment,
        )
        .expect_err("file URLs are not assets");
        assert!(matches!(err, RequestError::InvalidAssetUrl { ref name } if name == "logo.png"));

        let failure = CompilationFailure::from(err);
        assert_eq!(failure.class, FailureClass::Input);
        assert_eq!(failure.label, labels::INVALID_ASSET);
        assert!(failure.detail.unwrap().contains("logo.png"));
    }

    #[test]
    fn rejects_asset_names_without_base_name() {
        let err = CompilationRequest::new(
            "x",
            assets(&[("..", "https://example.com/a.png")]),
            OutputKind::Pdf,
        )
        .expect_err("parent segment alone is not a file name");
        assert!(matches!(err, RequestError::InvalidAssetName { .. }));
    }

    #[test]
    fn accepts_traversal_names_that_reduce_to_a_base_name() {
        let request = CompilationRequest::new(
            "x",
            assets(&[("../../img/figure.png", "https://example.com/f.png")]),
            OutputKind::Pdf,
        )
        .expect("base name is usable");
        assert_eq!(request.assets().len(), 1);
    }

    #[test]
    fn empty_detail_is_dropped() {
        let failure =
            CompilationFailure::new(FailureClass::Compilation, labels::RENDER_FAILED).with_detail("");
        assert_eq!(failure.detail, None);
        assert_eq!(failure.to_string(), "render failed");
    }
}
