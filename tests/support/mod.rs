#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{Router, routing::get};
use tempfile::TempDir;
use texrender::application::compile::{
    AssetResolverConfig, BackendProfiles, CompilationPipeline, CompilerOutcome, ExitKind,
    Invocation, InvokeError, PipelineConfig, ProcessRunner,
};

pub const API_KEY: &str = "test123";
pub const HELLO_DOC: &str = "\\documentclass{article}\n\\begin{document}\nHi\n\\end{document}\n";
pub const BROKEN_DOC: &str =
    "\\documentclass{article}\n\\begin{document}\n\\begin{itemize}\nHi\n\\end{document}\n";

/// Stand-in compiler: writes a canned artifact, or a failing log when the
/// source contains an unclosed `itemize`.
#[derive(Default)]
pub struct FakeCompiler {
    pub seen_files: Mutex<Vec<Vec<String>>>,
    pub skip_output: bool,
}

impl FakeCompiler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without_output() -> Arc<Self> {
        Arc::new(Self {
            skip_output: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.seen_files.lock().expect("lock").len()
    }

    pub fn last_listing(&self) -> Vec<String> {
        self.seen_files
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

fn arg_after(invocation: &Invocation, flag: &str) -> Option<PathBuf> {
    invocation
        .args
        .iter()
        .position(|arg| arg == flag)
        .and_then(|index| invocation.args.get(index + 1))
        .map(PathBuf::from)
}

#[async_trait]
impl ProcessRunner for FakeCompiler {
    async fn run(&self, invocation: &Invocation) -> Result<CompilerOutcome, InvokeError> {
        let mut listing: Vec<String> = std::fs::read_dir(&invocation.working_dir)
            .expect("workspace exists")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        listing.sort();
        self.seen_files.lock().expect("lock").push(listing);

        let (output, is_pdf) = match arg_after(invocation, "--dest") {
            Some(dest) => (dest, false),
            None => {
                let job = arg_after(invocation, "-jobname").expect("job name");
                let name = format!("{}.pdf", job.display());
                (invocation.working_dir.join(name), true)
            }
        };
        let log = output.with_extension("log");
        let source = invocation
            .args
            .iter()
            .map(PathBuf::from)
            .find(|arg| arg.extension().is_some_and(|ext| ext == "tex"))
            .expect("source argument");
        let text = std::fs::read_to_string(&source).expect("source staged");

        let outcome = |exit| CompilerOutcome {
            exit,
            stderr: String::new(),
            diagnostics: None,
        };

        if text.contains("\\begin{itemize}") && !text.contains("\\end{itemize}") {
            std::fs::write(
                &log,
                "This is pdfTeX\n! LaTeX Error: \\begin{itemize} on input line 3 ended by \\end{document}.\nl.5 \\end{document}\n",
            )
            .expect("write log");
            return Ok(outcome(ExitKind::Failed { code: Some(1) }));
        }

        std::fs::write(&log, "compiled").expect("write log");
        if !self.skip_output {
            let body: &[u8] = if is_pdf {
                b"%PDF-1.5\n%fake\n"
            } else {
                b"<div class=\"ltx_page_main\"><p class=\"ltx_p\">Hi</p></div>"
            };
            std::fs::write(&output, body).expect("write output");
        }
        Ok(outcome(ExitKind::Success))
    }
}

pub fn pipeline(scratch: &Path, runner: Arc<dyn ProcessRunner>) -> CompilationPipeline {
    let config = PipelineConfig {
        scratch_root: scratch.to_path_buf(),
        max_concurrent: 2,
        deadline: Duration::from_secs(30),
        profiles: BackendProfiles::default(),
        assets: AssetResolverConfig::default(),
    };
    CompilationPipeline::new(config, runner).expect("pipeline should build")
}

pub fn scratch_entries(scratch: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(scratch)
        .expect("scratch exists")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect()
}

pub fn scratch_dir() -> (TempDir, PathBuf) {
    let root = TempDir::new().expect("temp dir");
    let scratch = root.path().join("scratch");
    (root, scratch)
}

/// Serve `/figure.png` with a small body and `/missing.png` as 404.
pub async fn spawn_asset_server() -> String {
    let app = Router::new()
        .route("/figure.png", get(|| async { &b"\x89PNG\r\n\x1a\nfake"[..] }))
        .route(
            "/missing.png",
            get(|| async { axum::http::StatusCode::NOT_FOUND }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind asset server");
    let addr = listener.local_addr().expect("asset server addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}
