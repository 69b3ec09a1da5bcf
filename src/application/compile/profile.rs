//! Backend profiles: the external program, its argument template and the
//! expected output for each output kind. Profiles are plain data so both
//! backends share one code path through the pipeline.

use std::{ffi::OsString, path::PathBuf, time::Duration};

use bytes::Bytes;

use super::{
    invoker::Invocation,
    types::{OutputKind, labels},
    workspace::Workspace,
};

pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// web2c option raising `max_print_line` past any realistic log line.
const PDFLATEX_UNWRAPPED_LOG: &str = "-cnf-line=max_print_line=100000";

/// Stylesheet prepended to every HTML fragment.
pub const LATEXML_STYLESHEET: &str = include_str!("../../../static/css/latexml.css");

/// One argument slot; placeholders are filled from the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgPart {
    Literal(String),
    SourcePath,
    OutputPath,
    WorkspaceDir,
    JobName,
}

impl ArgPart {
    fn literal(value: impl Into<String>) -> Self {
        ArgPart::Literal(value.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Wrap the fragment as `<style>\n{css}\n</style>\n{fragment}`.
    InlineStylesheet,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub program: PathBuf,
    pub args: Vec<ArgPart>,
    pub output_extension: &'static str,
    pub content_type: &'static str,
    pub failure_label: &'static str,
    pub timeout: Duration,
    pub finish: Finish,
}

impl BackendProfile {
    /// LaTeXML producing an HTML5 fragment with Presentation MathML.
    pub fn latexml(program: PathBuf, timeout: Duration) -> Self {
        Self {
            program,
            args: vec![
                ArgPart::SourcePath,
                ArgPart::literal("--dest"),
                ArgPart::OutputPath,
                ArgPart::literal("--pmml"),
                ArgPart::literal("--post"),
                ArgPart::literal("--format=html5"),
                ArgPart::literal("--whatsout=fragment"),
                ArgPart::literal(format!("--timeout={}", timeout.as_secs().max(1))),
            ],
            output_extension: "html",
            content_type: HTML_CONTENT_TYPE,
            failure_label: labels::RENDER_FAILED,
            timeout,
            finish: Finish::InlineStylesheet,
        }
    }

    /// pdflatex in batch mode with the workspace identifier as job name.
    /// Log lines are left unwrapped so scratch paths stay whole for redaction.
    pub fn pdflatex(program: PathBuf, timeout: Duration) -> Self {
        Self {
            program,
            args: vec![
                ArgPart::literal(PDFLATEX_UNWRAPPED_LOG),
                ArgPart::literal("-interaction=nonstopmode"),
                ArgPart::literal("-output-directory"),
                ArgPart::WorkspaceDir,
                ArgPart::literal("-jobname"),
                ArgPart::JobName,
                ArgPart::SourcePath,
            ],
            output_extension: "pdf",
            content_type: PDF_CONTENT_TYPE,
            failure_label: labels::PDF_RENDER_FAILED,
            timeout,
            finish: Finish::Raw,
        }
    }

    pub fn output_path(&self, workspace: &Workspace) -> PathBuf {
        workspace.derived_path(self.output_extension)
    }

    /// Expand the argument template against a workspace.
    pub fn invocation(&self, workspace: &Workspace) -> Invocation {
        let args = self
            .args
            .iter()
            .map(|part| -> OsString {
                match part {
                    ArgPart::Literal(value) => value.into(),
                    ArgPart::SourcePath => workspace.source_path().into(),
                    ArgPart::OutputPath => self.output_path(workspace).into(),
                    ArgPart::WorkspaceDir => workspace.dir().into(),
                    ArgPart::JobName => workspace.id().into(),
                }
            })
            .collect();

        Invocation {
            program: self.program.clone(),
            args,
            working_dir: workspace.dir().to_path_buf(),
            timeout: self.timeout,
        }
    }

    pub fn finish(&self, raw: Vec<u8>) -> Bytes {
        match self.finish {
            Finish::Raw => Bytes::from(raw),
            Finish::InlineStylesheet => {
                let mut styled = Vec::with_capacity(LATEXML_STYLESHEET.len() + raw.len() + 20);
                styled.extend_from_slice(b"<style>\n");
                styled.extend_from_slice(LATEXML_STYLESHEET.as_bytes());
                styled.extend_from_slice(b"\n</style>\n");
                styled.extend_from_slice(&raw);
                Bytes::from(styled)
            }
        }
    }
}

/// The pair of profiles the service knows about.
#[derive(Debug, Clone)]
pub struct BackendProfiles {
    html: BackendProfile,
    pdf: BackendProfile,
}

impl BackendProfiles {
    pub fn new(html: BackendProfile, pdf: BackendProfile) -> Self {
        Self { html, pdf }
    }

    pub fn get(&self, kind: OutputKind) -> &BackendProfile {
        match kind {
            OutputKind::HtmlFragment => &self.html,
            OutputKind::Pdf => &self.pdf,
        }
    }
}

impl Default for BackendProfiles {
    fn default() -> Self {
        let timeout = Duration::from_secs(crate::config::DEFAULT_COMPILE_TIMEOUT_SECS);
        Self::new(
            BackendProfile::latexml(
                PathBuf::from(crate::config::DEFAULT_LATEXML_PATH),
                timeout,
            ),
            BackendProfile::pdflatex(
                PathBuf::from(crate::config::DEFAULT_PDFLATEX_PATH),
                timeout,
            ),
        )
    }
}

impl From<&crate::config::CompileSettings> for BackendProfiles {
    fn from(settings: &crate::config::CompileSettings) -> Self {
        Self::new(
            BackendProfile::latexml(settings.latexml_path.clone(), settings.timeout),
            BackendProfile::pdflatex(settings.pdflatex_path.clone(), settings.timeout),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn latexml_arguments_follow_template() {
        let workspace = Workspace::acquire(Path::new("/scratch"));
        let profile = BackendProfile::latexml(PathBuf::from("latexmlc"), Duration::from_secs(20));

        let invocation = profile.invocation(&workspace);
        let expected: Vec<OsString> = vec![
            workspace.source_path().into(),
            "--dest".into(),
            workspace.derived_path("html").into(),
            "--pmml".into(),
            "--post".into(),
            "--format=html5".into(),
            "--whatsout=fragment".into(),
            "--timeout=20".into(),
        ];

        assert_eq!(invocation.program, PathBuf::from("latexmlc"));
        assert_eq!(invocation.args, expected);
        assert_eq!(invocation.working_dir, workspace.dir());
        assert_eq!(invocation.timeout, Duration::from_secs(20));
    }

    #[test]
    fn pdflatex_uses_workspace_id_as_job_name() {
        let workspace = Workspace::acquire(Path::new("/scratch"));
        let profile = BackendProfile::pdflatex(PathBuf::from("pdflatex"), Duration::from_secs(20));

        let invocation = profile.invocation(&workspace);
        let expected: Vec<OsString> = vec![
            "-cnf-line=max_print_line=100000".into(),
            "-interaction=nonstopmode".into(),
            "-output-directory".into(),
            workspace.dir().into(),
            "-jobname".into(),
            workspace.id().into(),
            workspace.source_path().into(),
        ];

        assert_eq!(invocation.args, expected);
        assert_eq!(
            profile.output_path(&workspace),
            workspace.dir().join(format!("{}.pdf", workspace.id()))
        );
    }

    #[test]
    fn html_finish_prepends_stylesheet() {
        let profile = BackendProfile::latexml(PathBuf::from("latexmlc"), Duration::from_secs(20));
        let body = profile.finish(b"<div class=\"ltx_page_main\">Hi</div>".to_vec());
        let text = std::str::from_utf8(&body).expect("utf-8");

        assert!(text.starts_with(&format!("<style>\n{LATEXML_STYLESHEET}\n</style>\n")));
        assert!(text.ends_with("<div class=\"ltx_page_main\">Hi</div>"));
    }

    #[test]
    fn pdf_finish_is_untouched() {
        let profile = BackendProfile::pdflatex(PathBuf::from("pdflatex"), Duration::from_secs(20));
        let body = profile.finish(b"%PDF-1.5".to_vec());
        assert_eq!(&body[..], b"%PDF-1.5");
    }
}
