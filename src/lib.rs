//! texrender: compiles LaTeX documents to HTML fragments (LaTeXML) or PDF
//! (pdflatex) behind an authenticated HTTP surface.

pub mod application;
pub mod config;
pub mod infra;
