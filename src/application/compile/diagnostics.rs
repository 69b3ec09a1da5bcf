/// Lines starting with this marker are TeX errors.
pub const ERROR_MARKER: char = '!';

/// Reduce a compiler log to its error lines.
///
/// Keeps only lines beginning with [`ERROR_MARKER`], in their original
/// order. When no such line exists the log is returned unchanged, so a
/// non-empty input never yields an empty summary.
pub fn extract(log: &str) -> String {
    let errors: Vec<&str> = log
        .lines()
        .filter(|line| line.starts_with(ERROR_MARKER))
        .collect();

    if errors.is_empty() {
        return log.to_string();
    }

    errors.join("\n")
}
