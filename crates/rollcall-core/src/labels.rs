//! `labels.txt` parsing.
//!
//! One class per line, either `"<index> <label>"` or `"<label>"`. The line
//! order defines the classifier output index.

use std::path::Path;

/// Parse label-file contents. Blank lines are skipped.
pub fn parse_labels(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(strip_index)
        .collect()
}

/// Read and parse a label file.
pub fn read_labels(path: &Path) -> std::io::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_labels(&contents))
}

fn strip_index(line: &str) -> String {
    match line.split_once(char::is_whitespace) {
        Some((head, rest)) if head.parse::<i64>().is_ok() && !rest.trim().is_empty() => {
            rest.trim().to_string()
        }
        _ => line.to_string(),
    }
}
