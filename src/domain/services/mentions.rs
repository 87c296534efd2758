#[cfg(test)]
#[path = "mentions_test.rs"]
mod tests;

use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Result;

use crate::domain::models::FileRef;

/// An `@path` token, optionally narrowed to `#L10` or `#L10-20`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mention {
    pub path: String,
    pub lines: Option<(u32, u32)>,
}

fn parse_lines(range: &str) -> Option<(u32, u32)> {
    let range = range.strip_prefix('L')?;
    match range.split_once('-') {
        Some((start, end)) => {
            let end = end.strip_prefix('L').unwrap_or(end);
            return Some((start.parse().ok()?, end.parse().ok()?));
        }
        None => {
            let line = range.parse().ok()?;
            return Some((line, line));
        }
    }
}

/// Finds `@` tokens that start a word. Email-like `a@b` is left alone.
pub fn parse(text: &str) -> Vec<Mention> {
    return text
        .split_whitespace()
        .filter_map(|word| return word.strip_prefix('@'))
        .filter(|e| return !e.is_empty())
        .map(|token| {
            let token = token.trim_end_matches([',', '.', ';', ':', ')', '?', '!']);
            match token.split_once('#') {
                Some((path, range)) => {
                    return Mention {
                        path: path.to_string(),
                        lines: parse_lines(range),
                    };
                }
                None => {
                    return Mention {
                        path: token.to_string(),
                        lines: None,
                    };
                }
            }
        })
        .filter(|e| return !e.path.is_empty())
        .collect();
}

fn absolute(path: &str, directory: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        return path.to_path_buf();
    }

    return Path::new(directory).join(path);
}

/// Builds the file reference sent with a prompt. The server reads the file
/// itself, so only the location travels.
pub fn file_ref(path: &Path, lines: Option<(u32, u32)>) -> FileRef {
    let mut url = format!("file://{}", path.display());
    if let Some((start, end)) = lines {
        url = format!("{url}?start={start}&end={end}");
    }

    return FileRef {
        url,
        filename: path
            .file_name()
            .map(|e| return e.to_string_lossy().to_string()),
        mime: Some(mime_guess::from_path(path).first_or_text_plain().to_string()),
    };
}

/// Resolves an `/attach` argument, failing when there is no such file.
pub async fn attach(path: &str, directory: &str) -> Result<FileRef> {
    let full = absolute(path, directory);
    let is_file = tokio::fs::metadata(&full)
        .await
        .map(|e| return e.is_file())
        .unwrap_or(false);
    if !is_file {
        bail!("File not found: {}", full.display());
    }

    return Ok(file_ref(&full, None));
}

/// File parts for every mention in the text that names an existing file.
/// Mentions of missing files stay plain text.
pub async fn resolve(text: &str, directory: &str) -> Vec<FileRef> {
    let mut files = vec![];
    for mention in parse(text) {
        let full = absolute(&mention.path, directory);
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => files.push(file_ref(&full, mention.lines)),
            _ => {
                tracing::debug!(path = %full.display(), "Ignoring mention of a missing file");
            }
        }
    }

    return files;
}
