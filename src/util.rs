//! Shared utility functions for the cube crate.

use std::fs;
use std::io::Write;
use std::path::Path;

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Write `contents` to `path` so that readers observe either the previous
/// file or the complete new one, never a partial write.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = stage_temp_file(path, contents)?;
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

/// Atomically create `path` with `contents`, failing with
/// `ErrorKind::AlreadyExists` if the file is already present.
///
/// The content is staged in a temp file and hard-linked into place, so the
/// final name only ever points at a fully written file.
pub fn atomic_create(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = stage_temp_file(path, contents)?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    linked
}

fn stage_temp_file(path: &Path, contents: &[u8]) -> std::io::Result<std::path::PathBuf> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "cube".to_string());
    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        file_name,
        uuid::Uuid::new_v4().simple()
    ));

    let mut file = fs::File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(tmp)
}

/// Normalize free text for deduplication: lowercase, collapse whitespace,
/// strip surrounding punctuation and list markers.
pub fn normalize_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_start_matches(['-', '*', '•', ' '])
        .trim_end_matches(['.', ';', ':', ',', '!', ' '])
        .to_lowercase()
}

/// Check that an identifier is safe to use as a path component and in a
/// git branch name.
pub fn validate_id(kind: &str, id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err(format!("{} id must not be empty", kind));
    }
    if id.starts_with('.') || id.starts_with('-') {
        return Err(format!(
            "{} id '{}' must not start with '.' or '-'",
            kind, id
        ));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(format!(
            "{} id '{}' contains invalid character '{}' (allowed: letters, digits, '_', '-', '.')",
            kind, id, bad
        ));
    }
    Ok(())
}

/// Truncate a string with ellipsis, respecting char boundaries.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
