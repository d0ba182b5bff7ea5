use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

fn image_ref_regex() -> &'static Regex {
    static IMAGE_REF_RE: OnceLock<Regex> = OnceLock::new();
    IMAGE_REF_RE.get_or_init(|| {
        Regex::new(r#"!\[[^\]]*\]\(([^)"\s]+)(?:\s+"[^"]*")?\)"#)
            .expect("markdown image pattern compiles")
    })
}

/// Targets of every `![alt](target)` / `![alt](target "title")` in document order.
pub fn image_refs(markdown: &str) -> Vec<String> {
    image_ref_regex()
        .captures_iter(markdown)
        .filter_map(|captures| captures.get(1))
        .map(|target| target.as_str().to_string())
        .collect()
}

pub fn is_remote_ref(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

/// Local image references of a Markdown file, resolved against its directory.
///
/// Unreadable files and documents without local images yield an empty list.
pub fn extract_local_images(markdown_path: &Path) -> Vec<PathBuf> {
    let Ok(raw) = std::fs::read_to_string(markdown_path) else {
        return Vec::new();
    };
    let base_dir = markdown_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base_dir = std::path::absolute(&base_dir).unwrap_or(base_dir);

    image_refs(&raw)
        .into_iter()
        .filter(|target| !is_remote_ref(target))
        .map(|target| {
            let target = Path::new(&target);
            if target.is_absolute() {
                normalize_lexically(target)
            } else {
                normalize_lexically(&base_dir.join(target))
            }
        })
        .collect()
}

/// Drops `.` components and folds `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
