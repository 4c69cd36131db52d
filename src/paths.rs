//! Filesystem path helpers
//!
//! Import names and companion files are matched case-insensitively so
//! effects written on case-insensitive filesystems keep loading everywhere.

use std::fs;
use std::path::{Path, PathBuf};

/// Resolve `name` (possibly containing `/`-separated components) under
/// `dir`, matching each component case-insensitively. Returns the on-disk
/// path when every component resolves.
pub fn resolve_case_insensitive(dir: &Path, name: &str) -> Option<PathBuf> {
    let mut current = dir.to_path_buf();
    for component in name.split(['/', '\\']) {
        if component.is_empty() {
            continue;
        }
        let exact = current.join(component);
        if exact.exists() {
            current = exact;
            continue;
        }
        let entries = fs::read_dir(&current).ok()?;
        let mut matched = None;
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().eq_ignore_ascii_case(component) {
                matched = Some(entry.path());
                break;
            }
        }
        current = matched?;
    }
    if current.exists() {
        Some(current)
    } else {
        None
    }
}

/// Search `root` and its subdirectories, depth first, for `name`.
pub fn find_in_tree(root: &Path, name: &str) -> Option<PathBuf> {
    if let Some(found) = resolve_case_insensitive(root, name) {
        if found.is_file() {
            return Some(found);
        }
    }
    let entries = fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_in_tree(&path, name) {
                return Some(found);
            }
        }
    }
    None
}

/// True when the path's extension equals `ext`, ignoring case.
pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// List plain files in a directory, in name order.
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    names.sort();
    names
}
