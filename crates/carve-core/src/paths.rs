//! Lexical path helpers for repository-relative paths.
//!
//! Everything here works on path components only; nothing touches the
//! filesystem, so results do not depend on symlinks or on what exists on disk.

use std::path::{Component, Path, PathBuf};

/// Normalize a repository-relative path, resolving `.` and `..` lexically.
///
/// Returns `None` if the path is absolute or climbs above the repository root.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out: Vec<&std::ffi::OsStr> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop()?;
            }
            Component::Normal(s) => out.push(s),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out.iter().collect())
}

/// Relative path from directory `from` to directory `to`, both normalized and
/// relative to the same root. Equal directories yield `.`.
pub fn relative(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component<'_>> = from.components().collect();
    let to: Vec<Component<'_>> = to.components().collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for comp in &to[common..] {
        out.push(comp);
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

/// Render a path the way Cargo manifests spell them: `/`-separated, `.` for empty.
pub fn to_manifest_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// True if `path` is `base` or lies underneath it (component-wise).
pub fn is_within(path: &Path, base: &Path) -> bool {
    path.starts_with(base)
}

/// True if `path` is a strict ancestor of `other`.
pub fn is_strict_ancestor(path: &Path, other: &Path) -> bool {
    other != path && other.starts_with(path)
}
