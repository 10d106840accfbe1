//! Lexical path handling for the accessibility scope.
//!
//! Nothing here touches the filesystem: symlinks are not followed, so the
//! check matches what the student typed after `.` and `..` are folded.

use std::path::{Component, Path, PathBuf};

/// Fold `.` and `..` components without consulting the filesystem.
/// `..` at the root stays at the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Absolute normalized form of `arg` relative to `current_dir`
pub fn resolve(current_dir: &Path, arg: &str) -> PathBuf {
    let candidate = Path::new(arg);
    if candidate.is_absolute() {
        normalize(candidate)
    } else {
        normalize(&current_dir.join(candidate))
    }
}

/// True when `target` lies under at least one resource (component-wise)
pub fn within_any(target: &Path, resources: &[String], current_dir: &Path) -> bool {
    resources
        .iter()
        .any(|resource| target.starts_with(resolve(current_dir, resource)))
}
