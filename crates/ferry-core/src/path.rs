//! Slash-separated path handling for filesystem capability paths.
//!
//! Capability paths are absolute, `/`-separated, and normalized before they
//! reach the engine; local paths use the same shape and are mapped to the
//! platform form by the local filesystem implementation.

/// Normalize a path: force a leading `/`, collapse repeated separators,
/// resolve `.` and `..` components, and strip any trailing `/` (except for
/// the root itself).
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Join a directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{}", name.trim_start_matches('/'))
    } else {
        format!("{}/{}", dir, name.trim_start_matches('/'))
    }
}

/// Parent directory of a path; `/` is its own parent.
pub fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Final component of a path; empty for the root.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Number of components below the root. Used to order deletes deepest-first.
pub fn depth(path: &str) -> usize {
    path.trim_matches('/')
        .split('/')
        .filter(|c| !c.is_empty())
        .count()
}

/// Returns true if `path` is `dir` itself or lies underneath it.
pub fn is_within(dir: &str, path: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    let path = path.trim_end_matches('/');
    path == dir || path.starts_with(&format!("{dir}/"))
}

/// Compute the `n`-th numbered variant of a file name: `report.txt` becomes
/// `report (1).txt`, `report (2).txt`, ... Directories and extensionless
/// names get the suffix at the end: `logs` becomes `logs (1)`.
pub fn numbered_variant(name: &str, n: u32) -> String {
    match name.rfind('.') {
        // A leading dot is a hidden file, not an extension.
        Some(idx) if idx > 0 => {
            let (stem, ext) = name.split_at(idx);
            format!("{stem} ({n}){ext}")
        }
        _ => format!("{name} ({n})"),
    }
}
