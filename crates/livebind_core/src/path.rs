//! Slash-separated remote paths.

/// Iterates over the non-empty segments of a path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Normalizes a path by dropping leading, trailing and repeated slashes.
pub fn normalize(path: &str) -> String {
    segments(path).collect::<Vec<_>>().join("/")
}

/// Returns the terminal segment of a path, the node's own key.
///
/// The root path has the empty key.
pub fn last_segment(path: &str) -> &str {
    segments(path).last().unwrap_or("")
}

/// Joins a child key onto a parent path.
pub fn join(parent: &str, child: &str) -> String {
    let parent = normalize(parent);
    let child = normalize(child);
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child,
        (false, true) => parent,
        (false, false) => format!("{parent}/{child}"),
    }
}

/// Returns true if `path` equals `prefix` or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    let mut path = segments(path);
    segments(prefix).all(|segment| path.next() == Some(segment))
}
