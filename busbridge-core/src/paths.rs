//! Object-path arithmetic shared by discovery, signal filtering and the
//! agent registry.

/// Join a child node name onto a base path, without doubling the separator
/// when the base is the root.
pub fn child_path(base: &str, child: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{child}")
    } else {
        format!("{base}/{child}")
    }
}

/// Whether `path` equals `base` or lies underneath it. Segment boundaries are
/// respected: `/org/example/Ab` is not a descendant of `/org/example/A`.
pub fn is_descendant_or_equal(path: &str, base: &str) -> bool {
    if base == "/" {
        return path.starts_with('/');
    }
    path == base
        || path
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Derive the source-side object path exposed for one client's agent.
///
/// The client's bus name is appended as a path segment, with the characters
/// D-Bus forbids in paths (`.` and `:`) flattened to `_`, so two clients
/// registering the same logical path land on distinct objects.
pub fn unique_agent_path(logical_path: &str, sender: &str) -> String {
    let suffix: String = sender
        .chars()
        .map(|c| if c == '.' || c == ':' { '_' } else { c })
        .collect();
    child_path(logical_path, &suffix)
}
