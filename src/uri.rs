//! URI helpers: home/root prefix checks, meta-resource detection, and glob
//! matching with shell (fnmatch) semantics.

use globset::{Glob, GlobMatcher};

/// A URI's last path segment is a meta-resource name iff it both starts and
/// ends with `~`, e.g. `/root/home/~keys~`.
pub fn is_meta_resource(uri: &str) -> bool {
    last_segment(uri)
        .map(|seg| seg.len() >= 2 && seg.starts_with('~') && seg.ends_with('~'))
        .unwrap_or(false)
}

fn last_segment(uri: &str) -> Option<&str> {
    uri.rsplit('/').next()
}

/// Split a meta-resource URI into `(prefix, segment)`, where `prefix` is the
/// URI with the trailing `~name~` segment (and its separating `/`) removed.
///
/// This is the corrected form of the original's `rsplit`-based trim (spec
/// REDESIGN FLAG #5): handlers receive the prefix string alone, never a
/// tuple.
pub fn split_meta_resource(uri: &str) -> Option<(&str, &str)> {
    let seg = last_segment(uri)?;
    if !(seg.len() >= 2 && seg.starts_with('~') && seg.ends_with('~')) {
        return None;
    }
    let prefix_len = uri.len() - seg.len();
    let prefix = &uri[..prefix_len];
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    Some((prefix, seg))
}

/// Compile a shell-glob pattern (`*`, `?`) with fnmatch-like semantics: `*`
/// matches across `/` boundaries, matching Python's `fnmatch` module (which
/// has no concept of path separators).
pub fn compile_glob(pattern: &str) -> Result<GlobMatcher, globset::Error> {
    Ok(Glob::new(pattern)?.compile_matcher())
}

/// Bidirectional fnmatch used by observer dispatch (spec §4.3): a callback
/// registered under `pattern` fires on `uri` if either matches the other as
/// a glob. This lets a literal subscription catch a wildcard publish and
/// vice versa.
pub fn fnmatch_either(uri: &str, pattern: &str) -> bool {
    if uri == pattern {
        return true;
    }
    let uri_matches_pattern = compile_glob(pattern).map(|g| g.is_match(uri)).unwrap_or(false);
    let pattern_matches_uri = compile_glob(uri).map(|g| g.is_match(pattern)).unwrap_or(false);
    uri_matches_pattern || pattern_matches_uri
}
