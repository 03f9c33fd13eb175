//! Path component splitting. Paths are absolute, `/`-separated, with the
//! leading component naming a mounted volume.

/// Splits off the first component: `"a/b/c"` becomes `("a", "b/c")`.
/// Leading slashes of the remainder are kept for the caller to strip.
pub(crate) fn split_component(path: &str) -> (&str, &str) {
    match path.find('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => (path, ""),
    }
}

/// True when nothing but separators remains after a component.
pub(crate) fn rest_is_empty(rest: &str) -> bool {
    rest.bytes().all(|b| b == b'/')
}
