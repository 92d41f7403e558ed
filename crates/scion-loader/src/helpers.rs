//! Name and path helpers.
//!
//! Plugin names are dotted paths (`pkg.sub.leaf`). Under a search root a name
//! maps to `pkg/sub/leaf.rs`, or `pkg/sub/leaf/mod.rs` when it is a package.
//! Files outside every root are still addressable: their name is the
//! reserved [`ABSOLUTE_PATH_PREFIX`] followed by the sanitised path.

use std::path::{Component, Path, PathBuf};

/// Name prefix given to files that are not under any search root.
pub const ABSOLUTE_PATH_PREFIX: &str = "__scion_path__";

/// File name that marks a package directory.
pub const PACKAGE_FILE: &str = "mod.rs";

/// Extension of plugin source files.
pub const SOURCE_EXTENSION: &str = "rs";

/// Last dotted component of `name`.
pub fn short_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Everything before the last dot, if there is one.
pub fn parent_name(name: &str) -> Option<&str> {
    name.rfind('.').map(|dot| &name[..dot])
}

/// `true` when `name` is strictly inside `package`.
pub fn is_sub_module_of(name: &str, package: &str) -> bool {
    name.len() > package.len() + 1
        && name.starts_with(package)
        && name.as_bytes()[package.len()] == b'.'
}

/// `true` for non-empty dotted names whose segments are identifiers.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty()
                && segment.chars().all(|c| c.is_alphanumeric() || c == '_')
                && !segment.starts_with(|c: char| c.is_ascii_digit())
        })
}

/// Splits a `pkg.*` selector, returning `pkg`.
pub fn wildcard_prefix(selector: &str) -> Option<&str> {
    selector
        .strip_suffix(".*")
        .filter(|prefix| !prefix.is_empty())
}

/// Relative path for `name`.
pub fn name_to_relative_path(name: &str, is_package: bool) -> PathBuf {
    let mut path: PathBuf = name.split('.').collect();
    if is_package {
        path.push(PACKAGE_FILE);
    } else {
        path.set_extension(SOURCE_EXTENSION);
    }
    path
}

/// `true` when `path` names a package file.
pub fn is_package_path(path: &Path) -> bool {
    path.file_name().is_some_and(|f| f == PACKAGE_FILE)
}

/// Maps a source file back to a plugin name.
///
/// The first root containing `path` wins. Paths outside every root get the
/// [`ABSOLUTE_PATH_PREFIX`].
pub fn path_to_name(roots: &[PathBuf], path: &Path) -> String {
    for root in roots {
        if let Ok(relative) = path.strip_prefix(root) {
            let segments = dotted_segments(relative);
            if !segments.is_empty() {
                return segments.join(".");
            }
        }
    }

    let mut segments = vec![ABSOLUTE_PATH_PREFIX.to_string()];
    segments.extend(dotted_segments(path));
    segments.join(".")
}

fn dotted_segments(path: &Path) -> Vec<String> {
    let package = is_package_path(path);
    let mut segments: Vec<String> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(sanitize(&part.to_string_lossy())),
            _ => None,
        })
        .collect();

    if package {
        segments.pop();
    } else if let Some(last) = segments.last_mut() {
        let suffix = format!("_{SOURCE_EXTENSION}");
        if let Some(stem) = last.strip_suffix(&suffix) {
            *last = stem.to_string();
        }
    }
    segments
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_parts() {
        assert_eq!(short_name("a.b.c"), "c");
        assert_eq!(short_name("a"), "a");
        assert_eq!(parent_name("a.b.c"), Some("a.b"));
        assert_eq!(parent_name("a"), None);
    }

    #[test]
    fn test_sub_module() {
        assert!(is_sub_module_of("pkg.a", "pkg"));
        assert!(is_sub_module_of("pkg.a.b", "pkg"));
        assert!(!is_sub_module_of("pkg", "pkg"));
        assert!(!is_sub_module_of("pkgx.a", "pkg"));
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("pkg.sub_1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a..b"));
        assert!(!is_valid_name("a.1b"));
        assert!(!is_valid_name("a-b"));
    }

    #[test]
    fn test_wildcard() {
        assert_eq!(wildcard_prefix("pkg.*"), Some("pkg"));
        assert_eq!(wildcard_prefix("pkg"), None);
        assert_eq!(wildcard_prefix(".*"), None);
    }

    #[test]
    fn test_round_trip_under_root() {
        let root = PathBuf::from("/srv/plugins");
        let roots = vec![root.clone()];

        let file = root.join(name_to_relative_path("pkg.leaf", false));
        assert_eq!(file, PathBuf::from("/srv/plugins/pkg/leaf.rs"));
        assert_eq!(path_to_name(&roots, &file), "pkg.leaf");

        let package = root.join(name_to_relative_path("pkg", true));
        assert_eq!(package, PathBuf::from("/srv/plugins/pkg/mod.rs"));
        assert_eq!(path_to_name(&roots, &package), "pkg");
    }

    #[test]
    fn test_outside_roots_gets_prefix() {
        let roots = vec![PathBuf::from("/srv/plugins")];
        let name = path_to_name(&roots, Path::new("/opt/extra-stuff/tool.rs"));
        assert_eq!(name, "__scion_path__.opt.extra_stuff.tool");
    }
}
