use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path is not absolute: {0}")]
    Relative(String),
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("invalid entry name: {0:?}")]
    InvalidName(String),
}

/// Canonical form of a mount path: absolute, no trailing slash, no `.`/`..`.
pub fn normalize(path: &str) -> Result<String, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if !path.starts_with('/') {
        return Err(PathError::Relative(path.to_string()));
    }
    let mut out = String::with_capacity(path.len());
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => continue,
            Component::Normal(part) => {
                out.push('/');
                out.push_str(&part.to_string_lossy());
            }
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(path.to_string()));
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Splits a normalized path into parent path and leaf name.
pub fn split(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let (parent, name) = path.rsplit_once('/')?;
    Some((if parent.is_empty() { "/" } else { parent }, name))
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

pub fn validate_name(name: &str) -> Result<(), PathError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(PathError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// True when `path` equals `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// On-disk location of one cached range: `<root>/<node>/<offset>`.
pub fn object_path(objects_root: &Path, node: u64, offset: u64) -> PathBuf {
    objects_root.join(node.to_string()).join(format!("{offset:020}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize("/Docs//A.txt/").unwrap(), "/Docs/A.txt");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("/./a").unwrap(), "/a");
        assert!(matches!(
            normalize("/a/../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(matches!(normalize("rel"), Err(PathError::Relative(_))));
    }

    #[test]
    fn splits_and_joins() {
        assert_eq!(split("/a/b.txt"), Some(("/a", "b.txt")));
        assert_eq!(split("/a"), Some(("/", "a")));
        assert_eq!(split("/"), None);
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn ancestry_respects_component_boundaries() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(validate_name("ok.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn maps_objects_under_node_dir() {
        let root = PathBuf::from("/cache/objects");
        assert_eq!(
            object_path(&root, 7, 4096),
            PathBuf::from("/cache/objects/7/00000000000000004096")
        );
    }
}
