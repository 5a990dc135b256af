use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
}

/// Joins a relative entry onto a remote directory, POSIX-style.
pub fn remote_join(remote_dir: &str, rel: &str) -> String {
    let dir = remote_dir.trim_end_matches('/');
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}/{rel}")
    }
}

/// Relative path of `path` under `root`, if it lies inside it. The match is
/// on component boundaries, so "/a/bc" is not inside "/a/b".
pub fn remote_relative<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    let root = root.trim_end_matches('/');
    let rest = path.strip_prefix(root)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    Some(rest.trim_start_matches('/'))
}

/// Maps a remote path ("/apps/bypy/Docs/A.txt") under a local root,
/// refusing traversal components.
pub fn local_path_for(local_root: &Path, rel: &str) -> Result<PathBuf, PathError> {
    if rel.is_empty() {
        return Err(PathError::Empty);
    }
    let mut out = local_root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}
