#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_STORE_DIRNAME: &str = ".treekeeper";
pub(crate) const DEFAULT_CONFIG_FILENAME: &str = "treekeeper.yaml";

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let git = current.join(".git");
        if git.exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

fn base_dir(start: &Path) -> PathBuf {
    find_repo_root(start).unwrap_or_else(|| start.to_path_buf())
}

/// Repo root when launched inside one, else the start directory, so every
/// subdirectory shares one store.
pub(crate) fn default_storage_dir_from_start(start: &Path) -> PathBuf {
    base_dir(start).join(DEFAULT_STORE_DIRNAME)
}

pub(crate) fn default_config_from_start(start: &Path) -> PathBuf {
    base_dir(start).join(DEFAULT_CONFIG_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_prefer_repo_root_over_subdir() {
        let root = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(root.path().join(".git")).expect("create fake .git");
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("create nested dir");

        assert_eq!(
            default_storage_dir_from_start(&nested),
            root.path().join(DEFAULT_STORE_DIRNAME)
        );
        assert_eq!(
            default_config_from_start(&nested),
            root.path().join(DEFAULT_CONFIG_FILENAME)
        );
    }
}
