use crate::nodes::NodeList;
use itertools::iproduct;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Parse a comma separated directory list, empty entries are skipped
pub fn parse_dirs(input: &str) -> Vec<PathBuf> {
    input
        .split(',')
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// `<mountpoint>/<hostname>`
pub fn node_dir(mountpoint: &Path, host: &str) -> PathBuf {
    mountpoint.join(host)
}

/// `<mountpoint>/<hostname>/<kerneldir>`
pub fn kernel_dir(mountpoint: &Path, host: &str, kernel: &str) -> PathBuf {
    node_dir(mountpoint, host).join(kernel)
}

/// every (directory, node) pair in directory major order
pub fn node_dirs(dirs: &[PathBuf], nodes: &NodeList) -> Vec<PathBuf> {
    iproduct!(dirs.iter(), nodes.iter())
        .map(|(dir, node)| node_dir(dir, node))
        .collect()
}

/// create every missing mount point directory
pub fn create_dirs(dirs: &[PathBuf]) -> io::Result<()> {
    for dir in dirs {
        if !dir.exists() {
            info!(dir = ?dir, "Directory does not exist, creating it");
            fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// remove every `<dir>/<node>` tree, missing trees are skipped
pub fn clear_node_dirs(dirs: &[PathBuf], nodes: &NodeList) -> io::Result<()> {
    for path in node_dirs(dirs, nodes) {
        match fs::remove_dir_all(&path) {
            Ok(()) => info!(path = ?path, "Removed node directory"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "Node directory already absent")
            }
            Err(error) => return Err(error),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_follows_mount_host_kernel() {
        let mount = Path::new("/mnt/a");

        assert_eq!(node_dir(mount, "n0"), PathBuf::from("/mnt/a/n0"));
        assert_eq!(
            kernel_dir(mount, "n0", "linux"),
            PathBuf::from("/mnt/a/n0/linux")
        );
    }

    #[test]
    fn pairs_are_directory_major() {
        let dirs = parse_dirs("/mnt/a,/mnt/b");
        let nodes: NodeList = "n0,n1".parse().unwrap();

        assert_eq!(
            node_dirs(&dirs, &nodes),
            vec![
                PathBuf::from("/mnt/a/n0"),
                PathBuf::from("/mnt/a/n1"),
                PathBuf::from("/mnt/b/n0"),
                PathBuf::from("/mnt/b/n1"),
            ]
        );
    }

    #[test]
    fn clear_removes_only_node_trees() {
        let root = tempfile::tempdir().unwrap();
        let dirs = vec![root.path().to_path_buf()];
        let nodes: NodeList = "n0,n1".parse().unwrap();

        fs::create_dir_all(root.path().join("n0/linux")).unwrap();
        fs::create_dir_all(root.path().join("other")).unwrap();

        clear_node_dirs(&dirs, &nodes).unwrap();

        assert!(!root.path().join("n0").exists());
        assert!(root.path().join("other").exists());
    }
}
