// hymod/src/mount/node.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, hash_map::Entry};
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Component, Path, PathBuf};

use anyhow::Result;

use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFileType {
    RegularFile,
    Directory,
    Symlink,
    Whiteout,
}

impl NodeFileType {
    pub fn from_file_type(ft: fs::FileType) -> Option<Self> {
        if ft.is_symlink() {
            Some(NodeFileType::Symlink)
        } else if ft.is_dir() {
            Some(NodeFileType::Directory)
        } else if ft.is_file() {
            Some(NodeFileType::RegularFile)
        } else {
            None
        }
    }
}

/// One path in the merged magic-mount view. The tree is an owned map of
/// children, so teardown is plain drop and cycles cannot form.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub file_type: NodeFileType,
    pub children: HashMap<String, Node>,
    /// Backing path in a module when this node shadows or adds content.
    pub module_path: Option<PathBuf>,
    /// Directory fully replaces the original (`.replace` / opaque xattr).
    pub replace: bool,
    pub skip: bool,
}

impl Node {
    pub fn new_root(name: &str) -> Self {
        Node {
            name: name.to_string(),
            file_type: NodeFileType::Directory,
            children: HashMap::new(),
            module_path: None,
            replace: false,
            skip: false,
        }
    }

    fn new_leaf(name: &str, file_type: NodeFileType, module_path: PathBuf) -> Self {
        Node {
            name: name.to_string(),
            file_type,
            children: HashMap::new(),
            module_path: Some(module_path),
            replace: false,
            skip: false,
        }
    }

    /// Merge one module partition directory into this node. Modules are
    /// collected in priority order; the first writer of a path wins and
    /// later modules only contribute entries nobody claimed yet.
    ///
    /// Returns whether anything was collected.
    pub fn collect_module_files(&mut self, dir: &Path) -> Result<bool> {
        self.collect_into(dir, dir)
    }

    fn collect_into(&mut self, dir: &Path, module_root: &Path) -> Result<bool> {
        let mut has_file = false;

        for entry in dir.read_dir()?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == crate::defs::REPLACE_DIR_FILE_NAME {
                continue;
            }
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("magic: stat {} failed: {e}", path.display());
                    continue;
                }
            };
            let ft = metadata.file_type();

            if ft.is_dir() {
                let child = match self.children.entry(name.clone()) {
                    Entry::Vacant(v) => v.insert(Node::new_root(&name)),
                    Entry::Occupied(o) => {
                        let node = o.into_mut();
                        if node.file_type != NodeFileType::Directory {
                            // an earlier module claimed this path with a file
                            continue;
                        }
                        node
                    }
                };
                if !child.replace && utils::is_replace_marked(&path) {
                    child.replace = true;
                    child.module_path = Some(path.clone());
                }
                if child.module_path.is_none() {
                    child.module_path = Some(path.clone());
                }
                has_file |= child.collect_into(&path, module_root)?;
            } else {
                let node_type = if ft.is_char_device() && metadata.rdev() == 0 {
                    NodeFileType::Whiteout
                } else if ft.is_symlink() {
                    if !symlink_target_is_safe(&path, module_root) {
                        log::warn!(
                            "magic: symlink {} escapes its module, skipping",
                            path.display()
                        );
                        continue;
                    }
                    NodeFileType::Symlink
                } else if ft.is_file() {
                    NodeFileType::RegularFile
                } else {
                    log::debug!("magic: unsupported file type at {}", path.display());
                    continue;
                };

                match self.children.entry(name.clone()) {
                    Entry::Vacant(v) => {
                        v.insert(Node::new_leaf(&name, node_type, path));
                        has_file = true;
                    }
                    Entry::Occupied(_) => {
                        // first writer wins
                        log::debug!("magic: {} already claimed, ignoring", path.display());
                    }
                }
            }
        }

        Ok(has_file)
    }
}

/// Relative symlink targets must stay inside the partition tree they were
/// shipped in; absolute targets resolve in the final mount namespace and
/// pass through untouched.
fn symlink_target_is_safe(link: &Path, module_root: &Path) -> bool {
    let Ok(target) = fs::read_link(link) else {
        return false;
    };
    if target.is_absolute() {
        return true;
    }

    // depth of the link's directory below the partition root
    let available = link
        .parent()
        .and_then(|p| p.strip_prefix(module_root).ok())
        .map(|rel| rel.components().count() as i64)
        .unwrap_or(0);

    let mut depth: i64 = 0;
    for component in target.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < -available {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    true
}

/// Collect the merged tree for a set of module roots. The virtual `system`
/// node is built first; physical partitions are then re-attached to the
/// real root: built-ins whenever `/<name>` is a directory, unknown extras
/// only when `/<name>` exists, otherwise they stay below `/system`.
pub fn collect_module_trees(
    module_paths: &[PathBuf],
    extra_partitions: &[String],
) -> Result<Option<Node>> {
    const ROOT_PARTITIONS: [&str; 5] = ["vendor", "system_ext", "product", "odm", "oem"];

    let mut root = Node::new_root("");
    let mut system = Node::new_root("system");
    let mut has_file = false;

    for path in module_paths {
        let mod_system = path.join("system");
        if mod_system.is_dir() {
            has_file |= system.collect_module_files(&mod_system)?;
        }

        for partition in ROOT_PARTITIONS {
            let mod_part = path.join(partition);
            if mod_part.is_dir() {
                let node = system
                    .children
                    .entry(partition.to_string())
                    .or_insert_with(|| Node::new_root(partition));
                if node.file_type == NodeFileType::Symlink {
                    node.file_type = NodeFileType::Directory;
                    node.module_path = None;
                }
                has_file |= node.collect_module_files(&mod_part)?;
            }
        }

        for partition in extra_partitions {
            if ROOT_PARTITIONS.contains(&partition.as_str()) || partition == "system" {
                continue;
            }
            let mod_part = path.join(partition);
            if mod_part.is_dir() {
                let node = system
                    .children
                    .entry(partition.clone())
                    .or_insert_with(|| Node::new_root(partition));
                has_file |= node.collect_module_files(&mod_part)?;
            }
        }
    }

    if !has_file {
        return Ok(None);
    }

    let mut detach: Vec<String> = Vec::new();
    for name in system.children.keys() {
        let is_builtin = ROOT_PARTITIONS.contains(&name.as_str());
        let is_extra = extra_partitions.iter().any(|p| p == name);
        if !is_builtin && !is_extra {
            continue;
        }
        let path_of_root = Path::new("/").join(name);
        if path_of_root.is_dir() {
            detach.push(name.clone());
        }
    }
    for name in detach {
        if let Some(node) = system.children.remove(&name) {
            log::debug!("Attaching partition '{name}' to root");
            root.children.insert(name, node);
        }
    }

    root.children.insert("system".to_string(), system);
    Ok(Some(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn collects_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("system");
        fs::create_dir_all(part.join("app/Foo")).unwrap();
        fs::write(part.join("app/Foo/Foo.apk"), b"apk").unwrap();
        fs::write(part.join("build.prop"), b"x").unwrap();

        let mut node = Node::new_root("system");
        assert!(node.collect_module_files(&part).unwrap());

        let app = &node.children["app"];
        assert_eq!(app.file_type, NodeFileType::Directory);
        let foo = &app.children["Foo"];
        let apk = &foo.children["Foo.apk"];
        assert_eq!(apk.file_type, NodeFileType::RegularFile);
        assert!(apk.module_path.as_ref().unwrap().ends_with("app/Foo/Foo.apk"));
        assert_eq!(node.children["build.prop"].file_type, NodeFileType::RegularFile);
    }

    #[test]
    fn first_module_wins_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a/system");
        let b = dir.path().join("b/system");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("hosts"), b"from-a").unwrap();
        fs::write(b.join("hosts"), b"from-b").unwrap();
        fs::write(b.join("extra"), b"only-b").unwrap();

        let mut node = Node::new_root("system");
        node.collect_module_files(&a).unwrap();
        node.collect_module_files(&b).unwrap();

        let hosts = &node.children["hosts"];
        assert!(hosts.module_path.as_ref().unwrap().starts_with(dir.path().join("a")));
        assert!(node.children.contains_key("extra"));
    }

    #[test]
    fn replace_marker_sets_replace_flag() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("system");
        fs::create_dir_all(part.join("app/Bloat")).unwrap();
        fs::write(part.join("app/Bloat/.replace"), b"").unwrap();

        let mut node = Node::new_root("system");
        node.collect_module_files(&part).unwrap();
        let bloat = &node.children["app"].children["Bloat"];
        assert!(bloat.replace);
        // the marker itself is not part of the tree
        assert!(!bloat.children.contains_key(".replace"));
    }

    #[test]
    fn relative_symlinks_within_module_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("system/bin");
        fs::create_dir_all(&part).unwrap();
        fs::write(part.join("tool"), b"x").unwrap();
        symlink("tool", part.join("alias")).unwrap();
        symlink("/system/bin/sh", part.join("sh")).unwrap();

        let mut node = Node::new_root("system");
        node.collect_module_files(&dir.path().join("system")).unwrap();
        let bin = &node.children["bin"];
        assert_eq!(bin.children["alias"].file_type, NodeFileType::Symlink);
        assert_eq!(bin.children["sh"].file_type, NodeFileType::Symlink);
    }

    #[test]
    fn escaping_symlink_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("system/bin");
        fs::create_dir_all(&part).unwrap();
        symlink("../../../../etc/passwd", part.join("sneaky")).unwrap();
        symlink("../lib/ok.so", part.join("fine")).unwrap();

        let mut node = Node::new_root("system");
        node.collect_module_files(&dir.path().join("system")).unwrap();
        let bin = &node.children["bin"];
        assert!(!bin.children.contains_key("sneaky"));
        assert!(bin.children.contains_key("fine"));
    }

    #[test]
    fn tree_collection_merges_partitions_under_system() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("mod");
        fs::create_dir_all(module.join("system/etc")).unwrap();
        fs::write(module.join("system/etc/hosts"), b"h").unwrap();
        fs::create_dir_all(module.join("vendor/lib")).unwrap();
        fs::write(module.join("vendor/lib/x.so"), b"so").unwrap();

        let root = collect_module_trees(&[module], &[]).unwrap().unwrap();
        let system = &root.children["system"];
        assert!(system.children.contains_key("etc"));
        // /vendor exists as a directory on any Linux test host? Not
        // guaranteed; vendor stays under system when it does not.
        let vendor_on_root = Path::new("/vendor").is_dir();
        assert_eq!(root.children.contains_key("vendor"), vendor_on_root);
        assert_eq!(system.children.contains_key("vendor"), !vendor_on_root);
    }

    #[test]
    fn empty_modules_collect_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("mod");
        fs::create_dir_all(module.join("system/app")).unwrap();
        let root = collect_module_trees(&[module], &[]).unwrap();
        assert!(root.is_none());
    }
}
