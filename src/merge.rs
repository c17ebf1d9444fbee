//! Three-way recursive merge over ancestor/local/remote node trees. Never
//! mutates any tree directly: emits shell-style command lines for an
//! external control surface to execute, which keeps the merge logic
//! itself deterministic and inspectable. The presentation of an actual
//! diff for a conflicted file is out of scope here; a conflict only
//! emits the command to graft the remote side aside the local one plus a
//! comment noting where a three-way diff tool would need to look.

use crate::error::{Error, Result};
use crate::node::{Node, NodeHandle};
use crate::tree::Tree;
use std::collections::HashSet;

/// Answers whether a conflict at `path`, as of `remote_revision`, has
/// already been accepted by the user (backed externally by a
/// per-revision "keep local" file; a plain closure suffices here).
pub trait KeepLocalFn {
    fn keep_local(&self, remote_revision: &str, path: &str) -> bool;
}

impl<F: Fn(&str, &str) -> bool> KeepLocalFn for F {
    fn keep_local(&self, remote_revision: &str, path: &str) -> bool {
        self(remote_revision, path)
    }
}

/// A single emitted instruction. `to_line` renders it the way the
/// control surface expects: `echo <verb> …` for actions, `#` for
/// commented-out hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeCommand {
    /// Attach the remote subtree at `remote_path` (as of `remote_revision`)
    /// under `local_path`.
    Graft {
        remote_revision: String,
        remote_path: String,
        local_path: String,
    },
    Remove {
        path: String,
    },
    /// Neither side can be reconciled automatically: the remote side is
    /// grafted alongside the local one under `<path>.merge-conflict`.
    Conflict {
        path: String,
        remote_revision: String,
    },
}

impl MergeCommand {
    pub fn to_line(&self) -> String {
        match self {
            MergeCommand::Graft {
                remote_revision,
                remote_path,
                local_path,
            } => format!("echo graft {remote_revision}/{remote_path} {local_path}"),
            MergeCommand::Remove { path } => format!("echo rm -rf {path}"),
            MergeCommand::Conflict {
                path,
                remote_revision,
            } => format!(
                "echo graft {remote_revision}/{path} {path}.merge-conflict\n# conflict: {path} (three-way diff: local vs ancestor vs {remote_revision}/{path})"
            ),
        }
    }
}

/// Drives one three-way merge, collecting the command lines it emits.
pub struct Merge<'a> {
    ancestor_tree: &'a Tree,
    remote_tree: &'a Tree,
    remote_revision: String,
    keep_local: &'a dyn KeepLocalFn,
    commands: Vec<MergeCommand>,
}

impl<'a> Merge<'a> {
    pub fn new(
        ancestor_tree: &'a Tree,
        remote_tree: &'a Tree,
        remote_revision: impl Into<String>,
        keep_local: &'a dyn KeepLocalFn,
    ) -> Self {
        Self {
            ancestor_tree,
            remote_tree,
            remote_revision: remote_revision.into(),
            keep_local,
            commands: Vec::new(),
        }
    }

    /// Merges the subtree rooted at `local` (always present; a local tree
    /// never lacks its own root) against the matching `ancestor`/`remote`
    /// nodes, both of which may be absent (the path did not exist at that
    /// revision). `path` is the slash-joined path from the tree root,
    /// used only to label emitted commands.
    pub fn run(
        mut self,
        local: &NodeHandle,
        ancestor: Option<&NodeHandle>,
        remote: Option<&NodeHandle>,
        path: &str,
    ) -> Result<Vec<MergeCommand>> {
        self.merge_node(local, ancestor, remote, path)?;
        Ok(self.commands)
    }

    fn merge_node(
        &mut self,
        local: &NodeHandle,
        ancestor: Option<&NodeHandle>,
        remote: Option<&NodeHandle>,
        path: &str,
    ) -> Result<()> {
        // Rule 1: local and remote already agree.
        if self.same(Some(local), remote)? {
            return Ok(());
        }

        // Rule 2: remote never moved from the ancestor; local wins as-is.
        if self.same(ancestor, remote)? {
            return Ok(());
        }

        // Rule 3: can't safely replace or recurse into an open local node.
        if local.borrow().refs() > 0 && local.borrow().parent().is_some() {
            return Err(Error::InUse(path.to_string()));
        }

        // Rule 4: local unchanged from ancestor, remote diverged: take remote.
        if self.same(Some(local), ancestor)? {
            match remote {
                Some(_) => self.commands.push(MergeCommand::Graft {
                    remote_revision: self.remote_revision.clone(),
                    remote_path: path.to_string(),
                    local_path: path.to_string(),
                }),
                None => self.commands.push(MergeCommand::Remove {
                    path: path.to_string(),
                }),
            }
            return Ok(());
        }

        // Rule 5: all three differ.
        if self.keep_local.keep_local(&self.remote_revision, path) {
            return Ok(());
        }

        let both_dirs = local.borrow().is_dir()
            && ancestor.map(|n| n.borrow().is_dir()).unwrap_or(true)
            && remote.map(|n| n.borrow().is_dir()).unwrap_or(true);

        if !both_dirs {
            self.commands.push(MergeCommand::Conflict {
                path: path.to_string(),
                remote_revision: self.remote_revision.clone(),
            });
            return Ok(());
        }

        self.recurse_into_directory(local, ancestor, remote, path)
    }

    fn recurse_into_directory(
        &mut self,
        local: &NodeHandle,
        ancestor: Option<&NodeHandle>,
        remote: Option<&NodeHandle>,
        path: &str,
    ) -> Result<()> {
        self.ancestor_tree
            .grow(ancestor.unwrap_or(local))
            .unwrap_or(());
        self.remote_tree.grow(remote.unwrap_or(local)).unwrap_or(());

        let local_children = Node::children_map(local);
        let ancestor_children = ancestor.map(Node::children_map).unwrap_or_default();
        let remote_children = remote.map(Node::children_map).unwrap_or_default();

        let mut names: HashSet<&str> = HashSet::new();
        names.extend(local_children.keys().map(String::as_str));
        names.extend(ancestor_children.keys().map(String::as_str));
        names.extend(remote_children.keys().map(String::as_str));

        let mut sorted: Vec<&str> = names.into_iter().collect();
        sorted.sort_unstable();

        for name in sorted {
            let child_path = if path.is_empty() {
                name.to_string()
            } else {
                format!("{path}/{name}")
            };
            let local_child = local_children.get(name);
            let ancestor_child = ancestor_children.get(name);
            let remote_child = remote_children.get(name);

            match local_child {
                Some(lc) => self.merge_node(lc, ancestor_child, remote_child, &child_path)?,
                None => self.merge_missing_local(ancestor_child, remote_child, &child_path)?,
            }
        }
        Ok(())
    }

    /// Local has no entry of this name (deleted, or never materialized
    /// here). If remote didn't change it beyond the ancestor, the local
    /// deletion (or absence) stands. Otherwise remote introduced or
    /// changed something local lacks: pull it in.
    fn merge_missing_local(
        &mut self,
        ancestor: Option<&NodeHandle>,
        remote: Option<&NodeHandle>,
        path: &str,
    ) -> Result<()> {
        if self.same(ancestor, remote)? {
            return Ok(());
        }
        if let Some(_) = remote {
            self.commands.push(MergeCommand::Graft {
                remote_revision: self.remote_revision.clone(),
                remote_path: path.to_string(),
                local_path: path.to_string(),
            });
        }
        Ok(())
    }

    fn same(&self, a: Option<&NodeHandle>, b: Option<&NodeHandle>) -> Result<bool> {
        match (a, b) {
            (None, None) => Ok(true),
            (None, Some(_)) | (Some(_), None) => Ok(false),
            (Some(a), Some(b)) => nodes_equal(a, b),
        }
    }
}

/// Same content-addressed pointer, or (for two files) byte-identical
/// content even if neither side has sealed yet.
fn nodes_equal(a: &NodeHandle, b: &NodeHandle) -> Result<bool> {
    let pointer_a = a.borrow().pointer().cloned();
    let pointer_b = b.borrow().pointer().cloned();
    if pointer_a.is_some() && pointer_a == pointer_b {
        return Ok(true);
    }
    if a.borrow().is_dir() || b.borrow().is_dir() {
        return Ok(false);
    }
    Ok(read_all_bytes(a)? == read_all_bytes(b)?)
}

fn read_all_bytes(node: &NodeHandle) -> Result<Vec<u8>> {
    let size = node.borrow().info().size as usize;
    let mut buf = vec![0u8; size];
    let mut total = 0usize;
    while total < buf.len() {
        let n = node.borrow_mut().read(&mut buf[total..], total as u64)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    buf.truncate(total);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DMDIR;
    use crate::store::Store;
    use crate::testkv::fixture_backing;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn fixture_tree(dir: &std::path::Path, tag: &str) -> Tree {
        let backing = fixture_backing();
        let root = Node::new_root(backing.clone(), 6, 0o755, 1000, 1000);
        let pointers: Arc<dyn crate::kv::KvStore> = Arc::new(crate::kv::memory::MemoryStore::new());
        let store = Store::new(backing, pointers, dir.join(format!("head-{tag}")), 1000, 1000);
        Tree::builder()
            .store(store)
            .root(root)
            .block_size(6)
            .host("host")
            .instance(tag)
            .build()
            .unwrap()
    }

    fn never_keep(_rev: &str, _path: &str) -> bool {
        false
    }

    #[test]
    fn identical_local_and_remote_emits_nothing() {
        let dir = tempdir().unwrap();
        let local = fixture_tree(dir.path(), "local");
        let remote = fixture_tree(dir.path(), "remote");
        let ancestor = fixture_tree(dir.path(), "ancestor");

        let lf = local.add(local.root(), "f", 0o644).unwrap();
        lf.borrow_mut().write(b"same", 0).unwrap();
        let rf = remote.add(remote.root(), "f", 0o644).unwrap();
        rf.borrow_mut().write(b"same", 0).unwrap();

        let merge = Merge::new(&ancestor, &remote, "remote-instance", &never_keep);
        let commands = merge
            .run(&lf, None, Some(&rf), "f")
            .unwrap();
        assert!(commands.is_empty());
    }

    #[test]
    fn remote_unchanged_from_ancestor_keeps_local() {
        let dir = tempdir().unwrap();
        let local = fixture_tree(dir.path(), "local");
        let remote = fixture_tree(dir.path(), "remote");
        let ancestor = fixture_tree(dir.path(), "ancestor");

        let lf = local.add(local.root(), "f", 0o644).unwrap();
        lf.borrow_mut().write(b"local edit", 0).unwrap();
        let af = ancestor.add(ancestor.root(), "f", 0o644).unwrap();
        af.borrow_mut().write(b"original", 0).unwrap();
        let rf = remote.add(remote.root(), "f", 0o644).unwrap();
        rf.borrow_mut().write(b"original", 0).unwrap();

        let merge = Merge::new(&ancestor, &remote, "remote-instance", &never_keep);
        let commands = merge.run(&lf, Some(&af), Some(&rf), "f").unwrap();
        assert!(commands.is_empty());
    }

    #[test]
    fn local_unchanged_remote_diverged_takes_remote() {
        let dir = tempdir().unwrap();
        let local = fixture_tree(dir.path(), "local");
        let remote = fixture_tree(dir.path(), "remote");
        let ancestor = fixture_tree(dir.path(), "ancestor");

        let lf = local.add(local.root(), "f", 0o644).unwrap();
        lf.borrow_mut().write(b"original", 0).unwrap();
        let af = ancestor.add(ancestor.root(), "f", 0o644).unwrap();
        af.borrow_mut().write(b"original", 0).unwrap();
        let rf = remote.add(remote.root(), "f", 0o644).unwrap();
        rf.borrow_mut().write(b"remote edit", 0).unwrap();

        let merge = Merge::new(&ancestor, &remote, "remote-instance", &never_keep);
        let commands = merge.run(&lf, Some(&af), Some(&rf), "f").unwrap();
        assert_eq!(
            commands,
            vec![MergeCommand::Graft {
                remote_revision: "remote-instance".to_string(),
                remote_path: "f".to_string(),
                local_path: "f".to_string(),
            }]
        );
    }

    #[test]
    fn three_way_conflict_on_a_file_is_flagged() {
        let dir = tempdir().unwrap();
        let local = fixture_tree(dir.path(), "local");
        let remote = fixture_tree(dir.path(), "remote");
        let ancestor = fixture_tree(dir.path(), "ancestor");

        let lf = local.add(local.root(), "f", 0o644).unwrap();
        lf.borrow_mut().write(b"local edit", 0).unwrap();
        let af = ancestor.add(ancestor.root(), "f", 0o644).unwrap();
        af.borrow_mut().write(b"original", 0).unwrap();
        let rf = remote.add(remote.root(), "f", 0o644).unwrap();
        rf.borrow_mut().write(b"remote edit", 0).unwrap();

        let merge = Merge::new(&ancestor, &remote, "remote-instance", &never_keep);
        let commands = merge.run(&lf, Some(&af), Some(&rf), "f").unwrap();
        assert_eq!(
            commands,
            vec![MergeCommand::Conflict {
                path: "f".to_string(),
                remote_revision: "remote-instance".to_string(),
            }]
        );
    }

    #[test]
    fn conflict_respects_keep_local_oracle() {
        let dir = tempdir().unwrap();
        let local = fixture_tree(dir.path(), "local");
        let remote = fixture_tree(dir.path(), "remote");
        let ancestor = fixture_tree(dir.path(), "ancestor");

        let lf = local.add(local.root(), "f", 0o644).unwrap();
        lf.borrow_mut().write(b"local edit", 0).unwrap();
        let af = ancestor.add(ancestor.root(), "f", 0o644).unwrap();
        af.borrow_mut().write(b"original", 0).unwrap();
        let rf = remote.add(remote.root(), "f", 0o644).unwrap();
        rf.borrow_mut().write(b"remote edit", 0).unwrap();

        let always_keep = |_rev: &str, _path: &str| true;
        let merge = Merge::new(&ancestor, &remote, "remote-instance", &always_keep);
        let commands = merge.run(&lf, Some(&af), Some(&rf), "f").unwrap();
        assert!(commands.is_empty());
    }

    #[test]
    fn open_local_node_refuses_to_merge() {
        let dir = tempdir().unwrap();
        let local = fixture_tree(dir.path(), "local");
        let remote = fixture_tree(dir.path(), "remote");
        let ancestor = fixture_tree(dir.path(), "ancestor");

        let lf = local.add(local.root(), "f", 0o644).unwrap();
        lf.borrow_mut().write(b"local edit", 0).unwrap();
        Node::add_ref(&lf);
        let rf = remote.add(remote.root(), "f", 0o644).unwrap();
        rf.borrow_mut().write(b"remote edit", 0).unwrap();

        let merge = Merge::new(&ancestor, &remote, "remote-instance", &never_keep);
        let err = merge.run(&lf, None, Some(&rf), "f").unwrap_err();
        assert!(matches!(err, Error::InUse(_)));
    }

    #[test]
    fn recurses_into_matching_directories() {
        let dir = tempdir().unwrap();
        let local = fixture_tree(dir.path(), "local");
        let remote = fixture_tree(dir.path(), "remote");
        let ancestor = fixture_tree(dir.path(), "ancestor");

        let ld = local.add(local.root(), "d", DMDIR | 0o755).unwrap();
        let lf = local.add(&ld, "f", 0o644).unwrap();
        lf.borrow_mut().write(b"original", 0).unwrap();

        let ad = ancestor.add(ancestor.root(), "d", DMDIR | 0o755).unwrap();
        let af = ancestor.add(&ad, "f", 0o644).unwrap();
        af.borrow_mut().write(b"original", 0).unwrap();

        let rd = remote.add(remote.root(), "d", DMDIR | 0o755).unwrap();
        let rf = remote.add(&rd, "f", 0o644).unwrap();
        rf.borrow_mut().write(b"remote edit", 0).unwrap();

        let merge = Merge::new(&ancestor, &remote, "remote-instance", &never_keep);
        let commands = merge.run(&ld, Some(&ad), Some(&rd), "d").unwrap();
        assert_eq!(
            commands,
            vec![MergeCommand::Graft {
                remote_revision: "remote-instance".to_string(),
                remote_path: "d/f".to_string(),
                local_path: "d/f".to_string(),
            }]
        );
    }
}
