use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use sealedfs::block::Backing;
use sealedfs::cipher::BlockCipher;
use sealedfs::kv::disk::DiskStore;
use sealedfs::kv::{Enumerable, KvStore};
use sealedfs::mergebase::find_merge_base;
use sealedfs::node::Node;
use sealedfs::refs::Ref;
use sealedfs::store::Store;
use sealedfs::tree::Tree;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Maintenance operations over a sealedfs index/repository pair. Not the
/// 9P file-server front end: a thin CLI over the storage engine for
/// sealing, flushing, garbage collection and revision inspection.
#[derive(Parser)]
struct Args {
    /// Directory backing the mutable index store
    #[clap(long, default_value = "/tmp/sealedfs-index")]
    index: PathBuf,

    /// Directory backing the immutable repository store
    #[clap(long, default_value = "/tmp/sealedfs-repository")]
    repository: PathBuf,

    /// Directory backing the remote head pointer store
    #[clap(long, default_value = "/tmp/sealedfs-pointers")]
    pointers: PathBuf,

    /// Local head pointer file
    #[clap(long, default_value = "/tmp/sealedfs-head")]
    head: PathBuf,

    /// AES key, hex-encoded (32/48/64 hex chars for AES-128/192/256)
    #[clap(long)]
    key: String,

    /// Filesystem instance tag recorded on new revisions
    #[clap(long, default_value = "default")]
    instance: String,

    /// Host tag recorded on new revisions
    #[clap(long, default_value = "localhost")]
    host: String,

    /// Block capacity, in bytes, for new content blocks
    #[clap(long, default_value_t = 1 << 16)]
    block_size: u32,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Flush dirty blocks and nodes to the index and chain a revision
    Flush,
    /// Seal the tree into the repository and chain a revision
    Seal,
    /// List the closure of content-addressed keys reachable from the
    /// local head, and delete repository entries outside that closure
    Gc {
        /// Report what would be deleted without deleting anything
        #[clap(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Verify every key reachable from the local head is present in the
    /// repository
    Fsck,
    /// Print the chain of revisions reachable from the local head
    History {
        #[clap(long, default_value_t = 20)]
        max: usize,
    },
    /// Find the merge base of two revisions, given as hex keys
    MergeBase { a: String, b: String },
}

fn process_uid_gid() -> (u32, u32) {
    unsafe { (libc::getuid(), libc::getgid()) }
}

fn open_tree(args: &Args) -> Result<(Tree, Arc<DiskStore>)> {
    let key = hex::decode(&args.key).context("--key must be hex-encoded")?;
    let cipher = Arc::new(BlockCipher::new(&key)?);

    let index: Arc<dyn KvStore> = Arc::new(DiskStore::new(args.index.clone())?);
    let repository = Arc::new(DiskStore::new(args.repository.clone())?);
    let pointers: Arc<dyn KvStore> = Arc::new(DiskStore::new(args.pointers.clone())?);

    let backing = Backing::new(cipher, index, repository.clone() as Arc<dyn KvStore>);
    let (uid, gid) = process_uid_gid();
    let store = Store::new(backing.clone(), pointers, args.head.clone(), uid, gid);

    let root = Node::new_root(backing.clone(), args.block_size, 0o755, uid, gid);
    if let Some(head_ref) = store.read_local_head()? {
        let revision = store.load_revision_by_key(&head_ref)?;
        let root_ptr = revision
            .root
            .clone()
            .ok_or_else(|| anyhow!("revision {} has no root pointer", head_ref.key()))?;
        // `load_node` only consults the node's own pointer; setting it on
        // the already-parentless root materializes it in place instead of
        // through a throwaway stub wrapper.
        root.borrow_mut().set_pointer(root_ptr);
        store.load_node(&root)?;
    }

    let tree = Tree::builder()
        .store(store)
        .root(root)
        .block_size(args.block_size)
        .host(args.host.clone())
        .instance(args.instance.clone())
        .build()?;

    Ok((tree, repository))
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    match &args.command {
        Command::Flush => {
            let (tree, _repository) = open_tree(&args)?;
            let ran = tree.flush()?;
            info!("flush: ran={ran}");
            println!("flush: {}", if ran { "ok" } else { "skipped, too recent" });
        }
        Command::Seal => {
            let (tree, _repository) = open_tree(&args)?;
            tree.seal()?;
            let root_key = tree
                .root()
                .borrow()
                .pointer()
                .map(Ref::key)
                .unwrap_or_default();
            println!("seal: root={root_key}");
        }
        Command::Gc { dry_run } => {
            let (tree, repository) = open_tree(&args)?;
            let reachable = tree.reachable_keys()?;

            let mut all_keys = Vec::new();
            repository.for_each(&mut |key| {
                all_keys.push(key.to_string());
                Ok(())
            })?;

            let mut deleted = 0usize;
            for key in all_keys {
                if reachable.contains(&key) {
                    continue;
                }
                if *dry_run {
                    println!("would delete {key}");
                } else {
                    repository.delete(&key)?;
                    println!("deleted {key}");
                }
                deleted += 1;
            }
            println!("gc: {deleted} unreachable key(s){}", if *dry_run { " (dry run)" } else { "" });
        }
        Command::Fsck => {
            let (tree, repository) = open_tree(&args)?;
            let reachable = tree.reachable_keys()?;
            let mut missing: Vec<&String> = Vec::new();
            let mut present: HashSet<String> = HashSet::new();
            repository.for_each(&mut |key| {
                present.insert(key.to_string());
                Ok(())
            })?;
            for key in &reachable {
                if !present.contains(key) {
                    missing.push(key);
                }
            }
            if missing.is_empty() {
                println!("fsck: ok, {} reachable key(s)", reachable.len());
            } else {
                for key in &missing {
                    println!("missing: {key}");
                }
                return Err(anyhow!("fsck: {} missing key(s)", missing.len()));
            }
        }
        Command::History { max } => {
            let (tree, _repository) = open_tree(&args)?;
            let head = tree
                .store()
                .read_local_head()?
                .ok_or_else(|| anyhow!("no local head recorded yet"))?;
            let history = tree.store().history(*max, &head)?;
            for rev in history {
                println!(
                    "{} root={} parents={} host={} instance={} ts={}",
                    rev.key.as_ref().map(Ref::key).unwrap_or_default(),
                    rev.root.as_ref().map(Ref::key).unwrap_or_default(),
                    rev.parents.iter().map(Ref::key).collect::<Vec<_>>().join(","),
                    rev.host,
                    rev.instance,
                    rev.timestamp,
                );
            }
        }
        Command::MergeBase { a, b } => {
            let (tree, _repository) = open_tree(&args)?;
            let a_ref = Ref::from_hex(a).ok_or_else(|| anyhow!("not a valid ref: {a}"))?;
            let b_ref = Ref::from_hex(b).ok_or_else(|| anyhow!("not a valid ref: {b}"))?;
            let store = tree.store();
            let (base, graph) = find_merge_base(&a_ref, &b_ref, |r| {
                Ok(store.load_revision_by_key(r)?.parents)
            })?;
            println!("merge base: {}", base.key());
            if !graph.is_empty() {
                println!("{}", graph.to_graphviz());
            }
        }
    }

    Ok(())
}
