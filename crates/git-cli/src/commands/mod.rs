pub mod bundle;
pub mod cat_file;
pub mod check_ref_format;
pub mod clone;
pub mod commit_graph;
pub mod commit_tree;
pub mod config;
pub mod count_objects;
pub mod credential;
pub mod daemon;
pub mod fetch;
pub mod for_each_ref;
pub mod fsck;
pub mod hash_object;
pub mod index_pack;
pub mod init;
pub mod ls_remote;
pub mod ls_tree;
pub mod merge_base;
pub mod mktag;
pub mod mktree;
pub mod pack_objects;
pub mod prune;
pub mod push;
pub mod reflog;
pub mod remote;
pub mod repack;
pub mod rev_list;
pub mod rev_parse;
pub mod show_ref;
pub mod symbolic_ref;
pub mod tag;
pub mod update_ref;
pub mod var;
pub mod verify_commit;
pub mod verify_pack;
pub mod verify_tag;

use anyhow::Result;
use clap::Subcommand;

use crate::Cli;

#[derive(Subcommand)]
pub enum Commands {
    /// Provide content or type and size information for repository objects
    CatFile(cat_file::CatFileArgs),
    /// Compute object ID and optionally create a blob from a file
    HashObject(hash_object::HashObjectArgs),
    /// Pick out and massage parameters
    RevParse(rev_parse::RevParseArgs),
    /// Update the object name stored in a ref safely
    UpdateRef(update_ref::UpdateRefArgs),
    /// Output information on each ref
    ForEachRef(for_each_ref::ForEachRefArgs),
    /// List references in a local repository
    ShowRef(show_ref::ShowRefArgs),
    /// Read, modify and delete symbolic refs
    SymbolicRef(symbolic_ref::SymbolicRefArgs),
    /// List the contents of a tree object
    LsTree(ls_tree::LsTreeArgs),
    /// Build a tree-object from ls-tree formatted text
    Mktree(mktree::MktreeArgs),
    /// Creates a tag object with extra validation
    Mktag(mktag::MktagArgs),
    /// Create a new commit object
    CommitTree(commit_tree::CommitTreeArgs),
    /// Validate packed archive files
    VerifyPack(verify_pack::VerifyPackArgs),
    /// Ensure that a reference name is well formed
    CheckRefFormat(check_ref_format::CheckRefFormatArgs),
    /// Show a Git logical variable
    Var(var::VarArgs),
    /// Create an empty Git repository or reinitialize an existing one
    Init(init::InitArgs),
    /// Clone a repository into a new directory
    Clone(clone::CloneArgs),
    /// Get and set repository or global options
    Config(config::ConfigArgs),
    /// Manage set of tracked repositories
    Remote(remote::RemoteArgs),
    /// Download objects and refs from another repository
    Fetch(fetch::FetchArgs),
    /// Update remote refs along with associated objects
    Push(push::PushArgs),
    /// Create, list, delete or verify a tag object
    Tag(tag::TagArgs),
    /// Lists commit objects in reverse chronological order
    RevList(rev_list::RevListArgs),
    /// Manage reflog information
    Reflog(reflog::ReflogArgs),
    /// Pack unpacked objects in a repository
    Repack(repack::RepackArgs),
    /// Prune all unreachable objects from the object database
    Prune(prune::PruneArgs),
    /// Verifies the connectivity and validity of the objects in the database
    Fsck(fsck::FsckArgs),
    /// Create a packed archive of objects
    PackObjects(pack_objects::PackObjectsArgs),
    /// Build pack index file for an existing packed archive
    IndexPack(index_pack::IndexPackArgs),
    /// Verify GPG signature of commits
    VerifyCommit(verify_commit::VerifyCommitArgs),
    /// Verify GPG signature of tags
    VerifyTag(verify_tag::VerifyTagArgs),
    /// Retrieve and store user credentials
    Credential(credential::CredentialArgs),
    /// Create, unpack, and manipulate bundle files
    Bundle(bundle::BundleArgs),
    /// A really simple server for Git repositories
    Daemon(daemon::DaemonArgs),
    /// Write and verify commit-graph files
    CommitGraph(commit_graph::CommitGraphArgs),
    /// Count unpacked number of objects and their disk consumption
    CountObjects(count_objects::CountObjectsArgs),
    /// List references in a remote repository
    LsRemote(ls_remote::LsRemoteArgs),
    /// Find as good common ancestors as possible for a merge
    MergeBase(merge_base::MergeBaseArgs),
}

impl Commands {
    /// Get the command name as used in config keys (e.g., "fetch", "push").
    pub fn command_name(&self) -> &str {
        match self {
            Commands::CatFile(_) => "cat-file",
            Commands::HashObject(_) => "hash-object",
            Commands::RevParse(_) => "rev-parse",
            Commands::UpdateRef(_) => "update-ref",
            Commands::ForEachRef(_) => "for-each-ref",
            Commands::ShowRef(_) => "show-ref",
            Commands::SymbolicRef(_) => "symbolic-ref",
            Commands::LsTree(_) => "ls-tree",
            Commands::Mktree(_) => "mktree",
            Commands::Mktag(_) => "mktag",
            Commands::CommitTree(_) => "commit-tree",
            Commands::VerifyPack(_) => "verify-pack",
            Commands::CheckRefFormat(_) => "check-ref-format",
            Commands::Var(_) => "var",
            Commands::Init(_) => "init",
            Commands::Clone(_) => "clone",
            Commands::Config(_) => "config",
            Commands::Remote(_) => "remote",
            Commands::Fetch(_) => "fetch",
            Commands::Push(_) => "push",
            Commands::Tag(_) => "tag",
            Commands::RevList(_) => "rev-list",
            Commands::Reflog(_) => "reflog",
            Commands::Repack(_) => "repack",
            Commands::Prune(_) => "prune",
            Commands::Fsck(_) => "fsck",
            Commands::PackObjects(_) => "pack-objects",
            Commands::IndexPack(_) => "index-pack",
            Commands::VerifyCommit(_) => "verify-commit",
            Commands::VerifyTag(_) => "verify-tag",
            Commands::Credential(_) => "credential",
            Commands::Bundle(_) => "bundle",
            Commands::Daemon(_) => "daemon",
            Commands::CommitGraph(_) => "commit-graph",
            Commands::CountObjects(_) => "count-objects",
            Commands::LsRemote(_) => "ls-remote",
            Commands::MergeBase(_) => "merge-base",
        }
    }
}

/// Open a repository, respecting --git-dir override.
pub fn open_repo(cli: &Cli) -> Result<git_repository::Repository> {
    let repo = if let Some(ref git_dir) = cli.git_dir {
        git_repository::Repository::open(git_dir)?
    } else {
        git_repository::Repository::discover(".")?
    };
    Ok(repo)
}

pub fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        Commands::CatFile(args) => cat_file::run(args, &cli),
        Commands::HashObject(args) => hash_object::run(args, &cli),
        Commands::RevParse(args) => rev_parse::run(args, &cli),
        Commands::UpdateRef(args) => update_ref::run(args, &cli),
        Commands::ForEachRef(args) => for_each_ref::run(args, &cli),
        Commands::ShowRef(args) => show_ref::run(args, &cli),
        Commands::SymbolicRef(args) => symbolic_ref::run(args, &cli),
        Commands::LsTree(args) => ls_tree::run(args, &cli),
        Commands::Mktree(args) => mktree::run(args, &cli),
        Commands::Mktag(args) => mktag::run(args, &cli),
        Commands::CommitTree(args) => commit_tree::run(args, &cli),
        Commands::VerifyPack(args) => verify_pack::run(args, &cli),
        Commands::CheckRefFormat(args) => check_ref_format::run(args),
        Commands::Var(args) => var::run(args, &cli),
        Commands::Init(args) => init::run(args, &cli),
        Commands::Clone(args) => clone::run(args, &cli),
        Commands::Config(args) => config::run(args, &cli),
        Commands::Remote(args) => remote::run(args, &cli),
        Commands::Fetch(args) => fetch::run(args, &cli),
        Commands::Push(args) => push::run(args, &cli),
        Commands::Tag(args) => tag::run(args, &cli),
        Commands::RevList(args) => rev_list::run(args, &cli),
        Commands::Reflog(args) => reflog::run(args, &cli),
        Commands::Repack(args) => repack::run(args, &cli),
        Commands::Prune(args) => prune::run(args, &cli),
        Commands::Fsck(args) => fsck::run(args, &cli),
        Commands::PackObjects(args) => pack_objects::run(args, &cli),
        Commands::IndexPack(args) => index_pack::run(args, &cli),
        Commands::VerifyCommit(args) => verify_commit::run(args, &cli),
        Commands::VerifyTag(args) => verify_tag::run(args, &cli),
        Commands::Credential(args) => credential::run(args, &cli),
        Commands::Bundle(args) => bundle::run(args, &cli),
        Commands::Daemon(args) => daemon::run(args, &cli),
        Commands::CommitGraph(args) => commit_graph::run(args, &cli),
        Commands::CountObjects(args) => count_objects::run(args, &cli),
        Commands::LsRemote(args) => ls_remote::run(args, &cli),
        Commands::MergeBase(args) => merge_base::run(args, &cli),
    }
}
