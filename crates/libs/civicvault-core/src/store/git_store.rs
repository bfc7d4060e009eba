//! Git gateway for the records tree.
//!
//! Every committed record mutation goes through here. Author identity is
//! supplied per call and mapped to `name <email>`; nothing touches global
//! git configuration. If the working tree is uninitialized, `init` happens
//! on first use.
//!
//! Writers are serialized at the application level (see
//! `ModelManager::git_lock`): git2's index locking does not handle high
//! concurrency well. Readers against a specific revision bypass the lock.

use crate::error::{Error, Result};
use git2::{Error as GitError, Oid, Repository, Signature, Tree};
use std::path::Path;

/// One revision in a record's history.
#[derive(Debug, Clone)]
pub struct Revision {
    pub oid: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub time: i64,
}

/// Initializes or opens a git repository at the given path.
///
/// Checks for a `.git` directory at exactly this path rather than using
/// `discover`, so a civic data dir nested inside another repository still
/// gets its own history.
pub fn init_or_open_repo<P: AsRef<Path>>(path: P) -> Result<Repository> {
    let path_ref = path.as_ref();
    let git_dir = path_ref.join(".git");
    if git_dir.exists() {
        Repository::open(path_ref).map_err(Error::from)
    } else {
        Repository::init(path).map_err(Error::from)
    }
}

/// Opens an existing git repository, failing if none exists.
pub fn open_repo<P: AsRef<Path>>(path: P) -> Result<Repository> {
    Repository::open(path).map_err(Error::from)
}

/// Creates a commit with the given tree and signature.
fn create_commit(
    repo: &Repository,
    tree: &Tree,
    signature: &Signature,
    message: &str,
) -> Result<Oid> {
    let parent_commit_opt = find_last_commit(repo)?;
    let commit_oid = match parent_commit_opt {
        Some(ref parent) => {
            repo.commit(Some("HEAD"), signature, signature, message, tree, &[parent])?
        }
        None => repo.commit(Some("HEAD"), signature, signature, message, tree, &[])?,
    };
    Ok(commit_oid)
}

/// Stages the given additions and removals and commits them.
///
/// Paths are relative to the repository root. Files in `added` must already
/// exist on disk; files in `removed` must already be gone. Returns
/// `NothingToCommit` when the resulting tree is identical to HEAD.
pub fn commit_changes<P: AsRef<Path>>(
    repo: &Repository,
    added: &[P],
    removed: &[P],
    message: &str,
    author_name: &str,
    author_email: &str,
) -> Result<Oid> {
    let mut index = repo.index()?;
    for path in added {
        index.add_path(path.as_ref())?;
    }
    for path in removed {
        index.remove_path(path.as_ref())?;
    }
    index.write()?;

    let tree_oid = index.write_tree()?;

    // Identical tree means the working set had no effective change.
    if let Some(parent) = find_last_commit(repo)? {
        if parent.tree_id() == tree_oid {
            return Err(Error::Git2(GitError::from_str("nothing to commit")));
        }
    }

    let tree = repo.find_tree(tree_oid)?;
    let signature = Signature::now(author_name, author_email)?;
    create_commit(repo, &tree, &signature, message)
}

/// Finds the last commit in the repository, `None` if the repo is empty.
fn find_last_commit(repo: &Repository) -> Result<Option<git2::Commit<'_>>> {
    let head = repo.head();
    match head {
        Ok(head) => {
            let obj = head.resolve()?.peel(git2::ObjectType::Commit)?;
            let commit = obj.into_commit().map_err(|obj_not_commit| {
                GitError::from_str(&format!(
                    "Object is not a commit: {:?}",
                    obj_not_commit.id()
                ))
            })?;
            Ok(Some(commit))
        }
        Err(ref e)
            if e.code() == git2::ErrorCode::NotFound
                || e.code() == git2::ErrorCode::UnbornBranch =>
        {
            Ok(None)
        } // Empty repo
        Err(e) => Err(Error::from(e)),
    }
}

/// Returns the current HEAD oid, `None` for an empty repository.
pub fn head_oid(repo: &Repository) -> Result<Option<Oid>> {
    Ok(find_last_commit(repo)?.map(|c| c.id()))
}

/// Reads a file's content at a specific commit.
///
/// Returns `None` if the file does not exist at that commit.
pub fn read_file_at_commit<P: AsRef<Path>>(
    repo: &Repository,
    commit_oid: Oid,
    file_path: P,
) -> Result<Option<String>> {
    let commit = repo.find_commit(commit_oid)?;
    let tree = commit.tree()?;

    match tree.get_path(file_path.as_ref()) {
        Ok(entry) => {
            let object = entry.to_object(repo)?;
            let blob = object
                .as_blob()
                .ok_or_else(|| GitError::from_str("Object is not a blob"))?;
            Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
        }
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(Error::from(e)),
    }
}

/// Walks history from HEAD and returns the revisions that touched `path`.
pub fn history<P: AsRef<Path>>(repo: &Repository, path: P) -> Result<Vec<Revision>> {
    let head = match find_last_commit(repo)? {
        Some(c) => c,
        None => return Ok(Vec::new()),
    };

    let mut revwalk = repo.revwalk()?;
    revwalk.push(head.id())?;
    revwalk.set_sorting(git2::Sort::TIME)?;

    let mut revisions = Vec::new();
    for oid_result in revwalk {
        let oid = oid_result?;
        let commit = repo.find_commit(oid)?;

        let current = blob_id_at(&commit, path.as_ref())?;
        let parent_blob = if commit.parent_count() > 0 {
            blob_id_at(&commit.parent(0)?, path.as_ref())?
        } else {
            None
        };

        if current != parent_blob {
            let author = commit.author();
            revisions.push(Revision {
                oid: oid.to_string(),
                message: commit.message().unwrap_or("").to_string(),
                author_name: author.name().unwrap_or("").to_string(),
                author_email: author.email().unwrap_or("").to_string(),
                time: commit.time().seconds(),
            });
        }
    }

    Ok(revisions)
}

fn blob_id_at(commit: &git2::Commit<'_>, path: &Path) -> Result<Option<Oid>> {
    let tree = commit.tree()?;
    match tree.get_path(path) {
        Ok(entry) => Ok(Some(entry.id())),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(Error::from(e)),
    }
}

/// Produces a unified diff between two revisions, optionally limited to one
/// path.
pub fn diff(
    repo: &Repository,
    rev1: &str,
    rev2: &str,
    path: Option<&Path>,
) -> Result<String> {
    let tree1 = repo.find_commit(Oid::from_str(rev1)?)?.tree()?;
    let tree2 = repo.find_commit(Oid::from_str(rev2)?)?.tree()?;

    let mut opts = git2::DiffOptions::new();
    if let Some(p) = path {
        opts.pathspec(p);
    }

    let diff = repo.diff_tree_to_tree(Some(&tree1), Some(&tree2), Some(&mut opts))?;

    let mut out = String::new();
    diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
        match line.origin() {
            '+' | '-' | ' ' => out.push(line.origin()),
            _ => {}
        }
        out.push_str(&String::from_utf8_lossy(line.content()));
        true
    })?;

    Ok(out)
}

/// Undoes a commit during saga compensation.
///
/// If the commit is still HEAD and has a parent, resets hard to the parent
/// (nothing downstream observed it yet) and returns `None`. Otherwise
/// creates a revert commit under the given identity and returns its oid.
pub fn undo_commit(
    repo: &Repository,
    oid: Oid,
    author_name: &str,
    author_email: &str,
) -> Result<Option<Oid>> {
    let commit = repo.find_commit(oid)?;
    let head = head_oid(repo)?;

    if head == Some(oid) && commit.parent_count() > 0 {
        let parent = commit.parent(0)?;
        repo.reset(parent.as_object(), git2::ResetType::Hard, None)?;
        return Ok(None);
    }

    let head_commit = find_last_commit(repo)?
        .ok_or_else(|| Error::Git2(GitError::from_str("cannot revert in empty repository")))?;
    let mut revert_index = repo.revert_commit(&commit, &head_commit, 0, None)?;
    let tree_oid = revert_index.write_tree_to(repo)?;
    let tree = repo.find_tree(tree_oid)?;

    // Bring the working tree in line with the reverted index.
    repo.checkout_tree(
        tree.as_object(),
        Some(git2::build::CheckoutBuilder::new().force()),
    )?;
    let mut index = repo.index()?;
    index.read_tree(&tree)?;
    index.write()?;

    let signature = Signature::now(author_name, author_email)?;
    let message = format!(
        "revert: {}",
        commit.summary().unwrap_or("(no message)")
    );
    let new_oid = create_commit(repo, &tree, &signature, &message)?;
    Ok(Some(new_oid))
}

/// Pending working-tree changes under a prefix: paths to stage and paths
/// to remove. Feeds the standalone `commit` command, which picks up hand
/// edits and the uncommitted rewrites `database-wins` leaves behind.
pub fn pending_changes(repo: &Repository, prefix: &str) -> Result<(Vec<String>, Vec<String>)> {
    let mut opts = git2::StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);

    let statuses = repo.statuses(Some(&mut opts))?;
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for entry in statuses.iter() {
        let Some(path) = entry.path() else { continue };
        if !path.starts_with(prefix) {
            continue;
        }
        let status = entry.status();
        if status.intersects(git2::Status::WT_NEW | git2::Status::WT_MODIFIED) {
            added.push(path.to_string());
        } else if status.contains(git2::Status::WT_DELETED) {
            removed.push(path.to_string());
        }
    }
    Ok((added, removed))
}

/// Lists record files present in the working tree but unknown to git.
///
/// Used by startup reconciliation: a crash between file write and commit
/// leaves an untracked file, which is reported but never auto-committed.
pub fn untracked_paths(repo: &Repository) -> Result<Vec<String>> {
    let mut opts = git2::StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);

    let statuses = repo.statuses(Some(&mut opts))?;
    let mut paths = Vec::new();
    for entry in statuses.iter() {
        if entry.status().contains(git2::Status::WT_NEW) {
            if let Some(p) = entry.path() {
                paths.push(p.to_string());
            }
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tempfile::TempDir;

    fn write_file(root: &Path, rel: &str, content: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, content).unwrap();
    }

    #[test]
    fn test_commit_and_read_back() {
        let dir = TempDir::new().unwrap();
        let repo = init_or_open_repo(dir.path()).unwrap();

        write_file(dir.path(), "records/bylaw/noise.md", "---\ntitle: Noise\n---\nbody");
        let oid = commit_changes(
            &repo,
            &[Path::new("records/bylaw/noise.md")],
            &[] as &[&Path],
            "feat(bylaw): add noise",
            "clerk-ada",
            "clerk-ada@civicvault.local",
        )
        .unwrap();

        let content = read_file_at_commit(&repo, oid, "records/bylaw/noise.md").unwrap();
        assert!(content.unwrap().contains("title: Noise"));
    }

    #[test]
    fn test_nothing_to_commit() {
        let dir = TempDir::new().unwrap();
        let repo = init_or_open_repo(dir.path()).unwrap();

        write_file(dir.path(), "a.md", "one");
        commit_changes(&repo, &[Path::new("a.md")], &[] as &[&Path], "add", "u", "u@x").unwrap();

        // Same content again: tree unchanged.
        let err = commit_changes(&repo, &[Path::new("a.md")], &[] as &[&Path], "noop", "u", "u@x")
            .unwrap_err();
        assert!(err.to_string().contains("nothing to commit"));
    }

    #[test]
    fn test_undo_commit_resets_head() {
        let dir = TempDir::new().unwrap();
        let repo = init_or_open_repo(dir.path()).unwrap();

        write_file(dir.path(), "a.md", "one");
        let first =
            commit_changes(&repo, &[Path::new("a.md")], &[] as &[&Path], "add a", "u", "u@x")
                .unwrap();

        write_file(dir.path(), "b.md", "two");
        let second =
            commit_changes(&repo, &[Path::new("b.md")], &[] as &[&Path], "add b", "u", "u@x")
                .unwrap();

        // Undoing HEAD with a parent resets, producing no new commit.
        let result = undo_commit(&repo, second, "u", "u@x").unwrap();
        assert!(result.is_none());
        assert_eq!(head_oid(&repo).unwrap(), Some(first));
    }

    #[test]
    fn test_history_tracks_only_touching_commits() {
        let dir = TempDir::new().unwrap();
        let repo = init_or_open_repo(dir.path()).unwrap();

        write_file(dir.path(), "a.md", "one");
        commit_changes(&repo, &[Path::new("a.md")], &[] as &[&Path], "add a", "u", "u@x").unwrap();
        write_file(dir.path(), "b.md", "two");
        commit_changes(&repo, &[Path::new("b.md")], &[] as &[&Path], "add b", "u", "u@x").unwrap();
        write_file(dir.path(), "a.md", "one-changed");
        commit_changes(&repo, &[Path::new("a.md")], &[] as &[&Path], "edit a", "u", "u@x")
            .unwrap();

        let revs = history(&repo, "a.md").unwrap();
        assert_eq!(revs.len(), 2);
        assert!(revs.iter().all(|r| r.message.contains('a')));
    }

    #[test]
    fn test_untracked_paths() {
        let dir = TempDir::new().unwrap();
        let repo = init_or_open_repo(dir.path()).unwrap();

        write_file(dir.path(), "records/bylaw/stray.md", "---\ntitle: Stray\n---\n");
        let untracked = untracked_paths(&repo).unwrap();
        assert_eq!(untracked, vec!["records/bylaw/stray.md".to_string()]);
    }
}
