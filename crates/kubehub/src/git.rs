//! Repository directory listing over libgit2 bare mirrors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use appset_core::{stable_hash, Error};
use appset_generators::RepoService;
use git2::{build::RepoBuilder, FetchOptions, ObjectType, Repository, TreeWalkMode, TreeWalkResult};
use metrics::histogram;
use tracing::{debug, info};

const FETCH_REFSPECS: &[&str] = &["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"];

/// Clones each repository once into `cache_dir` and fetches on every
/// listing. Listings of the same repository are serialized.
pub struct GitRepoService {
    cache_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitRepoService {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self { cache_dir: cache_dir.into(), locks: Mutex::new(HashMap::new()) }
    }

    fn repo_lock(&self, repo_url: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(repo_url.to_string()).or_default())
    }

    fn mirror_path(&self, repo_url: &str) -> PathBuf {
        self.cache_dir.join(format!("{:016x}", stable_hash(repo_url)))
    }
}

#[async_trait::async_trait]
impl RepoService for GitRepoService {
    async fn list_directories(&self, repo_url: &str, revision: &str) -> appset_core::Result<Vec<String>> {
        let lock = self.repo_lock(repo_url);
        let _guard = lock.lock().await;
        let t0 = Instant::now();
        let path = self.mirror_path(repo_url);
        let (url, rev) = (repo_url.to_string(), revision.to_string());
        let dirs = tokio::task::spawn_blocking(move || list_blocking(&path, &url, &rev))
            .await
            .map_err(|e| Error::Internal(format!("git worker: {e}")))?
            .map_err(|e| Error::source_unavailable("git", format!("{e:#}")))?;
        histogram!("appset_git_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(repo = %repo_url, revision = %revision, dirs = dirs.len(), took_ms = %t0.elapsed().as_millis(), "git: listed directories");
        Ok(dirs)
    }
}

fn open_or_clone(path: &Path, url: &str) -> Result<Repository> {
    if path.join("HEAD").exists() {
        let repo = Repository::open_bare(path).with_context(|| format!("opening mirror {}", path.display()))?;
        {
            let mut remote = repo.remote_anonymous(url)?;
            remote.fetch(FETCH_REFSPECS, Some(&mut FetchOptions::new()), None).with_context(|| format!("fetching {url}"))?;
        }
        debug!(repo = %url, "git: fetched");
        return Ok(repo);
    }
    std::fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))?;
    let repo = RepoBuilder::new().bare(true).clone(url, path).with_context(|| format!("cloning {url}"))?;
    debug!(repo = %url, "git: cloned");
    Ok(repo)
}

fn list_blocking(path: &Path, url: &str, revision: &str) -> Result<Vec<String>> {
    let repo = open_or_clone(path, url)?;
    list_tree_directories(&repo, revision)
}

/// Every non-hidden directory of the tree at `revision`, `/`-separated.
pub(crate) fn list_tree_directories(repo: &Repository, revision: &str) -> Result<Vec<String>> {
    let object = repo.revparse_single(revision).with_context(|| format!("resolving revision {revision}"))?;
    let tree = object.peel_to_tree().with_context(|| format!("{revision} does not name a tree"))?;
    let mut dirs = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() != Some(ObjectType::Tree) {
            return TreeWalkResult::Ok;
        }
        match entry.name() {
            Some(name) if !name.starts_with('.') => {
                dirs.push(format!("{root}{name}"));
                TreeWalkResult::Ok
            }
            _ => TreeWalkResult::Skip,
        }
    })?;
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;

    fn commit_tree(repo: &Repository, files: &[&str]) {
        let root = repo.workdir().unwrap().to_path_buf();
        for f in files {
            let p = root.join(f);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(&p, "x").unwrap();
        }
        let mut index = repo.index().unwrap();
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
    }

    #[test]
    fn lists_nested_directories_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        commit_tree(&repo, &["guestbook/a.yaml", "helm-guestbook/templates/b.yaml", ".github/ci.yaml", "README.md"]);
        let dirs = list_tree_directories(&repo, "HEAD").unwrap();
        assert_eq!(dirs, vec!["guestbook", "helm-guestbook", "helm-guestbook/templates"]);
        assert!(list_tree_directories(&repo, "no-such-branch").is_err());
    }

    #[tokio::test]
    async fn clones_local_repository_into_cache() {
        let src = tempfile::tempdir().unwrap();
        let repo = Repository::init(src.path()).unwrap();
        commit_tree(&repo, &["apps/one/x.yaml"]);
        let cache = tempfile::tempdir().unwrap();
        let svc = GitRepoService::new(cache.path());
        let url = src.path().to_string_lossy().to_string();
        let dirs = svc.list_directories(&url, "HEAD").await.unwrap();
        assert_eq!(dirs, vec!["apps", "apps/one"]);
        // second call takes the fetch path
        assert_eq!(svc.list_directories(&url, "HEAD").await.unwrap(), dirs);
        assert!(matches!(svc.list_directories(&url, "missing").await, Err(Error::SourceUnavailable { .. })));
    }
}
