//! One repository instance: its object and ref storage, the revision index
//! derived from them and its configuration.
//!
//! A repository directory holds `config.toml` and, with the default
//! backends, `objects.pile` and `graph.edges`:
//!
//! ```no_run
//! use strata::config::Config;
//! use strata::repository::Repository;
//!
//! let repo = Repository::init(std::path::Path::new("parcels"), Config::default())?;
//! # Ok::<(), strata::Error>(())
//! ```

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use crate::config::Config;
use crate::config::RemoteConfig;
use crate::config::CONFIG_FILE;
use crate::error::Error;
use crate::error::Result;
use crate::graph::open_graph;
use crate::graph::AdjacencyGraph;
use crate::graph::GraphBackend;
use crate::graph::GraphBackendKind;
use crate::graph::RevisionIndex;
use crate::graph::TopoOrder;
use crate::id::ObjectId;
use crate::object::Commit;
use crate::object::Object;
use crate::refs;
use crate::refs::Ref;
use crate::remote::Remote;
use crate::store::open_storage;
use crate::store::ObjectStore;
use crate::store::RefStore;
use crate::store::Storage;
use crate::store::StorageKind;

pub const PILE_FILE: &str = "objects.pile";
pub const GRAPH_FILE: &str = "graph.edges";

pub struct Repository {
    location: Option<PathBuf>,
    config: RwLock<Config>,
    objects: Arc<dyn ObjectStore>,
    refs: Arc<dyn RefStore>,
    index: RevisionIndex,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Creates a repository in `dir`, which may already exist but must not
    /// hold a repository yet.
    pub fn init(dir: &Path, config: Config) -> Result<Self> {
        if dir.join(CONFIG_FILE).exists() {
            return Err(Error::PreconditionFailed(format!(
                "{} already holds a repository",
                dir.display()
            )));
        }
        config.save(dir)?;
        Self::open(dir)
    }

    pub fn open(dir: &Path) -> Result<Self> {
        let (config, storage) = Self::open_storage(dir)?;
        let graph_path = dir.join(GRAPH_FILE);
        let graph = open_graph(config.graph.backend, Some(&graph_path))?;

        let mut repo = Self::from_parts(config, storage, graph)?;
        repo.location = Some(dir.to_owned());
        tracing::debug!(path = %dir.display(), "opened repository");
        Ok(repo)
    }

    /// Opens only the object and ref storage of the repository in `dir`.
    pub fn open_storage(dir: &Path) -> Result<(Config, Storage)> {
        if !dir.join(CONFIG_FILE).is_file() {
            return Err(Error::PreconditionFailed(format!(
                "{} is not a repository",
                dir.display()
            )));
        }
        let config = Config::load(dir)?;
        let location = match (config.storage.backend, &config.storage.location) {
            (StorageKind::Pile, Some(file)) => dir.join(file).to_string_lossy().into_owned(),
            (StorageKind::Pile, None) => dir.join(PILE_FILE).to_string_lossy().into_owned(),
            (_, location) => location.clone().unwrap_or_default(),
        };
        let storage = open_storage(config.storage.backend, &location)?;
        Ok((config, storage))
    }

    /// A repository that lives only as long as the value.
    pub fn in_memory() -> Result<Self> {
        let mut config = Config::default();
        config.storage.backend = StorageKind::Memory;
        config.graph.backend = GraphBackendKind::Memory;
        Self::from_parts(config, Storage::memory(), Arc::new(AdjacencyGraph::new()))
    }

    /// Assembles a repository from explicit backends. Nothing is persisted
    /// by configuration changes.
    pub fn from_parts(
        config: Config,
        storage: Storage,
        graph: Arc<dyn GraphBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let index = RevisionIndex::open(graph, storage.objects.clone())?;
        Ok(Repository {
            location: None,
            config: RwLock::new(config),
            objects: storage.objects,
            refs: storage.refs,
            index,
        })
    }

    /// The repository directory, `None` for in-memory repositories.
    pub fn path(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn refs(&self) -> &Arc<dyn RefStore> {
        &self.refs
    }

    pub fn index(&self) -> &RevisionIndex {
        &self.index
    }

    pub fn storage(&self) -> Storage {
        Storage {
            objects: self.objects.clone(),
            refs: self.refs.clone(),
        }
    }

    /// Stores `object`; commits are added to the revision index as well.
    pub fn write(&self, object: &Object) -> Result<ObjectId> {
        let id = self.objects.insert(object)?;
        if let Object::Commit(commit) = object {
            self.index.add_commit(id, commit)?;
        }
        Ok(id)
    }

    pub fn read(&self, id: &ObjectId) -> Result<Object> {
        self.objects.read(id)
    }

    pub fn head(&self, name: &str) -> Result<Option<ObjectId>> {
        self.refs.head(name)
    }

    /// Moves `name` from `expected` to `new`. The target must already be
    /// stored.
    pub fn update_ref(&self, name: &str, expected: Option<ObjectId>, new: ObjectId) -> Result<()> {
        refs::validate_name(name)?;
        if !self.objects.exists(&new)? {
            return Err(Error::NotFound(new));
        }
        self.refs.update(name, expected, new)
    }

    pub fn delete_ref(&self, name: &str, expected: ObjectId) -> Result<()> {
        self.refs.delete(name, expected)
    }

    pub fn list_refs(&self, prefix: &str) -> Result<Vec<Ref>> {
        Ok(self.refs.list(prefix)?.collect())
    }

    pub fn branches(&self) -> Result<Vec<Ref>> {
        self.list_refs(refs::HEADS_PREFIX)
    }

    pub fn tags(&self) -> Result<Vec<Ref>> {
        self.list_refs(refs::TAGS_PREFIX)
    }

    /// Records a commit of `tree` on top of `branch` and advances the branch.
    ///
    /// Fails with [`Error::CompareAndSwapFailed`] when the branch moved
    /// while the commit was written.
    pub fn commit(
        &self,
        branch: &str,
        tree: ObjectId,
        author: &str,
        message: &str,
    ) -> Result<ObjectId> {
        let name = refs::head(branch);
        let parent = self.refs.head(&name)?;
        let commit = Commit::new(tree, parent.into_iter().collect(), author, message);
        let id = self.write(&Object::Commit(commit))?;
        self.update_ref(&name, parent, id)?;
        tracing::debug!(branch, commit = %id.short(), "committed");
        Ok(id)
    }

    pub fn is_ancestor(&self, ancestor: ObjectId, descendant: ObjectId) -> Result<bool> {
        self.index.is_ancestor(ancestor, descendant)
    }

    pub fn merge_base(&self, a: ObjectId, b: ObjectId) -> Result<Vec<ObjectId>> {
        self.index.merge_base(a, b)
    }

    /// History of `tips`, children before parents.
    pub fn log(&self, tips: &[ObjectId]) -> Result<TopoOrder> {
        self.index.topo_order(tips)
    }

    pub fn remote(&self, name: &str) -> Result<Option<Remote>> {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        config
            .remotes
            .get(name)
            .map(|remote| Remote::from_config(name, remote))
            .transpose()
    }

    pub fn has_remote(&self, name: &str) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .remotes
            .contains_key(name)
    }

    pub fn remotes(&self) -> Result<Vec<Remote>> {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        config
            .remotes
            .iter()
            .map(|(name, remote)| Remote::from_config(name, remote))
            .collect()
    }

    /// Adds a remote and saves the configuration.
    pub fn add_remote(&self, name: &str, remote: RemoteConfig) -> Result<Remote> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        if config.remotes.contains_key(name) {
            return Err(Error::Config(format!("remote {name} already exists")));
        }
        let created = Remote::from_config(name, &remote)?;
        let mut updated = config.clone();
        updated.remotes.insert(name.to_owned(), remote);
        self.persist(&updated)?;
        *config = updated;
        tracing::info!(remote = name, url = %created.fetch_url, "added remote");
        Ok(created)
    }

    /// Removes a remote together with its tracking refs.
    pub fn remove_remote(&self, name: &str) -> Result<()> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        if !config.remotes.contains_key(name) {
            return Err(Error::Config(format!("no remote named {name}")));
        }
        let mut updated = config.clone();
        updated.remotes.remove(name);
        self.persist(&updated)?;
        *config = updated;
        drop(config);

        for tracking in self.refs.list(&refs::remote_prefix(name))? {
            match self.refs.delete(&tracking.name, tracking.target) {
                Ok(()) | Err(Error::RefNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(remote = name, "removed remote");
        Ok(())
    }

    fn persist(&self, config: &Config) -> Result<()> {
        match &self.location {
            Some(dir) => config.save(dir),
            None => config.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Tree;
    use bytes::Bytes;

    fn tree(repo: &Repository, row: &'static [u8]) -> ObjectId {
        let blob = repo.write(&Object::Blob(Bytes::from_static(row))).unwrap();
        let mut tree = Tree::new();
        tree.insert("row", crate::object::ObjectKind::Blob, blob)
            .unwrap();
        repo.write(&Object::Tree(tree)).unwrap()
    }

    #[test]
    fn commits_advance_branch_and_index() {
        let repo = Repository::in_memory().unwrap();
        let first = repo.commit("main", tree(&repo, b"1"), "ana", "one").unwrap();
        let second = repo.commit("main", tree(&repo, b"2"), "ana", "two").unwrap();
        assert_eq!(repo.head("refs/heads/main").unwrap(), Some(second));
        assert!(repo.is_ancestor(first, second).unwrap());
        assert_eq!(repo.branches().unwrap(), vec![Ref::new("refs/heads/main", second)]);
    }

    #[test]
    fn update_ref_needs_stored_target_and_valid_name() {
        let repo = Repository::in_memory().unwrap();
        let dangling = Object::Blob(Bytes::from_static(b"nowhere")).id();
        assert!(matches!(
            repo.update_ref("refs/heads/main", None, dangling),
            Err(Error::NotFound(id)) if id == dangling
        ));
        let stored = repo.write(&Object::Blob(Bytes::from_static(b"here"))).unwrap();
        assert!(matches!(
            repo.update_ref("refs/heads/../main", None, stored),
            Err(Error::InvalidRefName(_))
        ));
    }

    #[test]
    fn init_refuses_existing_repository() {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path(), Config::default()).unwrap();
        assert!(matches!(
            Repository::init(dir.path(), Config::default()),
            Err(Error::PreconditionFailed(_))
        ));
    }

    #[test]
    fn open_requires_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Repository::open(dir.path()),
            Err(Error::PreconditionFailed(_))
        ));
    }

    #[test]
    fn remotes_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = Repository::init(dir.path(), Config::default()).unwrap();
            repo.add_remote("origin", RemoteConfig::new("memory:///"))
                .unwrap();
            assert!(matches!(
                repo.add_remote("origin", RemoteConfig::new("memory:///")),
                Err(Error::Config(_))
            ));
        }
        let repo = Repository::open(dir.path()).unwrap();
        assert!(repo.has_remote("origin"));
        let origin = repo.remote("origin").unwrap().unwrap();
        assert_eq!(origin.fetch_url, "memory:///");
        assert!(repo.remote("upstream").unwrap().is_none());
    }

    #[test]
    fn removing_a_remote_drops_its_tracking_refs() {
        let repo = Repository::in_memory().unwrap();
        repo.add_remote("origin", RemoteConfig::new("memory:///"))
            .unwrap();
        let target = repo.commit("main", tree(&repo, b"1"), "ana", "one").unwrap();
        repo.update_ref("refs/remotes/origin/main", None, target)
            .unwrap();

        repo.remove_remote("origin").unwrap();
        assert!(!repo.has_remote("origin"));
        assert!(repo.list_refs("refs/remotes/").unwrap().is_empty());
        assert_eq!(repo.branches().unwrap().len(), 1);
    }
}
