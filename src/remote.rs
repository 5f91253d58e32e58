//! Remote repositories.
//!
//! A remote is reached through a [`RemoteRepo`] session, a small state
//! machine that must be opened before use and closed exactly once after:
//!
//! ```text
//! Closed --open--> Open --list_refs/fetch/push--> Open --close--> Closed
//! ```
//!
//! Sessions never write local refs. [`RemoteRepo::fetch`] only copies
//! objects into the local store and reports what the remote refs point to;
//! deciding which local names move is left to [`crate::sync`].
//!
//! Transports are picked by URL scheme through a [`RemoteFactory`]. The
//! default factory understands local repository directories (`file://` or a
//! bare path) and every scheme `object_store` knows.

pub mod session;
pub mod store_remote;
mod transfer;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::config::RemoteConfig;
use crate::error::Error;
use crate::error::RejectReason;
use crate::error::Result;
use crate::error::TransportError;
use crate::id::ObjectId;
use crate::refs::validate_remote_name;
use crate::refs::Ref;
use crate::refs::RefSpec;
use crate::repository::Repository;
use crate::store::ObjectStore;
use crate::store::ObjectStoreBackend;
use crate::store::Storage;

pub use session::with_session;
pub use store_remote::StoreRemote;

/// A configured remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub fetch_url: String,
    pub push_url: Option<String>,
    pub fetch: RefSpec,
    pub timeout: Option<Duration>,
}

impl Remote {
    /// A remote fetching with the default refspec.
    pub fn new(name: &str, url: impl Into<String>) -> Result<Self> {
        Self::from_config(name, &RemoteConfig::new(url))
    }

    pub fn from_config(name: &str, config: &RemoteConfig) -> Result<Self> {
        validate_remote_name(name)?;
        if config.url.is_empty() {
            return Err(Error::Config(format!("remote {name} has an empty url")));
        }
        let fetch = match &config.fetch {
            Some(spec) => spec.parse()?,
            None => RefSpec::default_fetch(name),
        };
        Ok(Remote {
            name: name.to_owned(),
            fetch_url: config.url.clone(),
            push_url: config.push_url.clone(),
            fetch,
            timeout: config.timeout_secs.map(Duration::from_secs),
        })
    }

    /// The URL pushes go to; the fetch URL unless a push URL is set.
    pub fn push_url(&self) -> &str {
        self.push_url.as_deref().unwrap_or(&self.fetch_url)
    }

    pub fn url(&self, direction: Direction) -> &str {
        match direction {
            Direction::Fetch => &self.fetch_url,
            Direction::Push => self.push_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Fetch,
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Closed => f.write_str("closed"),
            SessionState::Open => f.write_str("open"),
        }
    }
}

/// Something to fetch: a remote ref, or an object by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Want {
    Ref(String),
    Object(ObjectId),
}

/// A requested change of one remote ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub name: String,
    /// What the pusher believes the remote ref holds now.
    pub expected: Option<ObjectId>,
    pub new: ObjectId,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    Accepted,
    Rejected(RejectReason),
}

impl PushStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushStatus::Accepted)
    }
}

/// Shared flag that asks running transfers to stop between objects.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A session with one remote repository.
///
/// Every method other than [`RemoteRepo::open`] fails with
/// [`Error::IllegalState`] while the session is closed, and `open` fails
/// while it is open.
pub trait RemoteRepo: Send {
    fn name(&self) -> &str;

    fn state(&self) -> SessionState;

    fn open(&mut self) -> Result<()>;

    /// Remote branches and/or tags.
    fn list_refs(&mut self, heads: bool, tags: bool) -> Result<BTreeSet<Ref>>;

    /// Copies every object reachable from `want` that `local` lacks,
    /// children before parents, and returns the wanted refs as the remote
    /// sees them.
    fn fetch(&mut self, local: &dyn ObjectStore, want: &[Want]) -> Result<BTreeSet<Ref>>;

    /// Copies the closure of every new target to the remote, then applies
    /// each update with compare-and-swap. Fails as a whole only if the
    /// object transfer fails; individual refs may still be rejected.
    fn push(
        &mut self,
        local: &dyn ObjectStore,
        updates: &[RefUpdate],
    ) -> Result<Vec<(String, PushStatus)>>;

    fn close(&mut self) -> Result<()>;
}

impl<R: RemoteRepo + ?Sized> RemoteRepo for Box<R> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn state(&self) -> SessionState {
        (**self).state()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn list_refs(&mut self, heads: bool, tags: bool) -> Result<BTreeSet<Ref>> {
        (**self).list_refs(heads, tags)
    }

    fn fetch(&mut self, local: &dyn ObjectStore, want: &[Want]) -> Result<BTreeSet<Ref>> {
        (**self).fetch(local, want)
    }

    fn push(
        &mut self,
        local: &dyn ObjectStore,
        updates: &[RefUpdate],
    ) -> Result<Vec<(String, PushStatus)>> {
        (**self).push(local, updates)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Creates closed sessions for configured remotes.
pub trait RemoteFactory: Send + Sync {
    fn connect(
        &self,
        remote: &Remote,
        direction: Direction,
        cancel: CancelToken,
    ) -> Result<Box<dyn RemoteRepo>>;
}

/// Where a remote URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A repository directory on this machine.
    Local(PathBuf),
    /// A bucket reachable through `object_store`.
    ObjectStore(Url),
}

impl Endpoint {
    pub fn parse(remote: &str, url: &str) -> Result<Self> {
        let unsupported = |reason: String| Error::Transport {
            remote: remote.to_owned(),
            source: TransportError::UnsupportedUrl(reason),
        };
        match Url::parse(url) {
            Ok(parsed) if parsed.scheme() == "file" => parsed
                .to_file_path()
                .map(Endpoint::Local)
                .map_err(|()| unsupported(format!("{url}: not a local path"))),
            Ok(parsed) => match parsed.scheme() {
                "memory" | "s3" | "s3a" | "gs" | "az" | "adl" | "azure" | "abfs" | "abfss"
                | "http" | "https" => Ok(Endpoint::ObjectStore(parsed)),
                scheme => Err(unsupported(format!("{url}: unknown scheme {scheme}"))),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(Endpoint::Local(PathBuf::from(url)))
            }
            Err(e) => Err(unsupported(format!("{url}: {e}"))),
        }
    }
}

/// Opens local directories as repositories and everything else through
/// [`ObjectStoreBackend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRemoteFactory;

impl RemoteFactory for DefaultRemoteFactory {
    fn connect(
        &self,
        remote: &Remote,
        direction: Direction,
        cancel: CancelToken,
    ) -> Result<Box<dyn RemoteRepo>> {
        let name = remote.name.clone();
        let timeout = remote.timeout;
        let session = match Endpoint::parse(&remote.name, remote.url(direction))? {
            Endpoint::Local(path) => StoreRemote::new(name, move || {
                Repository::open_storage(&path).map(|(_, storage)| storage)
            }),
            Endpoint::ObjectStore(url) => StoreRemote::new(name, move || {
                let mut backend = ObjectStoreBackend::with_url(&url)?;
                if let Some(timeout) = timeout {
                    backend = backend.with_timeout(timeout);
                }
                Ok(Storage::new(Arc::new(backend)))
            }),
        };
        let session = match timeout {
            Some(timeout) => session.with_timeout(timeout),
            None => session,
        };
        Ok(Box::new(session.with_cancel(cancel)))
    }
}
