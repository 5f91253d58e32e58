#![doc = include_str!("../README.md")]

pub mod config;
pub mod describe;
pub mod error;
pub mod graph;
pub mod id;
pub mod object;
pub mod refs;
pub mod remote;
pub mod repository;
pub mod scheduler;
pub mod store;
pub mod sync;

pub use error::Error;
pub use error::Result;
pub use id::ObjectId;
pub use object::Object;
pub use refs::Ref;
pub use repository::Repository;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::config::RemoteConfig;
    pub use crate::error::Error;
    pub use crate::error::Result;
    pub use crate::id::ObjectId;
    pub use crate::object::Commit;
    pub use crate::object::Object;
    pub use crate::object::ObjectKind;
    pub use crate::object::Tree;
    pub use crate::refs::Ref;
    pub use crate::remote::Remote;
    pub use crate::repository::Repository;
    pub use crate::scheduler::AutoSync;
    pub use crate::store::ObjectStore;
    pub use crate::store::RefStore;
    pub use crate::sync::Coordinator;
    pub use crate::sync::FetchOptions;
    pub use crate::sync::ListOptions;
    pub use crate::sync::PushSpec;
}
