use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;

use crate::error::Error;
use crate::error::Result;
use crate::id::ObjectId;
use crate::object::RawObject;
use crate::refs::Ref;
use crate::store::ObjectStore;
use crate::store::RefStore;

/// In-memory implementation of [`ObjectStore`] and [`RefStore`].
///
/// Useful for unit tests, remote-side fixtures and throwaway repositories
/// where persistence is not required.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectId, RawObject>>,
    refs: RwLock<BTreeMap<String, ObjectId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, object: &RawObject) -> Result<ObjectId> {
        let id = object.id();
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| object.clone());
        Ok(id)
    }

    fn get(&self, id: &ObjectId) -> Result<RawObject> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or(Error::NotFound(*id))
    }

    fn exists(&self, id: &ObjectId) -> Result<bool> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id))
    }

    fn ids(&self) -> Result<std::vec::IntoIter<ObjectId>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.keys().copied().collect::<Vec<_>>().into_iter())
    }
}

impl RefStore for MemoryStore {
    fn head(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self
            .refs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied())
    }

    fn update(&self, name: &str, expected: Option<ObjectId>, new: ObjectId) -> Result<()> {
        let mut refs = self.refs.write().unwrap_or_else(PoisonError::into_inner);
        let current = refs.get(name).copied();
        if current != expected {
            return Err(Error::CompareAndSwapFailed {
                name: name.to_owned(),
                expected,
                actual: current,
            });
        }
        refs.insert(name.to_owned(), new);
        Ok(())
    }

    fn delete(&self, name: &str, expected: ObjectId) -> Result<()> {
        let mut refs = self.refs.write().unwrap_or_else(PoisonError::into_inner);
        match refs.get(name).copied() {
            None => return Err(Error::RefNotFound(name.to_owned())),
            Some(current) if current != expected => {
                return Err(Error::CompareAndSwapFailed {
                    name: name.to_owned(),
                    expected: Some(expected),
                    actual: Some(current),
                })
            }
            Some(_) => {}
        }
        refs.remove(name);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<std::vec::IntoIter<Ref>> {
        let refs = self.refs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(refs
            .range(prefix.to_owned()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, target)| Ref::new(name.clone(), *target))
            .collect::<Vec<_>>()
            .into_iter())
    }
}
