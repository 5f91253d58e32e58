//! Object transfer between two stores.
//!
//! Objects are written children first. A store filled this way never holds
//! an object whose closure is incomplete, so the walk may stop at any object
//! the destination already has.

use std::collections::HashMap;
use std::collections::HashSet;

use crate::error::Error;
use crate::error::Result;
use crate::id::ObjectId;
use crate::object::RawObject;
use crate::store::ObjectStore;

/// Objects reachable from `roots` in `src` that `dst` lacks, in post-order.
pub(crate) fn missing_closure(
    src: &dyn ObjectStore,
    dst: &dyn ObjectStore,
    roots: &[ObjectId],
) -> Result<Vec<RawObject>> {
    let mut stack: Vec<(ObjectId, bool)> = roots.iter().rev().map(|id| (*id, false)).collect();
    let mut visited = HashSet::new();
    let mut loaded: HashMap<ObjectId, RawObject> = HashMap::new();
    let mut order = Vec::new();

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            if let Some(raw) = loaded.remove(&id) {
                order.push(raw);
            }
            continue;
        }
        if !visited.insert(id) || dst.exists(&id)? {
            continue;
        }
        let raw = src.get(&id)?;
        if raw.id() != id {
            return Err(Error::Corrupt(id));
        }
        stack.push((id, true));
        for child in raw.decode()?.children().into_iter().rev() {
            if !visited.contains(&child) {
                stack.push((child, false));
            }
        }
        loaded.insert(id, raw);
    }
    Ok(order)
}

/// Writes `objects` in order, calling `checkpoint` before each one.
/// Returns the number written.
pub(crate) fn copy_objects(
    dst: &dyn ObjectStore,
    objects: Vec<RawObject>,
    mut checkpoint: impl FnMut() -> Result<()>,
) -> Result<usize> {
    let mut count = 0;
    for raw in objects {
        checkpoint()?;
        let id = dst.put(&raw)?;
        tracing::debug!(object = %id.short(), kind = %raw.kind, "transferred object");
        count += 1;
    }
    Ok(count)
}
