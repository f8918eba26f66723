//! Shared buffers of one merge task.
//!
//! Work items of the same merge share derived data (the reclaim map, folded
//! patch streams) through a generational arena. A [`ResourceId`] is an index
//! plus a generation, so an id whose slot was released and reused resolves
//! to nothing instead of to someone else's buffer. Dropping the manager
//! frees every remaining entry.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, TesseraError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId {
    index: u32,
    generation: u32,
}

type Payload = Arc<dyn Any + Send + Sync>;

struct Slot {
    generation: u32,
    entry: Option<(Payload, u64)>,
}

/// Generational arena of typed shared buffers.
#[derive(Default)]
pub struct MergeTaskResourceManager {
    slots: RwLock<Vec<Slot>>,
}

impl std::fmt::Debug for MergeTaskResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeTaskResourceManager")
            .field("live", &self.len())
            .field("bytes", &self.total_bytes())
            .finish()
    }
}

impl MergeTaskResourceManager {
    pub fn new() -> Self {
        MergeTaskResourceManager::default()
    }

    /// Store `value`, accounted as `bytes` of memory.
    pub fn declare<T: Any + Send + Sync>(&self, value: T, bytes: u64) -> ResourceId {
        let mut slots = self.slots.write();
        let payload: Payload = Arc::new(value);
        if let Some((index, slot)) = slots.iter_mut().enumerate().find(|(_, s)| s.entry.is_none()) {
            slot.generation = slot.generation.wrapping_add(1);
            slot.entry = Some((payload, bytes));
            return ResourceId {
                index: index as u32,
                generation: slot.generation,
            };
        }
        slots.push(Slot {
            generation: 0,
            entry: Some((payload, bytes)),
        });
        ResourceId {
            index: (slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// The buffer behind `id`, if it is still live and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, id: ResourceId) -> Option<Arc<T>> {
        let slots = self.slots.read();
        let slot = slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let (payload, _) = slot.entry.as_ref()?;
        Arc::clone(payload).downcast::<T>().ok()
    }

    /// Like [`Self::get`] but fails with `Internal`.
    pub fn require<T: Any + Send + Sync>(&self, id: ResourceId) -> Result<Arc<T>> {
        self.get(id).ok_or_else(|| {
            TesseraError::internal(format!("merge resource {id:?} is not available"))
        })
    }

    /// Free `id`. Returns whether it was live.
    pub fn release(&self, id: ResourceId) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.entry.is_some() => {
                slot.entry = None;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.slots
            .read()
            .iter()
            .filter_map(|s| s.entry.as_ref().map(|(_, bytes)| *bytes))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_get_release() {
        let manager = MergeTaskResourceManager::new();
        let a = manager.declare(vec![1u32, 2, 3], 12);
        let b = manager.declare(String::from("buffer"), 6);

        assert_eq!(*manager.get::<Vec<u32>>(a).unwrap(), vec![1, 2, 3]);
        assert!(manager.get::<String>(a).is_none());
        assert_eq!(manager.total_bytes(), 18);

        assert!(manager.release(a));
        assert!(!manager.release(a));
        assert!(manager.get::<Vec<u32>>(a).is_none());

        let c = manager.declare(7u64, 8);
        assert_ne!(a, c);
        assert!(manager.get::<Vec<u32>>(a).is_none());
        assert_eq!(*manager.get::<u64>(c).unwrap(), 7);
        assert_eq!(*manager.require::<String>(b).unwrap(), "buffer");
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_outstanding_handles_survive_release() {
        let manager = MergeTaskResourceManager::new();
        let id = manager.declare(vec![0u8; 4], 4);
        let held = manager.get::<Vec<u8>>(id).unwrap();
        manager.release(id);
        assert_eq!(held.len(), 4);
        assert!(manager.is_empty());
    }
}
