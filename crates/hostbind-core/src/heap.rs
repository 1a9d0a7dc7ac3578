//! Generational arena for full userdata.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::table::TableRef;

/// Handle to a userdata slot.
///
/// The generation is bumped when a slot is freed, so a handle that outlives
/// its object never resolves to whatever reuses the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserdataHandle {
    /// Index into ObjectHeap.slots
    pub index: u32,
    /// Generation for use-after-free detection
    pub generation: u32,
}

impl UserdataHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Storage for userdata payloads and their metatables.
pub struct ObjectHeap {
    slots: Vec<HeapSlot>,
    free_list: Vec<u32>,
    live: usize,
}

struct HeapSlot {
    generation: u32,
    payload: Option<Rc<dyn Any>>,
    metatable: Option<TableRef>,
    marked: bool,
}

impl ObjectHeap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
        }
    }

    /// Allocate a slot for `payload`.
    pub fn allocate(&mut self, payload: Rc<dyn Any>) -> UserdataHandle {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.payload = Some(payload);
            slot.metatable = None;
            slot.marked = false;
            UserdataHandle::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(HeapSlot {
                generation: 0,
                payload: Some(payload),
                metatable: None,
                marked: false,
            });
            UserdataHandle::new(index, 0)
        }
    }

    fn slot(&self, handle: UserdataHandle) -> Option<&HeapSlot> {
        let slot = self.slots.get(handle.index as usize)?;
        (slot.generation == handle.generation && slot.payload.is_some()).then_some(slot)
    }

    fn slot_mut(&mut self, handle: UserdataHandle) -> Option<&mut HeapSlot> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        (slot.generation == handle.generation && slot.payload.is_some()).then_some(slot)
    }

    /// Payload of a live handle. Returns None if the handle is stale.
    pub fn get(&self, handle: UserdataHandle) -> Option<&Rc<dyn Any>> {
        self.slot(handle)?.payload.as_ref()
    }

    /// Typed payload of a live handle.
    pub fn downcast<T: Any>(&self, handle: UserdataHandle) -> Option<Rc<T>> {
        self.get(handle)?.clone().downcast::<T>().ok()
    }

    pub fn contains(&self, handle: UserdataHandle) -> bool {
        self.slot(handle).is_some()
    }

    pub fn metatable(&self, handle: UserdataHandle) -> Option<TableRef> {
        self.slot(handle)?.metatable.clone()
    }

    /// Returns false if the handle is stale.
    pub fn set_metatable(&mut self, handle: UserdataHandle, metatable: Option<TableRef>) -> bool {
        match self.slot_mut(handle) {
            Some(slot) => {
                slot.metatable = metatable;
                true
            }
            None => false,
        }
    }

    /// Free a slot immediately. Returns true if the handle was live.
    pub fn free(&mut self, handle: UserdataHandle) -> bool {
        let Some(slot) = self.slot_mut(handle) else {
            return false;
        };
        slot.payload = None;
        slot.metatable = None;
        slot.marked = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.live -= 1;
        true
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Handles of every live object, in slot order.
    pub fn handles(&self) -> Vec<UserdataHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.payload.is_some())
            .map(|(index, slot)| UserdataHandle::new(index as u32, slot.generation))
            .collect()
    }

    // ========================================================================
    // Mark bits
    // ========================================================================

    pub(crate) fn clear_marks(&mut self) {
        for slot in &mut self.slots {
            slot.marked = false;
        }
    }

    /// Mark a live object. Returns true only the first time.
    pub(crate) fn mark(&mut self, handle: UserdataHandle) -> bool {
        match self.slot_mut(handle) {
            Some(slot) if !slot.marked => {
                slot.marked = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn unmarked(&self) -> Vec<UserdataHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.payload.is_some() && !slot.marked)
            .map(|(index, slot)| UserdataHandle::new(index as u32, slot.generation))
            .collect()
    }
}

impl Default for ObjectHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeap")
            .field("slot_count", &self.slots.len())
            .field("free_count", &self.free_list.len())
            .field("live", &self.live)
            .finish()
    }
}
