//! Request Table (RT): fixed-size array of Request Slots for one tunnel.

use crate::slot::RequestSlot;

pub struct RequestTable {
    slots: Vec<RequestSlot>,
}

impl RequestTable {
    pub fn new(cap: usize) -> Self {
        let slots = (0..cap).map(|i| RequestSlot::new(i as u16)).collect();
        Self { slots }
    }

    pub fn cap(&self) -> usize {
        self.slots.len()
    }

    fn in_range(&self, idx: u16) -> bool {
        (idx as usize) < self.slots.len()
    }

    /// Returns the freshly-allocated slot, or `None` if `idx` is out of
    /// range or already in use. Existing slot state is left untouched on
    /// failure.
    pub fn alloc(&mut self, idx: u16, tag: u16) -> Option<&mut RequestSlot> {
        if !self.in_range(idx) {
            return None;
        }
        let slot = &mut self.slots[idx as usize];
        if slot.in_use {
            return None;
        }
        slot.in_use = true;
        slot.tag = tag;
        Some(slot)
    }

    /// Returns the slot iff range-valid, in use, and the generation tag
    /// matches; otherwise `None` (stale/closed/misaddressed frames are
    /// silently dropped by the caller).
    pub fn get(&mut self, idx: u16, tag: u16) -> Option<&mut RequestSlot> {
        if !self.in_range(idx) {
            return None;
        }
        let slot = &mut self.slots[idx as usize];
        if slot.in_use && slot.tag == tag {
            Some(slot)
        } else {
            None
        }
    }

    /// Bumps the generation tag (wrapping) and frees the slot's egress
    /// socket. Out-of-range, not-in-use or mismatched-tag requests are
    /// silently ignored.
    pub fn free(&mut self, idx: u16, tag: u16) {
        if !self.in_range(idx) {
            return;
        }
        let slot = &mut self.slots[idx as usize];
        if slot.in_use && slot.tag == tag {
            slot.in_use = false;
            slot.tag = slot.tag.wrapping_add(1);
            slot.free();
        }
    }

    /// Frees every in-use slot. Called exactly once when a tunnel closes.
    pub fn cleanup(&mut self) {
        for slot in &mut self.slots {
            if slot.in_use {
                slot.in_use = false;
                slot.tag = slot.tag.wrapping_add(1);
                slot.free();
            }
        }
    }
}
