//! Fixed-size atomic slots behind the named control points
//!
//! Each slot holds a published value (written by the audio thread, read by
//! anyone) and a request (written by the control thread, consumed by the
//! audio thread at the next buffer start). A request is a value plus a
//! pending flag: the value is stored first and the flag raised with
//! `Release`, so the audio thread's `Acquire` swap always sees the latest
//! value. Several writes in one buffer collapse into the last one.

use std::sync::atomic::{AtomicBool, Ordering};

use super::{ControlError, ControlKey, CONTROL_SLOT_COUNT};
use crate::types::AtomicF64;

#[derive(Debug, Default)]
struct ControlSlot {
    value: AtomicF64,
    request: AtomicF64,
    pending: AtomicBool,
}

/// Registry of every control point, created with the engine
///
/// Shared by `Arc` between the audio thread, the engine controller and any
/// number of readers (UI, controller feedback). Slots are allocated once at
/// construction; nothing here allocates or locks afterwards.
#[derive(Debug)]
pub struct ControlRegistry {
    slots: Box<[ControlSlot]>,
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlRegistry {
    pub fn new() -> Self {
        let slots = (0..CONTROL_SLOT_COUNT)
            .map(|_| ControlSlot::default())
            .collect();
        Self { slots }
    }

    #[inline]
    fn slot(&self, key: ControlKey) -> &ControlSlot {
        &self.slots[key.slot()]
    }

    /// Last value published by the engine
    #[inline]
    pub fn get(&self, key: ControlKey) -> f64 {
        self.slot(key).value.load(Ordering::Relaxed)
    }

    /// Look up a control by name and read it
    pub fn get_by_name(&self, name: &str) -> Result<f64, ControlError> {
        Ok(self.get(ControlKey::parse(name)?))
    }

    /// Stage a write for the next buffer (control thread)
    pub(crate) fn request(&self, key: ControlKey, value: f64) {
        let slot = self.slot(key);
        slot.request.store(value, Ordering::Relaxed);
        slot.pending.store(true, Ordering::Release);
    }

    /// Whether a write is waiting for the audio thread
    pub fn is_pending(&self, key: ControlKey) -> bool {
        self.slot(key).pending.load(Ordering::Relaxed)
    }

    /// Consume a staged write (audio thread)
    #[inline]
    pub fn take_request(&self, key: ControlKey) -> Option<f64> {
        let slot = self.slot(key);
        if !slot.pending.load(Ordering::Relaxed) {
            return None;
        }
        if slot.pending.swap(false, Ordering::Acquire) {
            Some(slot.request.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Publish a mirror value (audio thread)
    #[inline]
    pub fn publish(&self, key: ControlKey, value: f64) {
        self.slot(key).value.store(value, Ordering::Relaxed);
    }

    /// Publish a boolean mirror as 0.0 / 1.0
    #[inline]
    pub fn publish_bool(&self, key: ControlKey, value: bool) {
        self.publish(key, if value { 1.0 } else { 0.0 });
    }

    /// Snapshot of every control and its published value
    pub fn snapshot(&self) -> Vec<(ControlKey, f64)> {
        ControlKey::all().map(|key| (key, self.get(key))).collect()
    }
}
