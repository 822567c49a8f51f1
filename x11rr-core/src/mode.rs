//! Display modes, shared between outputs and crtcs
//!
//! A mode lives as long as something holds an `Rc` to it. The store keeps
//! weak references so ids can be resolved and released.

use crate::error::{RrError, RrResult};
use crate::resource::{ResourceKind, ResourceRegistry};
use crate::types::ModeId;
use std::rc::{Rc, Weak};

/// Timings as carried in `ModeInfo` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeInfo {
    pub width: u16,
    pub height: u16,
    pub dot_clock: u32,
    pub h_sync_start: u16,
    pub h_sync_end: u16,
    pub h_total: u16,
    pub h_skew: u16,
    pub v_sync_start: u16,
    pub v_sync_end: u16,
    pub v_total: u16,
    pub flags: u32,
}

impl ModeInfo {
    /// Mode with plausible CVT-ish blanking at 60Hz
    pub fn simple(width: u16, height: u16) -> Self {
        let h_total = width.saturating_add(160);
        let v_total = height.saturating_add(30);
        Self {
            width,
            height,
            dot_clock: h_total as u32 * v_total as u32 * 60,
            h_sync_start: width.saturating_add(48),
            h_sync_end: width.saturating_add(80),
            h_total,
            h_skew: 0,
            v_sync_start: height.saturating_add(3),
            v_sync_end: height.saturating_add(8),
            v_total,
            flags: 0,
        }
    }

    /// Vertical refresh in Hz, rounded
    pub fn refresh(&self) -> u16 {
        let dots = self.h_total as u64 * self.v_total as u64;
        if dots == 0 {
            return 0;
        }
        ((self.dot_clock as u64 + dots / 2) / dots).min(0xffff) as u16
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Mode {
    pub id: ModeId,
    pub name: String,
    pub info: ModeInfo,
}

impl Mode {
    pub fn width(&self) -> i32 {
        self.info.width as i32
    }

    pub fn height(&self) -> i32 {
        self.info.height as i32
    }
}

#[derive(Default)]
pub struct ModeStore {
    modes: Vec<(ModeId, Weak<Mode>)>,
}

impl ModeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a live mode with the same name and timings, or register a new one
    pub fn get(
        &mut self,
        registry: &mut ResourceRegistry,
        name: &str,
        info: ModeInfo,
    ) -> RrResult<Rc<Mode>> {
        if let Some(mode) = self
            .modes
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .find(|m| m.name == name && m.info == info)
        {
            return Ok(mode);
        }
        let id = ModeId(registry.alloc(ResourceKind::Mode, None)?);
        let mode = Rc::new(Mode {
            id,
            name: name.to_string(),
            info,
        });
        self.modes.push((id, Rc::downgrade(&mode)));
        log::debug!("mode {:#x} {} {}x{}", id.0, name, info.width, info.height);
        Ok(mode)
    }

    pub fn lookup(&self, id: ModeId) -> RrResult<Rc<Mode>> {
        self.modes
            .iter()
            .find(|(mode_id, _)| *mode_id == id)
            .and_then(|(_, weak)| weak.upgrade())
            .ok_or(RrError::Mode(id.0))
    }

    /// Forget modes nobody holds any more, freeing their ids
    pub fn release_unused(&mut self, registry: &mut ResourceRegistry) {
        self.modes.retain(|(id, weak)| {
            let live = weak.strong_count() > 0;
            if !live {
                registry.free(id.0);
            }
            live
        });
    }

    /// All live modes, oldest first
    pub fn live(&self) -> Vec<Rc<Mode>> {
        self.modes.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    pub fn len(&self) -> usize {
        self.modes.iter().filter(|(_, w)| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_rounds_to_nearest_hz() {
        let mut info = ModeInfo::simple(1920, 1080);
        assert_eq!(info.refresh(), 60);
        info.dot_clock = 148_500_000;
        info.h_total = 2200;
        info.v_total = 1125;
        assert_eq!(info.refresh(), 60);
        info.h_total = 0;
        assert_eq!(info.refresh(), 0);
    }

    #[test]
    fn test_equal_modes_are_shared_and_released() {
        let mut registry = ResourceRegistry::new();
        let mut store = ModeStore::new();
        let a = store.get(&mut registry, "1920x1080", ModeInfo::simple(1920, 1080)).unwrap();
        let b = store.get(&mut registry, "1920x1080", ModeInfo::simple(1920, 1080)).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(Rc::strong_count(&a), 2);

        let id = a.id;
        drop(a);
        drop(b);
        store.release_unused(&mut registry);
        assert!(store.is_empty());
        assert_eq!(store.lookup(id), Err(RrError::Mode(id.0)));
        assert!(!registry.contains(id.0));
    }
}
