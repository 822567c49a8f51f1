//! Per-screen RandR state and the change-notification machinery
//!
//! `Randr` owns every screen and with them every crtc, output, monitor,
//! provider and lease. Objects refer to each other by id only; lookups go
//! through the resource registry to find the owning screen.

use crate::atom::AtomStore;
use crate::crtc::Crtc;
use crate::driver::{RandrDriver, ScreenSize};
use crate::error::{RrError, RrResult};
use crate::event::{Notify, RrEvent};
use crate::lease::Lease;
use crate::mode::{Mode, ModeStore};
use crate::monitor::Monitor;
use crate::output::Output;
use crate::pixmap::PixmapStore;
use crate::provider::Provider;
use crate::resource::{ResourceKind, ResourceRegistry};
use crate::types::{CrtcId, OutputId, Rotation, ScreenId, Timestamp, WindowId};
use bitflags::bitflags;
use std::collections::VecDeque;
use std::rc::Rc;

/// Largest screen the protocol can describe
pub const MAX_SCREEN_SIZE: u16 = 0x7fff;

bitflags! {
    /// Dirty bits, tracked on the primary screen
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScreenChanges: u8 {
        /// Something needs announcing
        const CHANGED = 1 << 0;
        /// Configuration timestamp must advance
        const CONFIG = 1 << 1;
        /// Crtc geometry moved
        const LAYOUT = 1 << 2;
        /// Objects were created or destroyed
        const RESOURCES = 1 << 3;
        const LEASES = 1 << 4;
    }
}

pub struct Screen {
    pub id: ScreenId,
    pub root: WindowId,
    pub root_depth: u8,
    pub width: u16,
    pub height: u16,
    pub mm_width: u32,
    pub mm_height: u32,
    /// Sizes SetScreenSize accepts, as set by the driver
    pub size_range: SizeRange,

    /// GPU screens have no root of their own and scan out a primary's pixmap
    pub is_gpu: bool,
    pub current_primary: Option<ScreenId>,
    pub secondaries: Vec<ScreenId>,
    pub is_output_secondary: bool,
    pub is_offload_secondary: bool,

    pub crtcs: Vec<Crtc>,
    pub outputs: Vec<Output>,
    pub primary_output: Option<OutputId>,
    pub monitors: Vec<Monitor>,
    pub provider: Option<Provider>,
    pub leases: Vec<Lease>,

    /// Some enabled crtc cannot be reached from the others
    pub discontiguous: bool,
    pub changes: ScreenChanges,
    pub last_set_time: Timestamp,
    pub last_config_time: Timestamp,

    pub driver: Box<dyn RandrDriver>,
}

impl Screen {
    pub fn crtc(&self, id: CrtcId) -> Option<&Crtc> {
        self.crtcs.iter().find(|c| c.id == id)
    }

    pub fn crtc_mut(&mut self, id: CrtcId) -> Option<&mut Crtc> {
        self.crtcs.iter_mut().find(|c| c.id == id)
    }

    pub fn output(&self, id: OutputId) -> Option<&Output> {
        self.outputs.iter().find(|o| o.id == id)
    }

    pub fn output_mut(&mut self, id: OutputId) -> Option<&mut Output> {
        self.outputs.iter_mut().find(|o| o.id == id)
    }

    pub fn size(&self) -> ScreenSize {
        ScreenSize {
            width: self.width,
            height: self.height,
            mm_width: self.mm_width,
            mm_height: self.mm_height,
        }
    }
}

/// GetScreenResources reply body
#[derive(Debug, Clone)]
pub struct ScreenResources {
    pub timestamp: Timestamp,
    pub config_timestamp: Timestamp,
    pub crtcs: Vec<CrtcId>,
    pub outputs: Vec<OutputId>,
    pub modes: Vec<Rc<Mode>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    pub min_width: u16,
    pub min_height: u16,
    pub max_width: u16,
    pub max_height: u16,
}

/// All RandR state of one server
pub struct Randr {
    pub atoms: AtomStore,
    pub resources: ResourceRegistry,
    pub modes: ModeStore,
    pub pixmaps: PixmapStore,
    pub(crate) screens: Vec<Screen>,
    events: VecDeque<RrEvent>,
}

impl Randr {
    pub fn new() -> Self {
        Self {
            atoms: AtomStore::new(),
            resources: ResourceRegistry::new(),
            modes: ModeStore::new(),
            pixmaps: PixmapStore::new(),
            screens: Vec::new(),
            events: VecDeque::new(),
        }
    }

    /// Register a screen with its root window
    pub fn add_screen(&mut self, size: ScreenSize, is_gpu: bool, driver: Box<dyn RandrDriver>) -> RrResult<ScreenId> {
        let id = ScreenId(self.screens.len());
        let root = WindowId(self.resources.alloc(ResourceKind::Window, Some(id))?);
        self.screens.push(Screen {
            id,
            root,
            root_depth: 24,
            width: size.width,
            height: size.height,
            mm_width: size.mm_width,
            mm_height: size.mm_height,
            size_range: SizeRange {
                min_width: size.width,
                min_height: size.height,
                max_width: size.width,
                max_height: size.height,
            },
            is_gpu,
            current_primary: None,
            secondaries: Vec::new(),
            is_output_secondary: false,
            is_offload_secondary: false,
            crtcs: Vec::new(),
            outputs: Vec::new(),
            primary_output: None,
            monitors: Vec::new(),
            provider: None,
            leases: Vec::new(),
            discontiguous: false,
            changes: ScreenChanges::empty(),
            last_set_time: Timestamp::now(),
            last_config_time: Timestamp::now(),
            driver,
        });
        log::debug!("screen {} root {:#x} {}x{} gpu={}", id.0, root.0, size.width, size.height, is_gpu);
        Ok(id)
    }

    /// Hang a GPU screen off a primary. Links are made by the provider
    /// requests, or by `auto_config_gpu_screen`.
    pub fn attach_gpu_screen(&mut self, secondary: ScreenId, primary: ScreenId) -> RrResult<()> {
        if !self.screen(secondary).is_gpu || self.screen(primary).is_gpu {
            return Err(RrError::Match(secondary.0 as u32));
        }
        self.screen_mut(secondary).current_primary = Some(primary);
        let list = &mut self.screen_mut(primary).secondaries;
        if !list.contains(&secondary) {
            list.push(secondary);
        }
        Ok(())
    }

    pub fn screen(&self, id: ScreenId) -> &Screen {
        &self.screens[id.0]
    }

    pub fn screen_mut(&mut self, id: ScreenId) -> &mut Screen {
        &mut self.screens[id.0]
    }

    pub fn screens(&self) -> &[Screen] {
        &self.screens
    }

    pub fn screen_for_window(&self, window: WindowId) -> RrResult<ScreenId> {
        self.resources
            .lookup(window.0, ResourceKind::Window)?
            .ok_or(RrError::Window(window.0))
    }

    /// Screen whose root carries events for `id`; GPU screens without a
    /// primary have none
    pub fn primary_of(&self, id: ScreenId) -> Option<ScreenId> {
        let screen = self.screen(id);
        if screen.is_gpu {
            screen.current_primary
        } else {
            Some(id)
        }
    }

    pub fn output_secondaries(&self, id: ScreenId) -> Vec<ScreenId> {
        self.screen(id)
            .secondaries
            .iter()
            .copied()
            .filter(|&s| self.screen(s).is_output_secondary)
            .collect()
    }

    /// The screen followed by its output secondaries
    pub fn with_output_secondaries(&self, id: ScreenId) -> Vec<ScreenId> {
        let mut all = vec![id];
        all.extend(self.output_secondaries(id));
        all
    }

    pub(crate) fn push_event(&mut self, screen: ScreenId, notify: Notify) {
        log::trace!("event {:?} on screen {}", notify.mask(), screen.0);
        self.events.push_back(RrEvent { screen, notify });
    }

    /// Drain events raised since the last call
    pub fn take_events(&mut self) -> Vec<RrEvent> {
        self.events.drain(..).collect()
    }

    /// Mark something on `id` as needing announcement
    pub fn set_changed(&mut self, id: ScreenId, extra: ScreenChanges) {
        self.screen_mut(id).changes |= extra;
        if let Some(primary) = self.primary_of(id) {
            self.screen_mut(primary).changes |= extra | ScreenChanges::CHANGED;
        }
    }

    /// Announce pending changes on the primary of `id` and its output
    /// secondaries, then clear the dirty state
    pub fn tell_changed(&mut self, id: ScreenId) {
        let Some(primary) = self.primary_of(id) else {
            return;
        };
        let secondaries = self.output_secondaries(primary);
        for &s in &secondaries {
            let time = self.screen(s).last_set_time;
            let p = self.screen_mut(primary);
            if p.last_set_time < time {
                p.last_set_time = time;
            }
        }

        if !self.screen(primary).changes.contains(ScreenChanges::CHANGED) {
            return;
        }
        {
            let p = self.screen_mut(primary);
            if p.changes.contains(ScreenChanges::CONFIG) {
                p.last_config_time = Timestamp::now();
            }
            p.changes.remove(ScreenChanges::CHANGED | ScreenChanges::CONFIG);
        }
        self.screen_mut(id).changes.remove(ScreenChanges::CHANGED);

        self.announce(primary, &secondaries);

        let layout = self.screen(primary).changes.contains(ScreenChanges::LAYOUT);
        let p = self.screen_mut(primary);
        p.changes.remove(ScreenChanges::RESOURCES | ScreenChanges::LAYOUT);
        for crtc in &mut p.crtcs {
            crtc.changed = false;
        }
        for output in &mut p.outputs {
            output.changed = false;
        }
        if let Some(provider) = p.provider.as_mut() {
            provider.changed = false;
        }
        let all_secondaries = self.screen(primary).secondaries.clone();
        for s in all_secondaries {
            let screen = self.screen_mut(s);
            if let Some(provider) = screen.provider.as_mut() {
                provider.changed = false;
            }
            if screen.is_output_secondary {
                for crtc in &mut screen.crtcs {
                    crtc.changed = false;
                }
                for output in &mut screen.outputs {
                    output.changed = false;
                }
            }
        }
        if layout {
            self.screen_mut(id).changes.remove(ScreenChanges::LAYOUT);
            log::debug!("screen {} layout changed", primary.0);
        }
    }

    fn announce(&mut self, primary: ScreenId, secondaries: &[ScreenId]) {
        let mut all = vec![primary];
        all.extend_from_slice(secondaries);

        let p = self.screen(primary);
        let timestamp = p.last_set_time;
        let config_timestamp = p.last_config_time;
        let rotation = p.crtcs.first().map(|c| c.rotation).unwrap_or(Rotation::ROTATE_0);
        let (width, height, mm_width, mm_height) = if rotation.swaps_axes() {
            (p.height, p.width, p.mm_height, p.mm_width)
        } else {
            (p.width, p.height, p.mm_width, p.mm_height)
        };
        let screen_event = Notify::Screen {
            rotation,
            timestamp,
            config_timestamp,
            root: p.root.0,
            width,
            height,
            mm_width: mm_width as u16,
            mm_height: mm_height as u16,
        };

        let mut queued = vec![screen_event];
        for &s in &all {
            for crtc in self.screen(s).crtcs.iter().filter(|c| c.changed) {
                queued.push(crtc.change_notify(timestamp));
            }
        }
        for &s in &all {
            let screen = self.screen(s);
            for output in screen.outputs.iter().filter(|o| o.changed) {
                let crtc = output.crtc.and_then(|c| screen.crtc(c));
                queued.push(output.change_notify(crtc, timestamp, config_timestamp));
            }
        }
        let mut providers = vec![primary];
        providers.extend(self.screen(primary).secondaries.iter().copied());
        for s in providers {
            if let Some(provider) = self.screen(s).provider.as_ref().filter(|p| p.changed) {
                queued.push(Notify::Provider {
                    timestamp,
                    provider: provider.id,
                });
            }
        }
        let p = self.screen(primary);
        if p.changes.contains(ScreenChanges::RESOURCES) {
            queued.push(Notify::Resource { timestamp });
        }
        if p.changes.contains(ScreenChanges::LEASES) {
            queued.extend(p.leases.iter().filter_map(|lease| lease.notify(timestamp)));
        }

        for notify in queued {
            self.push_event(primary, notify);
        }
    }

    /// Record a new screen size reported by the driver
    pub fn screen_size_notify(&mut self, id: ScreenId, size: &ScreenSize) {
        let screen = self.screen_mut(id);
        if screen.size() == *size {
            return;
        }
        screen.width = size.width;
        screen.height = size.height;
        screen.mm_width = size.mm_width;
        screen.mm_height = size.mm_height;
        log::debug!("screen {} now {}x{}", id.0, size.width, size.height);
        self.set_changed(id, ScreenChanges::empty());
        self.tell_changed(id);
    }

    pub fn screen_size_range(&self, id: ScreenId) -> SizeRange {
        self.screen(id).size_range
    }

    /// Driver-side limits for SetScreenSize. Until a driver sets them the
    /// screen is fixed at its initial size.
    pub fn set_screen_size_range(&mut self, id: ScreenId, range: SizeRange) -> RrResult<()> {
        if range.min_width > range.max_width || range.max_width > MAX_SCREEN_SIZE {
            return Err(RrError::Value(range.max_width as u32));
        }
        if range.min_height > range.max_height || range.max_height > MAX_SCREEN_SIZE {
            return Err(RrError::Value(range.max_height as u32));
        }
        let screen = self.screen_mut(id);
        if screen.size_range != range {
            screen.size_range = range;
            self.set_changed(id, ScreenChanges::CONFIG);
        }
        Ok(())
    }

    /// SetScreenSize: the size must be in range and every enabled crtc
    /// must still fit
    pub fn set_screen_size(&mut self, id: ScreenId, size: &ScreenSize) -> RrResult<()> {
        let range = self.screen(id).size_range;
        if size.width < range.min_width || size.width > range.max_width {
            return Err(RrError::Value(size.width as u32));
        }
        if size.height < range.min_height || size.height > range.max_height {
            return Err(RrError::Value(size.height as u32));
        }
        if size.mm_width == 0 || size.mm_height == 0 {
            return Err(RrError::Value(0));
        }
        for crtc in &self.screen(id).crtcs {
            if crtc.mode.is_none() {
                continue;
            }
            let (w, h) = crtc.scanout_size();
            if crtc.x + w > size.width as i32 || crtc.y + h > size.height as i32 {
                return Err(RrError::Match(crtc.id.0));
            }
        }
        match self.screen_mut(id).driver.screen_set_size(size) {
            Ok(()) => {}
            Err(err) => {
                log::warn!("screen {} resize refused: {}", id.0, err);
                return Err(RrError::Match(0));
            }
        }
        self.screen_size_notify(id, size);
        Ok(())
    }

    /// Crtcs, outputs and modes visible from `id`, including output
    /// secondaries. The primary output's crtc is listed first.
    pub fn screen_resources(&self, id: ScreenId) -> ScreenResources {
        let screen = self.screen(id);
        let all = self.with_output_secondaries(id);

        let primary_crtc = screen
            .primary_output
            .and_then(|o| self.output(o).ok())
            .and_then(|o| o.crtc);

        let mut crtcs: Vec<CrtcId> = primary_crtc.into_iter().collect();
        let mut outputs = Vec::new();
        let mut modes: Vec<Rc<Mode>> = Vec::new();
        for &s in &all {
            let screen = self.screen(s);
            crtcs.extend(screen.crtcs.iter().map(|c| c.id).filter(|&c| Some(c) != primary_crtc));
            outputs.extend(screen.outputs.iter().map(|o| o.id));
            for mode in self.modes_for_screen(s) {
                if !modes.iter().any(|m| Rc::ptr_eq(m, &mode)) {
                    modes.push(mode);
                }
            }
        }

        ScreenResources {
            timestamp: screen.last_set_time,
            config_timestamp: screen.last_config_time,
            crtcs,
            outputs,
            modes,
        }
    }

    /// Distinct modes of the screen's outputs, then any crtc modes not
    /// already listed
    pub fn modes_for_screen(&self, id: ScreenId) -> Vec<Rc<Mode>> {
        let screen = self.screen(id);
        let mut modes: Vec<Rc<Mode>> = Vec::new();
        let candidates = screen
            .outputs
            .iter()
            .filter(|o| !self.output_is_leased(o.id))
            .flat_map(|o| o.modes.iter())
            .chain(screen.crtcs.iter().filter_map(|c| c.mode.as_ref()));
        for mode in candidates {
            if !modes.iter().any(|m| Rc::ptr_eq(m, mode)) {
                modes.push(Rc::clone(mode));
            }
        }
        modes
    }
}

impl Default for Randr {
    fn default() -> Self {
        Self::new()
    }
}
