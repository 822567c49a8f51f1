//! Display pipelines: configuration, transforms, gamma, contiguity and
//! scanout sharing with GPU screens

use crate::atom::{PRIME_SYNC, XA_INTEGER};
use crate::driver::{self, CrtcRequest, DriverError, Hook, Panning, RandrDriver, ScreenSize};
use crate::error::{RrError, RrResult};
use crate::event::Notify;
use crate::mode::Mode;
use crate::property::{PropMode, PropertyOwner};
use crate::resource::ResourceKind;
use crate::screen::{Randr, ScreenChanges};
use crate::transform::{transform_bounds, ClientTransform, DeviceTransform, FixedMatrix};
use crate::types::{Bounds, CrtcId, ModeId, OutputId, PixmapId, Rotation, ScreenId, Timestamp};
use std::rc::Rc;

/// Three parallel ramps of equal length
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GammaRamp {
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

impl GammaRamp {
    /// Linear ramp of `size` entries
    pub fn linear(size: usize) -> Self {
        let step = |i: usize| {
            if size > 1 {
                (i * 0xffff / (size - 1)) as u16
            } else {
                0xffff
            }
        };
        let ramp: Vec<u16> = (0..size).map(step).collect();
        Self {
            red: ramp.clone(),
            green: ramp.clone(),
            blue: ramp,
        }
    }

    pub fn size(&self) -> usize {
        self.red.len()
    }

    fn is_consistent(&self) -> bool {
        self.green.len() == self.red.len() && self.blue.len() == self.red.len()
    }
}

#[derive(Debug)]
pub struct Crtc {
    pub id: CrtcId,
    pub screen: ScreenId,
    pub mode: Option<Rc<Mode>>,
    pub x: i32,
    pub y: i32,
    pub rotation: Rotation,
    /// Rotations and reflections the hardware can do
    pub rotations: Rotation,
    pub outputs: Vec<OutputId>,
    /// Accepts client transforms at all
    pub transforms: bool,
    pub pending_transform: ClientTransform,
    pub current_transform: ClientTransform,
    pub device: DeviceTransform,
    pub gamma: GammaRamp,
    pub scanout_pixmap: Option<PixmapId>,
    pub scanout_pixmap_back: Option<PixmapId>,
    pub changed: bool,
}

impl Crtc {
    fn new(id: CrtcId, screen: ScreenId) -> Self {
        Self {
            id,
            screen,
            mode: None,
            x: 0,
            y: 0,
            rotation: Rotation::ROTATE_0,
            rotations: Rotation::ROTATE_0,
            outputs: Vec::new(),
            transforms: false,
            pending_transform: ClientTransform::identity(),
            current_transform: ClientTransform::identity(),
            device: DeviceTransform::default(),
            gamma: GammaRamp::default(),
            scanout_pixmap: None,
            scanout_pixmap_back: None,
            changed: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode.is_some()
    }

    /// Size of the framebuffer region scanned out
    pub fn scanout_size(&self) -> (i32, i32) {
        match &self.mode {
            Some(mode) => scanout_size(mode, &self.device),
            None => (0, 0),
        }
    }

    pub fn has_pending_transform(&self) -> bool {
        self.pending_transform != self.current_transform
    }

    /// Box covered on the screen, quarter turns swapping the axes
    pub fn rotated_box(&self) -> Option<Bounds> {
        let mode = self.mode.as_ref()?;
        Some(rotated_box(self.x, self.y, mode.width(), mode.height(), self.rotation))
    }

    pub(crate) fn change_notify(&self, timestamp: Timestamp) -> Notify {
        let mode = self.mode.as_ref();
        Notify::Crtc {
            timestamp,
            crtc: self.id,
            mode: mode.map(|m| m.id),
            rotation: self.rotation,
            x: mode.map(|_| self.x as i16).unwrap_or(0),
            y: mode.map(|_| self.y as i16).unwrap_or(0),
            width: mode.map(|m| m.info.width).unwrap_or(0),
            height: mode.map(|m| m.info.height).unwrap_or(0),
        }
    }
}

fn rotated_box(x: i32, y: i32, width: i32, height: i32, rotation: Rotation) -> Bounds {
    if rotation.swaps_axes() {
        Bounds::from_size(x, y, height, width)
    } else {
        Bounds::from_size(x, y, width, height)
    }
}

fn scanout_size(mode: &Mode, device: &DeviceTransform) -> (i32, i32) {
    let area = Bounds::from_size(0, 0, mode.width(), mode.height());
    let b = transform_bounds(&device.forward, &area);
    (b.width(), b.height())
}

/// Pointer area of a crtc in screen space; disabled crtcs have none
fn cursor_bounds(crtc: &Crtc, driver: &dyn RandrDriver) -> Option<Bounds> {
    let mode = crtc.mode.as_ref()?;
    let mut area = driver.get_panning(crtc.id).map(|p| p.tracking).unwrap_or_default();
    if area.is_empty() {
        area = Bounds::from_size(0, 0, mode.width(), mode.height());
    }
    Some(transform_bounds(&crtc.device.forward, &area))
}

/// SetCrtcConfig reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigStatus {
    Success = 0,
    InvalidConfigTime = 1,
    InvalidTime = 2,
    Failed = 3,
}

/// A SetCrtcConfig request
#[derive(Debug, Clone, Copy)]
pub struct CrtcConfig<'a> {
    pub crtc: CrtcId,
    pub timestamp: Timestamp,
    pub mode: Option<ModeId>,
    pub x: i16,
    pub y: i16,
    pub rotation: u16,
    pub outputs: &'a [OutputId],
}

/// GetCrtcInfo reply body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcInfo {
    pub timestamp: Timestamp,
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub mode: Option<ModeId>,
    pub rotation: Rotation,
    pub rotations: Rotation,
    pub outputs: Vec<OutputId>,
    pub possible: Vec<OutputId>,
}

#[derive(Debug, Clone)]
pub struct CrtcTransformInfo {
    pub has_transforms: bool,
    pub pending: ClientTransform,
    pub current: ClientTransform,
}

impl Randr {
    pub(crate) fn find_crtc(&self, id: CrtcId) -> RrResult<(ScreenId, usize)> {
        let screen = self
            .resources
            .lookup(id.0, ResourceKind::Crtc)?
            .ok_or(RrError::Crtc(id.0))?;
        let index = self
            .screen(screen)
            .crtcs
            .iter()
            .position(|c| c.id == id)
            .ok_or(RrError::Crtc(id.0))?;
        Ok((screen, index))
    }

    pub fn crtc(&self, id: CrtcId) -> RrResult<&Crtc> {
        let (screen, index) = self.find_crtc(id)?;
        Ok(&self.screen(screen).crtcs[index])
    }

    pub fn crtc_mut(&mut self, id: CrtcId) -> RrResult<&mut Crtc> {
        let (screen, index) = self.find_crtc(id)?;
        Ok(&mut self.screen_mut(screen).crtcs[index])
    }

    pub fn create_crtc(&mut self, screen: ScreenId) -> RrResult<CrtcId> {
        let id = CrtcId(self.resources.alloc(ResourceKind::Crtc, Some(screen))?);
        self.screen_mut(screen).crtcs.push(Crtc::new(id, screen));
        self.set_changed(screen, ScreenChanges::RESOURCES);
        log::debug!("crtc {:#x} on screen {}", id.0, screen.0);
        Ok(id)
    }

    pub fn set_crtc_rotations(&mut self, id: CrtcId, rotations: Rotation) -> RrResult<()> {
        self.crtc_mut(id)?.rotations = rotations;
        Ok(())
    }

    pub fn set_crtc_transform_support(&mut self, id: CrtcId, transforms: bool) -> RrResult<()> {
        self.crtc_mut(id)?.transforms = transforms;
        Ok(())
    }

    /// Mark a crtc dirty; `layout` when its geometry moved
    pub fn crtc_changed(&mut self, id: CrtcId, layout: bool) -> RrResult<()> {
        let crtc = self.crtc_mut(id)?;
        crtc.changed = true;
        let screen = crtc.screen;
        let extra = if layout {
            ScreenChanges::LAYOUT
        } else {
            ScreenChanges::empty()
        };
        self.set_changed(screen, extra);
        Ok(())
    }

    /// Record hardware state after the driver reconfigured a crtc
    pub fn crtc_notify(
        &mut self,
        id: CrtcId,
        mode: Option<Rc<Mode>>,
        x: i32,
        y: i32,
        rotation: Rotation,
        transform: Option<&ClientTransform>,
        outputs: &[OutputId],
    ) -> RrResult<()> {
        let old_outputs = self.crtc(id)?.outputs.clone();
        let mut outputs_changed = false;

        for &added in outputs.iter().filter(|o| !old_outputs.contains(o)) {
            self.output_mut(added)?.crtc = Some(id);
            self.output_changed(added, false)?;
            outputs_changed = true;
        }
        for &removed in old_outputs.iter().filter(|o| !outputs.contains(o)) {
            let output = self.output_mut(removed)?;
            if output.crtc == Some(id) {
                output.crtc = None;
            }
            self.output_changed(removed, false)?;
            outputs_changed = true;
        }

        let identity = ClientTransform::identity();
        let transform = transform.unwrap_or(&identity);
        let crtc = self.crtc_mut(id)?;
        crtc.outputs = outputs.to_vec();

        let mut layout = false;
        let same_mode = match (&crtc.mode, &mode) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if !same_mode {
            crtc.mode = mode;
            layout = true;
        }
        if crtc.x != x {
            crtc.x = x;
            layout = true;
        }
        if crtc.y != y {
            crtc.y = y;
            layout = true;
        }
        if crtc.rotation != rotation {
            crtc.rotation = rotation;
            layout = true;
        }
        if crtc.current_transform != *transform {
            crtc.current_transform = transform.clone();
            layout = true;
        }
        if layout || outputs_changed {
            crtc.changed = true;
        }
        if crtc.changed {
            if let Some(mode) = crtc.mode.clone() {
                let (device, _) =
                    DeviceTransform::compute(x, y, mode.width(), mode.height(), rotation, Some(&crtc.current_transform));
                crtc.device = device;
            }
        }

        if layout || outputs_changed {
            self.crtc_changed(id, layout)?;
        }
        self.modes.release_unused(&mut self.resources);
        Ok(())
    }

    /// Reconfigure a crtc. Returns whether the configuration took effect.
    pub fn crtc_set(
        &mut self,
        id: CrtcId,
        mode: Option<Rc<Mode>>,
        x: i32,
        y: i32,
        rotation: Rotation,
        outputs: &[OutputId],
    ) -> RrResult<bool> {
        let (screen_id, _) = self.find_crtc(id)?;
        for &output in outputs {
            self.output(output)?;
        }
        if self.crtc_unchanged(id, mode.as_ref(), x, y, rotation, outputs)? {
            return Ok(true);
        }

        let screen = self.screen(screen_id);
        if let (true, Some(primary)) = (screen.is_gpu, screen.current_primary) {
            let (width, height) = mode.as_ref().map(|m| (m.width(), m.height())).unwrap_or((0, 0));
            self.check_pixmap_bounding(primary, id, rotation, x, y, width, height);
            let sync = self.pixmap_sharing_sync_wanted(outputs);
            if !self.setup_pixmap_sharing(primary, id, width, height, x, y, rotation, sync, outputs)? {
                log::warn!("crtc {:#x}: pixmap sharing setup failed", id.0);
            }
        }

        let transform = self.crtc(id)?.pending_transform.clone();
        let request = CrtcRequest {
            crtc: id,
            mode: mode.as_ref(),
            x,
            y,
            rotation,
            outputs,
            transform: &transform,
        };
        let result = self.screen_mut(screen_id).driver.crtc_set(&request);
        let ok = match result {
            Ok(()) => {
                self.crtc_notify(id, mode, x, y, rotation, Some(&transform), outputs)?;
                true
            }
            Err(DriverError::NotImplemented) => self.crtc_set_single_size(screen_id, id, mode, x, y, rotation, outputs)?,
            Err(err) => {
                log::warn!("crtc {:#x}: {}", id.0, err);
                false
            }
        };

        if ok {
            log::debug!("crtc {:#x} set at {},{} {:?}", id.0, x, y, rotation);
            self.tell_changed(screen_id);
            for &output in outputs {
                self.post_pending_properties(output);
            }
        }
        self.compute_contiguity(screen_id);
        Ok(ok)
    }

    fn crtc_unchanged(
        &self,
        id: CrtcId,
        mode: Option<&Rc<Mode>>,
        x: i32,
        y: i32,
        rotation: Rotation,
        outputs: &[OutputId],
    ) -> RrResult<bool> {
        let (screen, index) = self.find_crtc(id)?;
        let screen = self.screen(screen);
        let crtc = &screen.crtcs[index];

        let same_mode = match (crtc.mode.as_ref(), mode) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        let mut moved = false;
        for &output in outputs {
            moved |= self.output(output)?.crtc != Some(id);
        }
        let pending_properties = screen
            .outputs
            .iter()
            .any(|o| o.crtc == Some(id) && o.pending_properties);

        Ok(same_mode
            && crtc.x == x
            && crtc.y == y
            && crtc.rotation == rotation
            && crtc.outputs == outputs
            && !pending_properties
            && !crtc.has_pending_transform()
            && !moved)
    }

    /// Single-size drivers tie the screen size to the mode
    fn crtc_set_single_size(
        &mut self,
        screen_id: ScreenId,
        id: CrtcId,
        mode: Option<Rc<Mode>>,
        x: i32,
        y: i32,
        rotation: Rotation,
        outputs: &[OutputId],
    ) -> RrResult<bool> {
        let Some(mode) = mode else {
            self.crtc_notify(id, None, x, y, rotation, None, &[])?;
            return Ok(true);
        };

        let screen = self.screen(screen_id);
        let first = outputs.first().map(|&o| self.output(o)).transpose()?;
        let (mm_width, mm_height) = match first {
            Some(o) if o.mm_width != 0 && o.mm_height != 0 => (o.mm_width, o.mm_height),
            _ => (screen.mm_width, screen.mm_height),
        };
        let size = ScreenSize {
            width: mode.info.width,
            height: mode.info.height,
            mm_width,
            mm_height,
        };
        let rate = mode.info.refresh();

        match self.screen_mut(screen_id).driver.set_config(rotation, rate, &size) {
            Ok(()) => {
                let first = &outputs[..outputs.len().min(1)];
                self.crtc_notify(id, Some(mode), x, y, rotation, None, first)?;
                self.screen_size_notify(screen_id, &size);
                Ok(true)
            }
            Err(DriverError::NotImplemented) => {
                log::warn!("screen {} has no way to set crtcs", screen_id.0);
                Ok(false)
            }
            Err(err) => {
                log::warn!("crtc {:#x}: {}", id.0, err);
                Ok(false)
            }
        }
    }

    /// Grow the primary's screen to cover every crtc scanning out of it
    fn check_pixmap_bounding(
        &mut self,
        primary: ScreenId,
        target: CrtcId,
        rotation: Rotation,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) {
        let mut total: Option<Bounds> = None;
        for s in self.with_output_secondaries(primary) {
            for crtc in &self.screen(s).crtcs {
                let area = if crtc.id == target {
                    rotated_box(x, y, width, height, rotation)
                } else {
                    match crtc.rotated_box() {
                        Some(b) => b,
                        None => continue,
                    }
                };
                if area.is_empty() {
                    continue;
                }
                total = Some(total.map_or(area, |t| t.union(&area)));
            }
        }

        let current = self.screen(primary).size();
        let extents = total.unwrap_or_default();
        let new_width = extents.x2.max(current.width as i32);
        let new_height = extents.y2.max(current.height as i32);
        if new_width <= current.width as i32 && new_height <= current.height as i32 {
            return;
        }

        let size = ScreenSize {
            width: new_width.min(u16::MAX as i32) as u16,
            height: new_height.min(u16::MAX as i32) as u16,
            mm_width: 0,
            mm_height: 0,
        };
        match self.screen_mut(primary).driver.screen_set_size(&size) {
            Ok(()) => {
                let size = ScreenSize {
                    mm_width: current.mm_width,
                    mm_height: current.mm_height,
                    ..size
                };
                self.screen_size_notify(primary, &size);
            }
            Err(err) => log::warn!("screen {}: cannot grow to {}x{}: {}", primary.0, size.width, size.height, err),
        }
    }

    /// Synchronized sharing is on unless some output turned it off
    fn pixmap_sharing_sync_wanted(&self, outputs: &[OutputId]) -> bool {
        let Some(atom) = self.atoms.get_id(PRIME_SYNC) else {
            return true;
        };
        for &id in outputs {
            let Some(prop) = self.output(id).ok().and_then(|o| o.properties.get(atom)) else {
                continue;
            };
            let pending = prop.value(true);
            let value = if pending.data.is_empty() {
                &prop.current
            } else {
                pending
            };
            if value.data.first() == Some(&0) {
                return false;
            }
        }
        true
    }

    fn set_pixmap_sharing_sync(&mut self, value: u8, outputs: &[OutputId]) {
        let Some(atom) = self.atoms.get_id(PRIME_SYNC) else {
            return;
        };
        for &id in outputs {
            let has_prop = self.output(id).map(|o| o.properties.get(atom).is_some()).unwrap_or(false);
            if !has_prop {
                continue;
            }
            let owner = PropertyOwner::Output(id);
            if let Err(err) = self.change_property(owner, atom, XA_INTEGER, 8, PropMode::Replace, &[value], false, true) {
                log::debug!("output {:#x}: cannot reset sync property: {}", id.0, err);
            }
        }
    }

    /// Pixmap on the primary plus its handle on the crtc's screen
    fn create_shared_pixmap(&mut self, primary: ScreenId, secondary: ScreenId, width: i32, height: i32) -> RrResult<PixmapId> {
        let depth = self.screen(primary).root_depth;
        let front = self
            .pixmaps
            .create(&mut self.resources, primary, width as u16, height as u16, depth)?;
        match self.pixmaps.share_to_secondary(&mut self.resources, front, secondary) {
            Ok(shared) => Ok(shared),
            Err(err) => {
                self.pixmaps.free(&mut self.resources, front);
                Err(err)
            }
        }
    }

    fn destroy_shared_pixmap(&mut self, pixmap: PixmapId) {
        self.pixmaps.free_shared(&mut self.resources, pixmap);
    }

    #[allow(clippy::too_many_arguments)]
    fn setup_pixmap_sharing(
        &mut self,
        primary: ScreenId,
        id: CrtcId,
        width: i32,
        height: i32,
        x: i32,
        y: i32,
        rotation: Rotation,
        sync: bool,
        outputs: &[OutputId],
    ) -> RrResult<bool> {
        let (secondary, _) = self.find_crtc(id)?;
        if self.crtc(id)?.scanout_pixmap.is_some() {
            self.detach_scanout_pixmap(id)?;
        }
        if width == 0 && height == 0 {
            return Ok(true);
        }

        let front = match self.create_shared_pixmap(primary, secondary, width, height) {
            Ok(pixmap) => pixmap,
            Err(err) => {
                log::warn!("crtc {:#x}: failed to create shared pixmap: {}", id.0, err);
                return Ok(false);
            }
        };

        let can_flip = self.screen(secondary).driver.supports(Hook::SharedPixmapFlipping)
            && self.screen(primary).driver.supports(Hook::FlippingPixmapTracking);
        if sync && can_flip && self.setup_pixmap_flipping(primary, secondary, id, front, x, y, rotation)? {
            return Ok(true);
        }

        if sync {
            log::warn!("crtc {:#x}: falling back to unsynchronized pixmap sharing", id.0);
            self.set_pixmap_sharing_sync(0, outputs);
        }

        let Some(pixmap) = self.pixmaps.get(front).cloned() else {
            return Ok(false);
        };
        if let Err(err) = self.screen_mut(secondary).driver.crtc_set_scanout_pixmap(id, Some(&pixmap)) {
            self.destroy_shared_pixmap(front);
            log::warn!("crtc {:#x}: failed to set shared scanout pixmap: {}", id.0, err);
            return Ok(false);
        }
        self.crtc_mut(id)?.scanout_pixmap = Some(front);
        let tracking = self.screen_mut(primary).driver.start_pixmap_tracking(&pixmap, x, y, rotation);
        driver::log_failure(tracking, "start pixmap tracking");
        Ok(true)
    }

    /// Double-buffered sharing. On failure everything it created is gone.
    #[allow(clippy::too_many_arguments)]
    fn setup_pixmap_flipping(
        &mut self,
        primary: ScreenId,
        secondary: ScreenId,
        id: CrtcId,
        front: PixmapId,
        x: i32,
        y: i32,
        rotation: Rotation,
    ) -> RrResult<bool> {
        let (width, height) = match self.pixmaps.get(front) {
            Some(p) => (p.width as i32, p.height as i32),
            None => return Ok(false),
        };
        let back = match self.create_shared_pixmap(primary, secondary, width, height) {
            Ok(pixmap) => pixmap,
            Err(_) => return Ok(false),
        };
        let (Some(front_pixmap), Some(back_pixmap)) = (self.pixmaps.get(front).cloned(), self.pixmaps.get(back).cloned())
        else {
            self.destroy_shared_pixmap(back);
            return Ok(false);
        };

        let enabled = self
            .screen_mut(secondary)
            .driver
            .enable_shared_pixmap_flipping(id, &front_pixmap, &back_pixmap);
        if let Err(err) = enabled {
            log::debug!("crtc {:#x}: flipping refused: {}", id.0, err);
            self.destroy_shared_pixmap(back);
            return Ok(false);
        }

        let crtc = self.crtc_mut(id)?;
        crtc.scanout_pixmap = Some(front);
        crtc.scanout_pixmap_back = Some(back);

        let tracking = self.screen_mut(primary).driver.start_flipping_pixmap_tracking(
            id,
            &front_pixmap,
            &back_pixmap,
            x,
            y,
            rotation,
        );
        if let Err(err) = tracking {
            log::debug!("crtc {:#x}: flip tracking refused: {}", id.0, err);
            let disabled = self.screen_mut(secondary).driver.disable_shared_pixmap_flipping(id);
            driver::log_failure(disabled, "disable flipping");
            self.destroy_shared_pixmap(back);
            let crtc = self.crtc_mut(id)?;
            crtc.scanout_pixmap = None;
            crtc.scanout_pixmap_back = None;
            return Ok(false);
        }

        let presented = self.screen_mut(primary).driver.present_shared_pixmap(front);
        driver::log_failure(presented, "present shared pixmap");
        Ok(true)
    }

    /// Stop scanning out of a shared pixmap and free it
    pub fn detach_scanout_pixmap(&mut self, id: CrtcId) -> RrResult<()> {
        let (screen, _) = self.find_crtc(id)?;
        let crtc = self.crtc(id)?;
        if let Some(front) = crtc.scanout_pixmap {
            let back = crtc.scanout_pixmap_back;
            let primary = self.screen(screen).current_primary;
            match back {
                Some(back) => {
                    let disabled = self.screen_mut(screen).driver.disable_shared_pixmap_flipping(id);
                    driver::log_failure(disabled, "disable flipping");
                    if let Some(primary) = primary {
                        let stopped = self.screen_mut(primary).driver.stop_flipping_pixmap_tracking(front, back);
                        driver::log_failure(stopped, "stop flip tracking");
                    }
                    self.destroy_shared_pixmap(back);
                    self.crtc_mut(id)?.scanout_pixmap_back = None;
                }
                None => {
                    let cleared = self.screen_mut(screen).driver.crtc_set_scanout_pixmap(id, None);
                    driver::log_failure(cleared, "clear scanout pixmap");
                    if let Some(primary) = primary {
                        let stopped = self.screen_mut(primary).driver.stop_pixmap_tracking(front);
                        driver::log_failure(stopped, "stop pixmap tracking");
                    }
                }
            }
            self.destroy_shared_pixmap(front);
            self.crtc_mut(id)?.scanout_pixmap = None;
        }
        self.crtc_changed(id, true)
    }

    /// Whether any crtc on the screen scans out of a shared pixmap
    pub fn has_scanout_pixmap(&self, screen: ScreenId) -> bool {
        self.screen(screen).crtcs.iter().any(|c| c.scanout_pixmap.is_some())
    }

    /// Decide whether the pointer may float between crtcs
    pub fn compute_contiguity(&mut self, screen_id: ScreenId) {
        let screen = self.screen(screen_id);
        let bounds: Vec<Option<Bounds>> = screen
            .crtcs
            .iter()
            .map(|c| cursor_bounds(c, screen.driver.as_ref()))
            .collect();
        let adjacent = |a: usize, b: usize| match (&bounds[a], &bounds[b]) {
            (Some(a), Some(b)) => a.touches(b),
            _ => false,
        };

        let mut reachable = vec![false; bounds.len()];
        if let Some(start) = bounds.iter().position(Option::is_some) {
            let mut stack = vec![start];
            reachable[start] = true;
            while let Some(cur) = stack.pop() {
                for next in 0..bounds.len() {
                    if !reachable[next] && adjacent(cur, next) {
                        reachable[next] = true;
                        stack.push(next);
                    }
                }
            }
        }
        let discontiguous = bounds
            .iter()
            .zip(&reachable)
            .any(|(b, &seen)| b.is_some() && !seen);

        if discontiguous != screen.discontiguous {
            log::debug!("screen {} discontiguous={}", screen_id.0, discontiguous);
        }
        self.screen_mut(screen_id).discontiguous = discontiguous;
    }

    fn crtc_bounds_on(&self, screen: ScreenId) -> Vec<Bounds> {
        let screen = self.screen(screen);
        screen
            .crtcs
            .iter()
            .filter_map(|c| cursor_bounds(c, screen.driver.as_ref()))
            .collect()
    }

    /// Keep the pointer on some crtc when moving from `from` to `to`.
    /// Returns the position to use.
    pub fn constrain_cursor(&self, screen: ScreenId, from: (i32, i32), to: (i32, i32)) -> (i32, i32) {
        if self.screen(screen).discontiguous {
            return to;
        }
        let all = self.with_output_secondaries(screen);
        let (x, y) = to;
        if all
            .iter()
            .flat_map(|&s| self.crtc_bounds_on(s))
            .any(|b| b.contains(x, y))
        {
            return to;
        }

        let coming_from = all
            .iter()
            .flat_map(|&s| self.crtc_bounds_on(s))
            .find(|b| b.contains(from.0, from.1));
        match coming_from {
            Some(b) => (x.clamp(b.x1, b.x2 - 1), y.clamp(b.y1, b.y2 - 1)),
            None => to,
        }
    }

    /// Remove a crtc. Leases holding it end first.
    pub fn destroy_crtc(&mut self, id: CrtcId) -> RrResult<()> {
        let (screen, _) = self.find_crtc(id)?;
        let holders: Vec<_> = self
            .screen(screen)
            .leases
            .iter()
            .filter(|l| l.crtcs.contains(&id))
            .map(|l| l.key)
            .collect();
        for lease in holders {
            self.terminate_lease(screen, lease);
        }

        if self.crtc(id)?.scanout_pixmap.is_some() {
            self.detach_scanout_pixmap(id)?;
        }
        let (_, index) = self.find_crtc(id)?;
        let scr = self.screen_mut(screen);
        scr.crtcs.remove(index);
        for output in scr.outputs.iter_mut().filter(|o| o.crtc == Some(id)) {
            output.crtc = None;
            output.changed = true;
        }
        self.resources.free(id.0);
        self.modes.release_unused(&mut self.resources);
        self.set_changed(screen, ScreenChanges::RESOURCES);
        log::debug!("crtc {:#x} destroyed", id.0);
        Ok(())
    }

    /// Fix the gamma ramp length, resetting it to linear
    pub fn gamma_set_size(&mut self, id: CrtcId, size: usize) -> RrResult<()> {
        let crtc = self.crtc_mut(id)?;
        if crtc.gamma.size() != size {
            crtc.gamma = GammaRamp::linear(size);
        }
        Ok(())
    }

    pub fn gamma_size(&self, id: CrtcId) -> RrResult<usize> {
        Ok(self.crtc(id)?.gamma.size())
    }

    /// Load a ramp; it must match the configured size
    pub fn gamma_set(&mut self, id: CrtcId, ramp: GammaRamp) -> RrResult<()> {
        if self.crtc_is_leased(id) {
            return Err(RrError::Access(id.0));
        }
        let (screen, index) = self.find_crtc(id)?;
        let scr = self.screen_mut(screen);
        let crtc = &mut scr.crtcs[index];
        if !ramp.is_consistent() || ramp.size() != crtc.gamma.size() {
            return Err(RrError::Match(ramp.size() as u32));
        }
        crtc.gamma = ramp;
        let applied = scr.driver.crtc_set_gamma(id, &scr.crtcs[index].gamma);
        driver::log_failure(applied, "set gamma");
        Ok(())
    }

    /// Current ramp, refreshed from the driver when it can report one
    pub fn gamma_get(&mut self, id: CrtcId) -> RrResult<GammaRamp> {
        let (screen, index) = self.find_crtc(id)?;
        let scr = self.screen_mut(screen);
        match scr.driver.crtc_get_gamma(id) {
            Ok(Some(ramp)) if ramp.is_consistent() => scr.crtcs[index].gamma = ramp,
            Ok(_) | Err(DriverError::NotImplemented) => {}
            Err(err) => {
                log::warn!("crtc {:#x}: gamma read failed: {}", id.0, err);
                return Err(RrError::Crtc(id.0));
            }
        }
        Ok(scr.crtcs[index].gamma.clone())
    }

    /// Stage a client transform; it applies on the next successful set
    pub fn transform_set(&mut self, id: CrtcId, matrix: FixedMatrix, filter: &[u8], params: &[i32]) -> RrResult<()> {
        if self.crtc_is_leased(id) {
            return Err(RrError::Access(id.0));
        }
        let crtc = self.crtc(id)?;
        if matrix.to_dmat3().determinant() == 0.0 {
            return Err(RrError::Match(id.0));
        }
        if !crtc.transforms {
            return Err(RrError::Value(id.0));
        }
        let transform = ClientTransform::from_request(matrix, filter, params)?;
        self.crtc_mut(id)?.pending_transform = transform;
        Ok(())
    }

    pub fn crtc_transform(&self, id: CrtcId) -> RrResult<CrtcTransformInfo> {
        let crtc = self.crtc(id)?;
        Ok(CrtcTransformInfo {
            has_transforms: crtc.transforms,
            pending: crtc.pending_transform.clone(),
            current: crtc.current_transform.clone(),
        })
    }

    pub fn crtc_info(&self, id: CrtcId) -> RrResult<CrtcInfo> {
        let (screen_id, index) = self.find_crtc(id)?;
        let screen = self.screen(screen_id);
        let crtc = &screen.crtcs[index];
        let timestamp = screen.last_set_time;

        if self.crtc_is_leased(id) {
            return Ok(CrtcInfo {
                timestamp,
                x: 0,
                y: 0,
                width: 0,
                height: 0,
                mode: None,
                rotation: Rotation::ROTATE_0,
                rotations: Rotation::ROTATE_0,
                outputs: Vec::new(),
                possible: Vec::new(),
            });
        }

        let panned = screen
            .driver
            .get_panning(id)
            .ok()
            .map(|p| p.total)
            .filter(|total| !total.is_empty());
        let area = match panned {
            Some(total) => total,
            None => {
                let (width, height) = crtc.scanout_size();
                Bounds::from_size(crtc.x, crtc.y, width, height)
            }
        };
        let possible = screen
            .outputs
            .iter()
            .filter(|o| !self.output_is_leased(o.id))
            .filter(|o| o.crtcs.contains(&id))
            .map(|o| o.id)
            .collect();

        Ok(CrtcInfo {
            timestamp,
            x: area.x1 as i16,
            y: area.y1 as i16,
            width: area.width() as u16,
            height: area.height() as u16,
            mode: crtc.mode.as_ref().map(|m| m.id),
            rotation: crtc.rotation,
            rotations: crtc.rotations,
            outputs: crtc.outputs.clone(),
            possible,
        })
    }

    /// SetCrtcConfig: validate, then reconfigure
    pub fn set_crtc_config(&mut self, config: &CrtcConfig<'_>) -> RrResult<(ConfigStatus, Timestamp)> {
        let id = config.crtc;
        let (screen_id, _) = self.find_crtc(id)?;
        if self.crtc_is_leased(id) {
            return Err(RrError::Access(id.0));
        }

        let mode = match config.mode {
            None if !config.outputs.is_empty() => return Err(RrError::Match(id.0)),
            None => None,
            Some(mode_id) => {
                let mode = self.modes.lookup(mode_id)?;
                if config.outputs.is_empty() {
                    return Err(RrError::Match(mode_id.0));
                }
                Some(mode)
            }
        };

        for &output_id in config.outputs {
            let output = self.output(output_id)?;
            if self.output_is_leased(output_id) {
                return Err(RrError::Access(output_id.0));
            }
            if !output.crtcs.contains(&id) {
                return Err(RrError::Match(output_id.0));
            }
            if let Some(mode) = &mode {
                if !output.has_mode(mode) {
                    return Err(RrError::Match(mode.id.0));
                }
            }
        }
        for &a in config.outputs {
            let clones = &self.output(a)?.clones;
            if config.outputs.iter().any(|&b| b != a && !clones.contains(&b)) {
                return Err(RrError::Match(a.0));
            }
        }

        let rotation = Rotation::from_bits_retain(config.rotation);
        if !matches!(config.rotation & 0xf, 1 | 2 | 4 | 8) {
            return Err(RrError::Value(config.rotation as u32));
        }

        let (x, y) = (config.x as i32, config.y as i32);
        if let Some(mode) = &mode {
            let crtc = self.crtc(id)?;
            if !crtc.rotations.bits() & config.rotation != 0 {
                return Err(RrError::Match(config.rotation as u32));
            }
            let screen = self.screen(screen_id);
            if screen.driver.supports(Hook::ScreenSetSize) && !crtc.transforms {
                let bounds_screen = match (screen.is_gpu, screen.current_primary) {
                    (true, Some(primary)) => self.screen(primary),
                    _ => screen,
                };
                let (width, height) = (bounds_screen.width as i32, bounds_screen.height as i32);
                let (device, _) = DeviceTransform::compute(
                    x,
                    y,
                    mode.width(),
                    mode.height(),
                    rotation,
                    Some(&crtc.pending_transform),
                );
                let (source_width, source_height) = scanout_size(mode, &device);
                if x + source_width > width {
                    return Err(RrError::Value(config.x as u16 as u32));
                }
                if y + source_height > height {
                    return Err(RrError::Value(config.y as u16 as u32));
                }
            }
        }

        let time = if config.timestamp.0 == 0 {
            Timestamp::now()
        } else {
            config.timestamp
        };
        if !self.crtc_set(id, mode, x, y, rotation, config.outputs)? {
            return Ok((ConfigStatus::Failed, self.screen(screen_id).last_set_time));
        }
        self.screen_mut(screen_id).last_set_time = time;
        Ok((ConfigStatus::Success, time))
    }

    /// Panning area; zeros when the driver cannot pan
    pub fn panning(&self, id: CrtcId) -> RrResult<(Timestamp, Panning)> {
        let (screen, _) = self.find_crtc(id)?;
        let screen = self.screen(screen);
        Ok((screen.last_set_time, screen.driver.get_panning(id).unwrap_or_default()))
    }

    pub fn set_panning(&mut self, id: CrtcId, timestamp: Timestamp, panning: &Panning) -> RrResult<(ConfigStatus, Timestamp)> {
        let (screen_id, _) = self.find_crtc(id)?;
        if self.crtc_is_leased(id) {
            return Err(RrError::Access(id.0));
        }
        let screen = self.screen_mut(screen_id);
        if let Err(DriverError::NotImplemented) = screen.driver.get_panning(id) {
            return Err(RrError::Crtc(id.0));
        }
        if let Err(err) = screen.driver.set_panning(id, panning) {
            log::debug!("crtc {:#x}: panning refused: {}", id.0, err);
            return Err(RrError::Match(id.0));
        }
        let time = if timestamp.0 == 0 { Timestamp::now() } else { timestamp };
        screen.last_set_time = time;
        Ok((ConfigStatus::Success, time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::PRIME_SYNC;
    use crate::event::NotifyMask;
    use crate::testing::{Call, Rig, CONNECTED};

    #[test]
    fn test_set_twice_is_idempotent() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        let output = rig.add_output("DP-1", CONNECTED, &[crtc], 1920, 1080);
        let mode = rig.randr.output(output).unwrap().modes[0].clone();

        assert!(rig.randr.crtc_set(crtc, Some(mode.clone()), 0, 0, Rotation::ROTATE_0, &[output]).unwrap());
        assert_eq!(rig.calls().len(), 1);
        rig.randr.take_events();

        assert!(rig.randr.crtc_set(crtc, Some(mode), 0, 0, Rotation::ROTATE_0, &[output]).unwrap());
        assert_eq!(rig.calls().len(), 1);
        assert!(rig.randr.take_events().is_empty());
    }

    #[test]
    fn test_set_announces_crtc_and_output() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        let output = rig.add_output("DP-1", CONNECTED, &[crtc], 1920, 1080);
        rig.randr.tell_changed(rig.screen);
        rig.randr.take_events();

        rig.enable(crtc, 0, 0, &[output]);
        let masks: Vec<_> = rig.randr.take_events().iter().map(|e| e.notify.mask()).collect();
        assert_eq!(
            masks,
            vec![NotifyMask::SCREEN_CHANGE, NotifyMask::CRTC_CHANGE, NotifyMask::OUTPUT_CHANGE]
        );
        assert_eq!(rig.randr.output(output).unwrap().crtc, Some(crtc));
    }

    #[test]
    fn test_disable_detaches_outputs() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        let output = rig.add_output("DP-1", CONNECTED, &[crtc], 1920, 1080);
        rig.enable(crtc, 0, 0, &[output]);

        assert!(rig.randr.crtc_set(crtc, None, 0, 0, Rotation::ROTATE_0, &[]).unwrap());
        assert_eq!(rig.randr.output(output).unwrap().crtc, None);
        assert!(rig.randr.crtc(crtc).unwrap().mode.is_none());
        assert!(rig.randr.modes.lookup(rig.randr.output(output).unwrap().modes[0].id).is_ok());
    }

    #[test]
    fn test_single_size_driver_resizes_screen() {
        let mut rig = Rig::new(1024, 768);
        rig.behave(|b| b.single_size = true);
        let crtc = rig.add_crtc();
        let output = rig.add_output("VGA-1", CONNECTED, &[crtc], 1280, 1024);
        rig.randr.set_output_physical_size(output, 376, 301).unwrap();

        rig.enable(crtc, 0, 0, &[output]);
        assert_eq!(
            rig.calls(),
            vec![Call::SetConfig {
                rate: 60,
                width: 1280,
                height: 1024,
                mm_width: 376,
                mm_height: 301,
            }]
        );
        let screen = rig.randr.screen(rig.screen);
        assert_eq!((screen.width, screen.height), (1280, 1024));
    }

    #[test]
    fn test_refused_set_reports_failed_status() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        let output = rig.add_output("DP-1", CONNECTED, &[crtc], 1920, 1080);
        let mode = rig.randr.output(output).unwrap().modes[0].id;
        rig.behave(|b| b.refuse_crtc_set = true);

        let config = CrtcConfig {
            crtc,
            timestamp: Timestamp(0),
            mode: Some(mode),
            x: 0,
            y: 0,
            rotation: 1,
            outputs: &[output],
        };
        let (status, _) = rig.randr.set_crtc_config(&config).unwrap();
        assert_eq!(status, ConfigStatus::Failed);
        assert!(rig.randr.crtc(crtc).unwrap().mode.is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        let other = rig.add_crtc();
        let a = rig.add_output("DP-1", CONNECTED, &[crtc], 1920, 1080);
        let b = rig.add_output("DP-2", CONNECTED, &[other], 1920, 1080);
        let mode = rig.randr.output(a).unwrap().modes[0].id;
        let base = CrtcConfig {
            crtc,
            timestamp: Timestamp(0),
            mode: Some(mode),
            x: 0,
            y: 0,
            rotation: 1,
            outputs: &[a],
        };

        let no_outputs = CrtcConfig { outputs: &[], ..base };
        assert_eq!(rig.randr.set_crtc_config(&no_outputs).unwrap_err(), RrError::Match(mode.0));

        let wrong_crtc = CrtcConfig { outputs: &[b], ..base };
        assert_eq!(rig.randr.set_crtc_config(&wrong_crtc).unwrap_err(), RrError::Match(b.0));

        let two_angles = CrtcConfig { rotation: 3, ..base };
        assert_eq!(rig.randr.set_crtc_config(&two_angles).unwrap_err(), RrError::Value(3));

        rig.randr.set_crtc_rotations(crtc, Rotation::ROTATE_0).unwrap();
        let rotated = CrtcConfig { rotation: 2, ..base };
        assert_eq!(rig.randr.set_crtc_config(&rotated).unwrap_err(), RrError::Match(2));

        rig.behave(|b| b.screen_set_size = true);
        let off_screen = CrtcConfig { x: 100, ..base };
        assert_eq!(rig.randr.set_crtc_config(&off_screen).unwrap_err(), RrError::Value(100));

        let (status, time) = rig.randr.set_crtc_config(&base).unwrap();
        assert_eq!(status, ConfigStatus::Success);
        assert_eq!(rig.randr.screen(rig.screen).last_set_time, time);
    }

    #[test]
    fn test_clones_must_list_each_other() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        let a = rig.add_output("DP-1", CONNECTED, &[crtc], 1920, 1080);
        let b = rig.add_output("DP-2", CONNECTED, &[crtc], 1920, 1080);
        let mode = rig.randr.output(a).unwrap().modes[0].id;
        let config = CrtcConfig {
            crtc,
            timestamp: Timestamp(0),
            mode: Some(mode),
            x: 0,
            y: 0,
            rotation: 1,
            outputs: &[a, b],
        };
        assert_eq!(rig.randr.set_crtc_config(&config).unwrap_err(), RrError::Match(a.0));

        rig.randr.set_output_clones(a, &[b]).unwrap();
        rig.randr.set_output_clones(b, &[a]).unwrap();
        assert_eq!(rig.randr.set_crtc_config(&config).unwrap().0, ConfigStatus::Success);
        assert_eq!(rig.randr.crtc(crtc).unwrap().outputs, vec![a, b]);
    }

    #[test]
    fn test_gamma_size_mismatch_leaves_ramp() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        rig.randr.gamma_set_size(crtc, 4).unwrap();
        let before = rig.randr.gamma_get(crtc).unwrap();

        let short = GammaRamp {
            red: vec![1, 2, 3],
            green: vec![1, 2, 3],
            blue: vec![1, 2, 3],
        };
        assert_eq!(rig.randr.gamma_set(crtc, short).unwrap_err(), RrError::Match(3));
        assert_eq!(rig.randr.gamma_get(crtc).unwrap(), before);

        let ramp = GammaRamp {
            red: vec![0, 1, 2, 3],
            green: vec![4, 5, 6, 7],
            blue: vec![8, 9, 10, 11],
        };
        rig.randr.gamma_set(crtc, ramp.clone()).unwrap();
        assert_eq!(rig.randr.gamma_get(crtc).unwrap(), ramp);
        assert!(rig.calls().contains(&Call::SetGamma(crtc)));
    }

    #[test]
    fn test_contiguity_needs_touching_crtcs() {
        let mut rig = Rig::new(1000, 1000);
        let a = rig.add_crtc();
        let b = rig.add_crtc();
        let left = rig.add_output("DP-1", CONNECTED, &[a], 100, 100);
        let right = rig.add_output("DP-2", CONNECTED, &[b], 100, 100);

        rig.enable(a, 0, 0, &[left]);
        rig.enable(b, 500, 500, &[right]);
        assert!(rig.randr.screen(rig.screen).discontiguous);

        rig.enable(b, 100, 0, &[right]);
        assert!(!rig.randr.screen(rig.screen).discontiguous);
    }

    #[test]
    fn test_cursor_clamped_unless_discontiguous() {
        let mut rig = Rig::new(1000, 1000);
        let a = rig.add_crtc();
        let b = rig.add_crtc();
        let left = rig.add_output("DP-1", CONNECTED, &[a], 100, 100);
        let right = rig.add_output("DP-2", CONNECTED, &[b], 100, 100);
        rig.enable(a, 0, 0, &[left]);
        rig.enable(b, 100, 0, &[right]);

        let screen = rig.screen;
        assert_eq!(rig.randr.constrain_cursor(screen, (50, 50), (150, 50)), (150, 50));
        assert_eq!(rig.randr.constrain_cursor(screen, (50, 50), (50, 300)), (50, 99));

        rig.enable(b, 500, 500, &[right]);
        assert_eq!(rig.randr.constrain_cursor(screen, (50, 50), (50, 300)), (50, 300));
    }

    #[test]
    fn test_transform_applies_on_next_set() {
        let mut rig = Rig::new(4000, 4000);
        let crtc = rig.add_crtc();
        let output = rig.add_output("DP-1", CONNECTED, &[crtc], 1920, 1080);
        rig.enable(crtc, 0, 0, &[output]);

        assert_eq!(
            rig.randr.transform_set(crtc, FixedMatrix::IDENTITY, b"", &[]).unwrap_err(),
            RrError::Value(crtc.0)
        );
        rig.randr.set_crtc_transform_support(crtc, true).unwrap();
        let double = FixedMatrix::from_array([0x20000, 0, 0, 0, 0x20000, 0, 0, 0, 0x10000]);
        rig.randr.transform_set(crtc, double, b"bilinear", &[]).unwrap();
        assert!(rig.randr.crtc(crtc).unwrap().has_pending_transform());
        assert_eq!(rig.randr.crtc(crtc).unwrap().scanout_size(), (1920, 1080));

        rig.enable(crtc, 0, 0, &[output]);
        let crtc = rig.randr.crtc(crtc).unwrap();
        assert!(!crtc.has_pending_transform());
        assert_eq!(crtc.scanout_size(), (3840, 2160));
    }

    #[test]
    fn test_singular_transform_is_match() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        rig.randr.set_crtc_transform_support(crtc, true).unwrap();
        let singular = FixedMatrix::from_array([0; 9]);
        assert_eq!(
            rig.randr.transform_set(crtc, singular, b"", &[]).unwrap_err(),
            RrError::Match(crtc.0)
        );
        assert_eq!(
            rig.randr.transform_set(crtc, FixedMatrix::IDENTITY, b"lanczos", &[]).unwrap_err(),
            RrError::Name(0)
        );
    }

    #[test]
    fn test_rotated_crtc_reports_swapped_size() {
        let mut rig = Rig::new(1080, 1920);
        let crtc = rig.add_crtc();
        let output = rig.add_output("DSI-1", CONNECTED, &[crtc], 1920, 1080);
        let mode = rig.randr.output(output).unwrap().modes[0].clone();
        rig.randr
            .crtc_set(crtc, Some(mode), 0, 0, Rotation::ROTATE_90, &[output])
            .unwrap();

        let info = rig.randr.crtc_info(crtc).unwrap();
        assert_eq!((info.width, info.height), (1080, 1920));
        assert_eq!(info.rotation, Rotation::ROTATE_90);
        assert_eq!(info.possible, vec![output]);
    }

    #[test]
    fn test_panning_needs_driver_support() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        let (_, panning) = rig.randr.panning(crtc).unwrap();
        assert_eq!(panning, Panning::default());
        assert_eq!(
            rig.randr.set_panning(crtc, Timestamp(0), &Panning::default()).unwrap_err(),
            RrError::Crtc(crtc.0)
        );

        let area = Panning {
            total: Bounds::new(0, 0, 3840, 2160),
            tracking: Bounds::new(0, 0, 3840, 2160),
            border: [0; 4],
        };
        rig.behave(|b| b.panning = Some(Panning::default()));
        let (status, _) = rig.randr.set_panning(crtc, Timestamp(0), &area).unwrap();
        assert_eq!(status, ConfigStatus::Success);
        assert_eq!(rig.randr.panning(crtc).unwrap().1, area);
    }

    #[test]
    fn test_gpu_crtc_shares_pixmap_with_sync_fallback() {
        let mut rig = Rig::new(1920, 1080);
        let gpu = rig.add_gpu_screen(0, 0);
        let source = rig.add_provider(rig.screen, crate::provider::ProviderCapabilities::SOURCE_OUTPUT);
        let sink = rig.add_provider(gpu, crate::provider::ProviderCapabilities::SINK_OUTPUT);
        let crtc = rig.add_crtc_on(gpu);
        let output = rig.add_output_on(gpu, "HDMI-1", CONNECTED, &[crtc], 1280, 720);
        rig.randr.set_output_source(sink, Some(source)).unwrap();
        rig.behave_on(gpu, |b| b.flipping = true);

        rig.enable(crtc, 1920, 0, &[output]);

        // The primary screen grew to cover the new crtc
        assert_eq!(rig.randr.screen(rig.screen).width, 3200);
        // Flipping needs both sides; the primary refused, so sync is off
        let sync = rig.randr.atoms.get_id(PRIME_SYNC).unwrap();
        let prop = rig.randr.output(output).unwrap().properties.get(sync).unwrap();
        assert_eq!(prop.current.data, vec![0]);

        let front = rig.randr.crtc(crtc).unwrap().scanout_pixmap.unwrap();
        assert!(rig.randr.crtc(crtc).unwrap().scanout_pixmap_back.is_none());
        assert!(rig.calls_on(gpu).contains(&Call::SetScanout(crtc, Some(front))));
        assert!(rig.calls().contains(&Call::StartTracking(front)));
        assert!(rig.randr.has_scanout_pixmap(gpu));

        rig.randr.detach_scanout_pixmap(crtc).unwrap();
        assert!(rig.calls().contains(&Call::StopTracking(front)));
        assert!(rig.randr.pixmaps.is_empty());
    }

    #[test]
    fn test_gpu_crtc_flips_when_both_sides_can() {
        let mut rig = Rig::new(1920, 1080);
        let gpu = rig.add_gpu_screen(0, 0);
        let source = rig.add_provider(rig.screen, crate::provider::ProviderCapabilities::SOURCE_OUTPUT);
        let sink = rig.add_provider(gpu, crate::provider::ProviderCapabilities::SINK_OUTPUT);
        let crtc = rig.add_crtc_on(gpu);
        let output = rig.add_output_on(gpu, "HDMI-1", CONNECTED, &[crtc], 1280, 720);
        rig.randr.set_output_source(sink, Some(source)).unwrap();
        rig.behave_on(gpu, |b| b.flipping = true);
        rig.behave(|b| b.flipping = true);

        rig.enable(crtc, 0, 0, &[output]);
        let crtc_ref = rig.randr.crtc(crtc).unwrap();
        let (front, back) = (crtc_ref.scanout_pixmap.unwrap(), crtc_ref.scanout_pixmap_back.unwrap());
        assert!(rig.calls_on(gpu).contains(&Call::EnableFlipping(crtc)));
        assert!(rig.calls().contains(&Call::Present(front)));
        assert_eq!(rig.randr.pixmaps.len(), 4);

        rig.randr.destroy_crtc(crtc).unwrap();
        assert!(rig.calls().contains(&Call::StopFlipTracking(front, back)));
        assert!(rig.randr.pixmaps.is_empty());
    }
}
