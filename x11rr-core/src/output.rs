//! Physical connectors
//!
//! Outputs are created by the driver. Clients only read them, pick the
//! primary one and edit their properties.

use crate::atom::{NON_DESKTOP, XA_INTEGER};
use crate::crtc::Crtc;
use crate::error::{RrError, RrResult};
use crate::event::Notify;
use crate::mode::Mode;
use crate::property::{PropMode, PropertyList, PropertyOwner};
use crate::resource::ResourceKind;
use crate::screen::{Randr, ScreenChanges};
use crate::types::{Connection, CrtcId, ModeId, OutputId, Rotation, ScreenId, SubpixelOrder, Timestamp};
use std::rc::Rc;

#[derive(Debug)]
pub struct Output {
    pub id: OutputId,
    pub screen: ScreenId,
    pub name: String,
    pub connection: Connection,
    pub subpixel: SubpixelOrder,
    pub mm_width: u32,
    pub mm_height: u32,
    /// Crtc currently driving this output
    pub crtc: Option<CrtcId>,
    /// Crtcs able to drive it
    pub crtcs: Vec<CrtcId>,
    /// Outputs that may share a crtc with it
    pub clones: Vec<OutputId>,
    pub modes: Vec<Rc<Mode>>,
    /// Leading entries of `modes` the monitor prefers
    pub num_preferred: usize,
    pub properties: PropertyList,
    /// A pending property was written since the last set
    pub pending_properties: bool,
    pub changed: bool,
    pub non_desktop: bool,
}

impl Output {
    fn new(id: OutputId, screen: ScreenId, name: &str) -> Self {
        Self {
            id,
            screen,
            name: name.to_string(),
            connection: Connection::Unknown,
            subpixel: SubpixelOrder::Unknown,
            mm_width: 0,
            mm_height: 0,
            crtc: None,
            crtcs: Vec::new(),
            clones: Vec::new(),
            modes: Vec::new(),
            num_preferred: 0,
            properties: PropertyList::new(),
            pending_properties: false,
            changed: false,
            non_desktop: false,
        }
    }

    /// Connection as clients see it; non-desktop outputs hide themselves
    pub fn visible_connection(&self) -> Connection {
        if self.non_desktop {
            Connection::Disconnected
        } else {
            self.connection
        }
    }

    pub fn has_mode(&self, mode: &Rc<Mode>) -> bool {
        self.modes.iter().any(|m| Rc::ptr_eq(m, mode))
    }

    pub(crate) fn change_notify(&self, crtc: Option<&Crtc>, timestamp: Timestamp, config_timestamp: Timestamp) -> Notify {
        Notify::Output {
            timestamp,
            config_timestamp,
            output: self.id,
            crtc: crtc.map(|c| c.id),
            mode: crtc.and_then(|c| c.mode.as_ref()).map(|m| m.id),
            rotation: crtc.map(|c| c.rotation).unwrap_or(Rotation::ROTATE_0),
            connection: self.visible_connection(),
            subpixel: self.subpixel,
        }
    }
}

/// GetOutputInfo reply body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub timestamp: Timestamp,
    pub crtc: Option<CrtcId>,
    pub mm_width: u32,
    pub mm_height: u32,
    pub connection: Connection,
    pub subpixel: SubpixelOrder,
    pub crtcs: Vec<CrtcId>,
    pub modes: Vec<ModeId>,
    pub num_preferred: u16,
    pub clones: Vec<OutputId>,
    pub name: String,
}

impl Randr {
    pub(crate) fn find_output(&self, id: OutputId) -> RrResult<(ScreenId, usize)> {
        let screen = self
            .resources
            .lookup(id.0, ResourceKind::Output)?
            .ok_or(RrError::Output(id.0))?;
        let index = self
            .screen(screen)
            .outputs
            .iter()
            .position(|o| o.id == id)
            .ok_or(RrError::Output(id.0))?;
        Ok((screen, index))
    }

    pub fn output(&self, id: OutputId) -> RrResult<&Output> {
        let (screen, index) = self.find_output(id)?;
        Ok(&self.screen(screen).outputs[index])
    }

    pub fn output_mut(&mut self, id: OutputId) -> RrResult<&mut Output> {
        let (screen, index) = self.find_output(id)?;
        Ok(&mut self.screen_mut(screen).outputs[index])
    }

    pub fn create_output(&mut self, screen: ScreenId, name: &str) -> RrResult<OutputId> {
        let id = OutputId(self.resources.alloc(ResourceKind::Output, Some(screen))?);
        self.screen_mut(screen).outputs.push(Output::new(id, screen, name));

        let non_desktop = self.atoms.make(NON_DESKTOP);
        let owner = PropertyOwner::Output(id);
        self.configure_property(owner, non_desktop, false, false, false, &[0, 1])?;
        self.set_output_non_desktop(id, false)?;

        self.set_changed(screen, ScreenChanges::RESOURCES);
        log::debug!("output {:#x} {} on screen {}", id.0, name, screen.0);
        Ok(id)
    }

    /// Mark an output dirty; `config` also advances the config timestamp
    pub fn output_changed(&mut self, id: OutputId, config: bool) -> RrResult<()> {
        let output = self.output_mut(id)?;
        output.changed = true;
        let screen = output.screen;
        let extra = if config {
            ScreenChanges::CONFIG
        } else {
            ScreenChanges::empty()
        };
        self.set_changed(screen, extra);
        Ok(())
    }

    pub fn set_output_crtcs(&mut self, id: OutputId, crtcs: &[CrtcId]) -> RrResult<()> {
        let output = self.output_mut(id)?;
        if output.crtcs == crtcs {
            return Ok(());
        }
        output.crtcs = crtcs.to_vec();
        self.output_changed(id, true)
    }

    pub fn set_output_clones(&mut self, id: OutputId, clones: &[OutputId]) -> RrResult<()> {
        let output = self.output_mut(id)?;
        if output.clones == clones {
            return Ok(());
        }
        output.clones = clones.to_vec();
        self.output_changed(id, true)
    }

    pub fn set_output_modes(&mut self, id: OutputId, modes: Vec<Rc<Mode>>, num_preferred: usize) -> RrResult<()> {
        let output = self.output_mut(id)?;
        let same = output.num_preferred == num_preferred
            && output.modes.len() == modes.len()
            && output.modes.iter().zip(&modes).all(|(a, b)| Rc::ptr_eq(a, b));
        if same {
            return Ok(());
        }
        output.modes = modes;
        output.num_preferred = num_preferred;
        self.output_changed(id, true)?;
        self.modes.release_unused(&mut self.resources);
        Ok(())
    }

    pub fn set_output_connection(&mut self, id: OutputId, connection: Connection) -> RrResult<()> {
        let output = self.output_mut(id)?;
        if output.connection == connection {
            return Ok(());
        }
        output.connection = connection;
        self.output_changed(id, true)
    }

    pub fn set_output_subpixel(&mut self, id: OutputId, subpixel: SubpixelOrder) -> RrResult<()> {
        let output = self.output_mut(id)?;
        if output.subpixel == subpixel {
            return Ok(());
        }
        output.subpixel = subpixel;
        self.output_changed(id, false)
    }

    pub fn set_output_physical_size(&mut self, id: OutputId, mm_width: u32, mm_height: u32) -> RrResult<()> {
        let output = self.output_mut(id)?;
        if (output.mm_width, output.mm_height) == (mm_width, mm_height) {
            return Ok(());
        }
        output.mm_width = mm_width;
        output.mm_height = mm_height;
        self.output_changed(id, false)
    }

    /// Goes through the property so clients see the value
    pub fn set_output_non_desktop(&mut self, id: OutputId, non_desktop: bool) -> RrResult<()> {
        let atom = self.atoms.make(NON_DESKTOP);
        let value = u32::from(non_desktop).to_ne_bytes();
        self.change_property(
            PropertyOwner::Output(id),
            atom,
            XA_INTEGER,
            32,
            PropMode::Replace,
            &value,
            true,
            false,
        )
    }

    /// Remove an output. Leases holding it end first.
    pub fn destroy_output(&mut self, id: OutputId) -> RrResult<()> {
        let (screen, index) = self.find_output(id)?;

        let holders: Vec<_> = self
            .screen(screen)
            .leases
            .iter()
            .filter(|l| l.outputs.contains(&id))
            .map(|l| l.key)
            .collect();
        for lease in holders {
            self.terminate_lease(screen, lease);
        }

        let scr = self.screen_mut(screen);
        if scr.primary_output == Some(id) {
            scr.primary_output = None;
        }
        for crtc in scr.crtcs.iter_mut().filter(|c| c.outputs.contains(&id)) {
            crtc.outputs.retain(|&o| o != id);
            crtc.changed = true;
        }
        scr.outputs.remove(index);
        let holder = self.primary_of(screen).unwrap_or(screen);
        for monitor in self.screen_mut(holder).monitors.iter_mut() {
            monitor.outputs.retain(|&o| o != id);
        }
        self.resources.free(id.0);
        self.modes.release_unused(&mut self.resources);
        self.set_changed(screen, ScreenChanges::RESOURCES);
        log::debug!("output {:#x} destroyed", id.0);
        Ok(())
    }

    pub fn output_info(&self, id: OutputId) -> RrResult<OutputInfo> {
        let output = self.output(id)?;
        let timestamp = self.screen(output.screen).last_set_time;
        if self.output_is_leased(id) {
            return Ok(OutputInfo {
                timestamp,
                crtc: None,
                mm_width: 0,
                mm_height: 0,
                connection: Connection::Disconnected,
                subpixel: SubpixelOrder::Unknown,
                crtcs: Vec::new(),
                modes: Vec::new(),
                num_preferred: 0,
                clones: Vec::new(),
                name: output.name.clone(),
            });
        }
        Ok(OutputInfo {
            timestamp,
            crtc: output.crtc,
            mm_width: output.mm_width,
            mm_height: output.mm_height,
            connection: output.visible_connection(),
            subpixel: output.subpixel,
            crtcs: output.crtcs.clone(),
            modes: output.modes.iter().map(|m| m.id).collect(),
            num_preferred: output.num_preferred as u16,
            clones: output.clones.clone(),
            name: output.name.clone(),
        })
    }

    fn set_primary_output_on(&mut self, screen: ScreenId, output: Option<OutputId>) {
        let old = self.screen(screen).primary_output;
        if old == output {
            return;
        }
        if let Some(old) = old {
            let _ = self.output_changed(old, false);
        }
        self.screen_mut(screen).primary_output = output;
        if let Some(new) = output {
            let _ = self.output_changed(new, false);
        }
        self.set_changed(screen, ScreenChanges::LAYOUT);
        self.tell_changed(screen);
    }

    /// SetOutputPrimary for the screen owning `window`'s root
    pub fn set_output_primary(&mut self, screen: ScreenId, output: Option<OutputId>) -> RrResult<()> {
        if let Some(id) = output {
            let owner = self.output(id)?.screen;
            if self.output_is_leased(id) {
                return Err(RrError::Access(id.0));
            }
            let owner_screen = self.screen(owner);
            let matches = if owner_screen.is_gpu {
                owner_screen.current_primary == Some(screen)
            } else {
                owner == screen
            };
            if !matches {
                return Err(RrError::Match(self.screen(screen).root.0));
            }
        }

        self.set_primary_output_on(screen, output);
        for secondary in self.output_secondaries(screen) {
            self.set_primary_output_on(secondary, output);
        }
        Ok(())
    }

    pub fn output_primary(&self, screen: ScreenId) -> Option<OutputId> {
        self.screen(screen).primary_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NotifyMask;
    use crate::property::ANY_PROPERTY_TYPE;
    use crate::testing::{Rig, CONNECTED};

    #[test]
    fn test_new_output_carries_non_desktop_property() {
        let mut rig = Rig::new(1920, 1080);
        let output = rig.randr.create_output(rig.screen, "HDMI-1").unwrap();
        let atom = rig.randr.atoms.get_id(NON_DESKTOP).unwrap();

        let prop = rig.randr.query_property(PropertyOwner::Output(output), atom).unwrap();
        assert_eq!(prop.valid_values, vec![0, 1]);
        let read = rig
            .randr
            .get_property(PropertyOwner::Output(output), atom, ANY_PROPERTY_TYPE, 0, 1, false, false)
            .unwrap();
        assert_eq!(read.type_, XA_INTEGER);
        assert_eq!(read.data, 0u32.to_ne_bytes());
        assert!(rig.randr.screen(rig.screen).changes.contains(ScreenChanges::RESOURCES));
    }

    #[test]
    fn test_non_desktop_output_reports_disconnected() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        let output = rig.add_output("DP-1", CONNECTED, &[crtc], 1920, 1080);
        rig.randr.set_output_non_desktop(output, true).unwrap();

        let info = rig.randr.output_info(output).unwrap();
        assert_eq!(info.connection, Connection::Disconnected);
        assert_eq!(info.modes.len(), 1);
        assert!(rig.randr.output(output).unwrap().non_desktop);
    }

    #[test]
    fn test_setters_only_mark_real_changes() {
        let mut rig = Rig::new(1920, 1080);
        let output = rig.randr.create_output(rig.screen, "VGA-1").unwrap();
        rig.randr.tell_changed(rig.screen);
        rig.randr.take_events();

        rig.randr.set_output_connection(output, Connection::Unknown).unwrap();
        rig.randr.set_output_physical_size(output, 0, 0).unwrap();
        assert!(!rig.randr.output(output).unwrap().changed);

        rig.randr.set_output_connection(output, CONNECTED).unwrap();
        assert!(rig.randr.output(output).unwrap().changed);
        rig.randr.tell_changed(rig.screen);
        let events = rig.randr.take_events();
        assert!(events.iter().any(|e| e.notify.mask() == NotifyMask::OUTPUT_CHANGE));
        assert!(!rig.randr.output(output).unwrap().changed);
    }

    #[test]
    fn test_destroy_clears_primary_and_frees_id() {
        let mut rig = Rig::new(1920, 1080);
        let crtc = rig.add_crtc();
        let output = rig.add_output("eDP-1", CONNECTED, &[crtc], 1920, 1080);
        rig.randr.set_output_primary(rig.screen, Some(output)).unwrap();
        assert_eq!(rig.randr.output_primary(rig.screen), Some(output));

        rig.randr.destroy_output(output).unwrap();
        assert_eq!(rig.randr.output_primary(rig.screen), None);
        assert_eq!(rig.randr.output(output).unwrap_err(), RrError::Output(output.0));
        assert!(rig.randr.modes.is_empty());
    }

    #[test]
    fn test_primary_from_other_screen_is_match() {
        let mut rig = Rig::new(1920, 1080);
        let other = rig.add_plain_screen(1024, 768);
        let output = rig.randr.create_output(other, "LVDS-1").unwrap();
        let err = rig.randr.set_output_primary(rig.screen, Some(output)).unwrap_err();
        assert_eq!(err, RrError::Match(rig.randr.screen(rig.screen).root.0));
    }
}
