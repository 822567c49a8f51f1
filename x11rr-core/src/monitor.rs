//! Client-visible monitors
//!
//! A monitor is either declared by a client (a name, a box and a set of
//! outputs) or synthesized from an enabled crtc that no declared monitor
//! covers. `get_monitors` merges both into one list with a single primary.

use crate::crtc::Crtc;
use crate::error::{RrError, RrResult};
use crate::screen::{Randr, Screen, ScreenChanges};
use crate::types::{Atom, Bounds, CrtcId, OutputId, ScreenId, Timestamp};

const DEFAULT_PIXELS_PER_MM: f64 = 96.0 / 25.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorGeometry {
    pub bounds: Bounds,
    pub mm_width: u32,
    pub mm_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub name: Atom,
    pub screen: ScreenId,
    pub outputs: Vec<OutputId>,
    pub primary: bool,
    /// Geometry follows the crtcs instead of a declared box
    pub automatic: bool,
    pub geometry: MonitorGeometry,
}

impl Monitor {
    /// A declared monitor. An all-zero box asks for the geometry to be
    /// derived from the crtcs driving `outputs`.
    pub fn declared(name: Atom, screen: ScreenId, outputs: Vec<OutputId>, primary: bool, geometry: MonitorGeometry) -> Self {
        Self {
            name,
            screen,
            outputs,
            primary,
            automatic: geometry.bounds.is_zero(),
            geometry,
        }
    }
}

/// Area and physical size of a crtc; panning wins when active
fn crtc_geometry(screen: &Screen, crtc: &Crtc) -> MonitorGeometry {
    let panned = screen
        .driver
        .get_panning(crtc.id)
        .ok()
        .map(|p| p.total)
        .filter(|total| !total.is_empty());
    let bounds = panned.unwrap_or_else(|| {
        let (width, height) = crtc.scanout_size();
        Bounds::from_size(crtc.x, crtc.y, width, height)
    });

    let first = crtc.outputs.first().and_then(|&o| screen.output(o));
    let (mm_width, mm_height) = match first {
        Some(o) if o.mm_width != 0 && o.mm_height != 0 => (o.mm_width, o.mm_height),
        _ => (
            (bounds.width() as f64 / DEFAULT_PIXELS_PER_MM + 0.5).floor() as u32,
            (bounds.height() as f64 / DEFAULT_PIXELS_PER_MM + 0.5).floor() as u32,
        ),
    };
    MonitorGeometry {
        bounds,
        mm_width,
        mm_height,
    }
}

impl Randr {
    /// Declared monitors' box; automatic ones cover their live crtcs
    pub fn monitor_geometry(&self, monitor: &Monitor) -> MonitorGeometry {
        if !monitor.geometry.bounds.is_zero() || monitor.outputs.is_empty() {
            return monitor.geometry;
        }
        let screen = self.screen(monitor.screen);
        let mut geometry = MonitorGeometry::default();
        let mut first = MonitorGeometry::default();
        let mut last = MonitorGeometry::default();
        let mut active = 0;

        for output in &monitor.outputs {
            let Some(crtc) = screen
                .crtcs
                .iter()
                .find(|c| c.is_enabled() && c.outputs.contains(output))
            else {
                continue;
            };
            last = crtc_geometry(screen, crtc);
            if active == 0 {
                first = last;
                geometry = last;
            } else {
                geometry.bounds = geometry.bounds.union(&last.bounds);
            }
            active += 1;
        }

        // Physical size extrapolates from the last crtc seen
        if active > 1 && first.bounds.width() != 0 && first.bounds.height() != 0 {
            geometry.mm_width = (last.bounds.width() / first.bounds.width()) as u32 * first.mm_width;
            geometry.mm_height = (last.bounds.height() / first.bounds.height()) as u32 * first.mm_height;
        }
        geometry
    }

    fn crtc_name(&mut self, screen: ScreenId, crtc: CrtcId) -> Atom {
        let first = self
            .screen(screen)
            .crtc(crtc)
            .and_then(|c| c.outputs.first())
            .and_then(|&o| self.screen(screen).output(o))
            .map(|o| o.name.clone());
        let name = first.unwrap_or_else(|| format!("Monitor-{:08x}", crtc.0));
        self.atoms.make(&name)
    }

    /// `main` holds the primary output for itself and its secondaries
    fn crtc_drives_primary(&self, main: ScreenId, crtc: &Crtc) -> bool {
        match self.screen(main).primary_output {
            Some(primary) => crtc.outputs.contains(&primary),
            None => false,
        }
    }

    fn monitor_from_crtc(&mut self, main: ScreenId, screen: ScreenId, crtc: CrtcId) -> Option<Monitor> {
        let name = self.crtc_name(screen, crtc);
        let scr = self.screen(screen);
        let c = scr.crtc(crtc)?;
        Some(Monitor {
            name,
            screen: main,
            outputs: c.outputs.clone(),
            primary: self.crtc_drives_primary(main, c),
            automatic: true,
            geometry: crtc_geometry(scr, c),
        })
    }

    fn monitor_is_active(&self, monitor: &Monitor) -> bool {
        let geometry = self.monitor_geometry(monitor);
        geometry.bounds.width() != 0 && geometry.bounds.height() != 0
    }

    /// GetMonitors: the primary first, then declared monitors, then one
    /// per uncovered enabled crtc. With `get_active`, declared monitors
    /// without area are left out.
    pub fn get_monitors(&mut self, screen: ScreenId, get_active: bool) -> (Timestamp, Vec<Monitor>) {
        let mut candidates: Vec<Option<(ScreenId, CrtcId)>> = Vec::new();
        for s in self.with_output_secondaries(screen) {
            candidates.extend(
                self.screen(s)
                    .crtcs
                    .iter()
                    .filter(|c| c.is_enabled())
                    .map(|c| Some((s, c.id))),
            );
        }

        let declared = self.screen(screen).monitors.clone();
        let mut active = Vec::with_capacity(declared.len());
        let mut client_primary = None;
        for (index, monitor) in declared.iter().enumerate() {
            if get_active && !self.monitor_is_active(monitor) {
                continue;
            }
            active.push(index);
            if monitor.primary && client_primary.is_none() {
                client_primary = Some(index);
            }
            for slot in candidates.iter_mut() {
                let covered = slot
                    .and_then(|(s, c)| self.screen(s).crtc(c))
                    .is_some_and(|crtc| crtc.outputs.iter().any(|o| monitor.outputs.contains(o)));
                if covered {
                    *slot = None;
                }
            }
        }

        let server_primary = candidates.iter().position(|slot| {
            slot.and_then(|(s, c)| self.screen(s).crtc(c).map(|crtc| self.crtc_drives_primary(screen, crtc)))
                .unwrap_or(false)
        });

        let mut monitors = Vec::new();
        let declared_monitor = |this: &Randr, index: usize| {
            let monitor = &declared[index];
            Monitor {
                geometry: this.monitor_geometry(monitor),
                ..monitor.clone()
            }
        };
        if let Some(index) = client_primary {
            monitors.push(declared_monitor(self, index));
        } else if let Some((s, c)) = server_primary.and_then(|i| candidates[i]) {
            monitors.extend(self.monitor_from_crtc(screen, s, c));
        }

        let mut has_primary = monitors.first().is_some_and(|m| m.primary);
        let mut push = |monitors: &mut Vec<Monitor>, mut monitor: Monitor| {
            if has_primary {
                monitor.primary = false;
            } else if monitor.primary {
                has_primary = true;
            }
            monitors.push(monitor);
        };

        for &index in &active {
            if Some(index) != client_primary {
                push(&mut monitors, declared_monitor(self, index));
            }
        }
        for (i, slot) in candidates.iter().enumerate() {
            if client_primary.is_none() && Some(i) == server_primary {
                continue;
            }
            if let Some((s, c)) = *slot {
                if let Some(monitor) = self.monitor_from_crtc(screen, s, c) {
                    push(&mut monitors, monitor);
                }
            }
        }

        (self.screen(screen).last_config_time, monitors)
    }

    /// SetMonitor. Outputs claimed by the new monitor leave older ones;
    /// a monitor that loses its last output that way is deleted. Monitors
    /// declared without outputs are left alone.
    pub fn set_monitor(&mut self, screen: ScreenId, monitor: Monitor) -> RrResult<()> {
        let Some(name) = self.atoms.get_name(monitor.name).map(str::to_string) else {
            return Err(RrError::Atom(monitor.name));
        };
        for s in self.with_output_secondaries(screen) {
            if self.screen(s).outputs.iter().any(|o| o.name == name) {
                return Err(RrError::Atom(monitor.name));
            }
        }
        let existing = &mut self.screen_mut(screen).monitors;
        if existing.iter().any(|m| m.name == monitor.name) {
            return Err(RrError::Atom(monitor.name));
        }

        existing.retain_mut(|m| {
            let had_outputs = !m.outputs.is_empty();
            m.outputs.retain(|o| !monitor.outputs.contains(o));
            if monitor.primary {
                m.primary = false;
            }
            !had_outputs || !m.outputs.is_empty()
        });
        log::debug!("monitor {} ({}) set on screen {}", name, monitor.name, screen.0);
        existing.push(Monitor { screen, ..monitor });
        self.monitors_changed(screen);
        Ok(())
    }

    /// DeleteMonitor. An unknown name is BadValue.
    pub fn delete_monitor(&mut self, screen: ScreenId, name: Atom) -> RrResult<()> {
        if !self.atoms.is_valid(name) {
            return Err(RrError::Atom(name));
        }
        let monitors = &mut self.screen_mut(screen).monitors;
        let index = monitors
            .iter()
            .position(|m| m.name == name)
            .ok_or(RrError::Value(name))?;
        monitors.remove(index);
        self.monitors_changed(screen);
        Ok(())
    }

    /// Root listeners re-read the monitor list on a screen change
    fn monitors_changed(&mut self, screen: ScreenId) {
        self.set_changed(screen, ScreenChanges::empty());
        self.tell_changed(screen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NotifyMask;
    use crate::testing::{Rig, CONNECTED};

    fn two_heads() -> (Rig, [CrtcId; 2], [OutputId; 2]) {
        let mut rig = Rig::new(3840, 1080);
        let left = rig.add_crtc();
        let right = rig.add_crtc();
        let a = rig.add_output("DP-1", CONNECTED, &[left], 1920, 1080);
        let b = rig.add_output("DP-2", CONNECTED, &[right], 1920, 1080);
        rig.enable(left, 0, 0, &[a]);
        rig.enable(right, 1920, 0, &[b]);
        (rig, [left, right], [a, b])
    }

    fn declare(rig: &mut Rig, name: &str, outputs: &[OutputId], primary: bool) -> RrResult<Atom> {
        let atom = rig.randr.atoms.make(name);
        let monitor = Monitor::declared(atom, rig.screen, outputs.to_vec(), primary, MonitorGeometry::default());
        rig.randr.set_monitor(rig.screen, monitor).map(|()| atom)
    }

    #[test]
    fn test_one_monitor_per_enabled_crtc() {
        let (mut rig, _, [a, b]) = two_heads();
        rig.randr.set_output_primary(rig.screen, Some(b)).unwrap();

        let (_, monitors) = rig.randr.get_monitors(rig.screen, true);
        assert_eq!(monitors.len(), 2);
        assert_eq!(monitors[0].outputs, vec![b]);
        assert!(monitors[0].primary);
        assert_eq!(monitors[1].outputs, vec![a]);
        assert!(!monitors[1].primary);
        assert_eq!(rig.randr.atoms.get_name(monitors[1].name), Some("DP-1"));
        assert_eq!(monitors[1].geometry.bounds, Bounds::new(0, 0, 1920, 1080));
        assert_eq!(monitors[1].geometry.mm_width, 508);
    }

    #[test]
    fn test_automatic_monitor_covers_both_crtcs() {
        let (mut rig, _, [a, b]) = two_heads();
        declare(&mut rig, "wall", &[a, b], false).unwrap();

        let (_, monitors) = rig.randr.get_monitors(rig.screen, true);
        assert_eq!(monitors.len(), 1);
        assert!(monitors[0].automatic);
        assert_eq!(monitors[0].geometry.bounds, Bounds::new(0, 0, 3840, 1080));
    }

    #[test]
    fn test_names_must_be_unique() {
        let (mut rig, _, [a, b]) = two_heads();
        assert_eq!(
            declare(&mut rig, "DP-1", &[a], false),
            Err(RrError::Atom(rig.randr.atoms.get_id("DP-1").unwrap()))
        );
        let left = declare(&mut rig, "left", &[a], false).unwrap();
        assert_eq!(declare(&mut rig, "left", &[b], false), Err(RrError::Atom(left)));
        assert_eq!(rig.randr.screen(rig.screen).monitors.len(), 1);
        assert_eq!(rig.randr.screen(rig.screen).monitors[0].outputs, vec![a]);
    }

    #[test]
    fn test_superset_replaces_older_monitor_and_primary() {
        let (mut rig, _, [a, b]) = two_heads();
        let left = declare(&mut rig, "left", &[a], true).unwrap();
        let right = declare(&mut rig, "right", &[b], false).unwrap();
        let wall = declare(&mut rig, "wall", &[a, b], false).unwrap();

        let (_, monitors) = rig.randr.get_monitors(rig.screen, false);
        let names: Vec<_> = monitors.iter().map(|m| m.name).collect();
        assert_eq!(names, vec![wall]);
        assert!(!names.contains(&left) && !names.contains(&right));
        assert!(!monitors[0].primary);
    }

    #[test]
    fn test_new_primary_demotes_others() {
        let (mut rig, _, [a, b]) = two_heads();
        declare(&mut rig, "left", &[a], true).unwrap();
        let right = declare(&mut rig, "right", &[b], true).unwrap();

        let (_, monitors) = rig.randr.get_monitors(rig.screen, false);
        assert_eq!(monitors.len(), 2);
        assert_eq!(monitors[0].name, right);
        assert_eq!(monitors.iter().filter(|m| m.primary).count(), 1);
    }

    #[test]
    fn test_inactive_monitor_only_hidden_when_asked() {
        let (mut rig, [_, right], [a, b]) = two_heads();
        rig.randr.crtc_set(right, None, 0, 0, crate::types::Rotation::ROTATE_0, &[]).unwrap();
        declare(&mut rig, "dark", &[b], false).unwrap();

        let (_, active) = rig.randr.get_monitors(rig.screen, true);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].outputs, vec![a]);
        let (_, all) = rig.randr.get_monitors(rig.screen, false);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_outputless_monitor_survives_unrelated_add() {
        let (mut rig, _, [a, _]) = two_heads();
        let atom = rig.randr.atoms.make("virtual");
        let geometry = MonitorGeometry {
            bounds: Bounds::new(0, 0, 800, 600),
            mm_width: 211,
            mm_height: 158,
        };
        let virt = Monitor::declared(atom, rig.screen, vec![], false, geometry);
        rig.randr.set_monitor(rig.screen, virt).unwrap();
        let left = declare(&mut rig, "left", &[a], false).unwrap();

        let (_, monitors) = rig.randr.get_monitors(rig.screen, true);
        let names: Vec<_> = monitors.iter().map(|m| m.name).collect();
        assert!(names.contains(&atom));
        assert!(names.contains(&left));
        let virt = monitors.iter().find(|m| m.name == atom).unwrap();
        assert!(!virt.automatic);
        assert_eq!(virt.geometry, geometry);
    }

    #[test]
    fn test_zero_box_over_disabled_crtcs_has_no_area() {
        let (mut rig, [left, right], [a, b]) = two_heads();
        for crtc in [left, right] {
            rig.randr.crtc_set(crtc, None, 0, 0, crate::types::Rotation::ROTATE_0, &[]).unwrap();
        }
        let dark = declare(&mut rig, "dark", &[a, b], false).unwrap();

        let (_, active) = rig.randr.get_monitors(rig.screen, true);
        assert!(active.is_empty());
        let (_, all) = rig.randr.get_monitors(rig.screen, false);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, dark);
        assert!(all[0].automatic);
        assert_eq!(all[0].geometry, MonitorGeometry::default());
    }

    #[test]
    fn test_destroyed_output_leaves_monitor() {
        let (mut rig, _, [a, b]) = two_heads();
        let wall = declare(&mut rig, "wall", &[a, b], false).unwrap();
        rig.randr.destroy_output(b).unwrap();

        let (_, monitors) = rig.randr.get_monitors(rig.screen, true);
        assert_eq!(monitors[0].name, wall);
        assert_eq!(monitors[0].outputs, vec![a]);
        assert_eq!(monitors[0].geometry.bounds, Bounds::new(0, 0, 1920, 1080));
    }

    #[test]
    fn test_monitor_changes_raise_screen_event() {
        let (mut rig, _, [a, _]) = two_heads();
        rig.randr.take_events();
        let left = declare(&mut rig, "left", &[a], false).unwrap();
        let events = rig.randr.take_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.notify.mask() == NotifyMask::SCREEN_CHANGE)
                .count(),
            1
        );

        rig.randr.delete_monitor(rig.screen, left).unwrap();
        let events = rig.randr.take_events();
        assert!(events.iter().any(|e| e.notify.mask() == NotifyMask::SCREEN_CHANGE));

        assert!(declare(&mut rig, "DP-1", &[a], false).is_err());
        assert!(rig.randr.take_events().is_empty());
    }

    #[test]
    fn test_delete_unknown_monitor_is_value() {
        let (mut rig, _, [a, _]) = two_heads();
        let left = declare(&mut rig, "left", &[a], false).unwrap();
        rig.randr.delete_monitor(rig.screen, left).unwrap();
        assert_eq!(rig.randr.delete_monitor(rig.screen, left), Err(RrError::Value(left)));
        assert_eq!(rig.randr.delete_monitor(rig.screen, 0xffff), Err(RrError::Atom(0xffff)));
    }
}
