//! Exclusive hand-off of crtcs and outputs to a single client

use crate::driver::{DriverError, LeaseRequest, LeaseTermination};
use crate::error::{RrError, RrResult};
use crate::event::Notify;
use crate::resource::ResourceKind;
use crate::screen::{Randr, ScreenChanges};
use crate::types::{CrtcId, LeaseId, OutputId, ScreenId, Timestamp};
use std::os::fd::OwnedFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Creating,
    Running,
    Terminating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Client chosen id, kept after the resource is released
    pub key: LeaseId,
    /// Registered resource id; gone once freed
    pub id: Option<LeaseId>,
    pub screen: ScreenId,
    pub state: LeaseState,
    pub crtcs: Vec<CrtcId>,
    pub outputs: Vec<OutputId>,
}

impl Lease {
    pub fn holds_crtc(&self, crtc: CrtcId) -> bool {
        self.crtcs.contains(&crtc)
    }

    pub fn holds_output(&self, output: OutputId) -> bool {
        self.outputs.contains(&output)
    }

    /// Listeners hear about leases being created or torn down, and only
    /// while the lease still has its id
    pub(crate) fn notify(&self, timestamp: Timestamp) -> Option<Notify> {
        let lease = self.id?;
        let created = match self.state {
            LeaseState::Creating => true,
            LeaseState::Terminating => false,
            LeaseState::Running => return None,
        };
        Some(Notify::Lease {
            timestamp,
            lease,
            created,
        })
    }
}

impl Randr {
    pub fn crtc_is_leased(&self, crtc: CrtcId) -> bool {
        let Ok((screen, _)) = self.find_crtc(crtc) else {
            return false;
        };
        self.screen(screen).leases.iter().any(|l| l.holds_crtc(crtc))
    }

    pub fn output_is_leased(&self, output: OutputId) -> bool {
        let Ok((screen, _)) = self.find_output(output) else {
            return false;
        };
        self.screen(screen).leases.iter().any(|l| l.holds_output(output))
    }

    pub fn leases(&self, screen: ScreenId) -> &[Lease] {
        &self.screen(screen).leases
    }

    fn lease_index(&self, screen: ScreenId, key: LeaseId) -> Option<usize> {
        self.screen(screen).leases.iter().position(|l| l.key == key)
    }

    /// Announce a lease as `shown`, then settle it in `state`
    fn change_lease_state(&mut self, screen: ScreenId, index: usize, shown: LeaseState, state: LeaseState) {
        self.screen_mut(screen).leases[index].state = shown;
        self.set_changed(screen, ScreenChanges::LEASES);
        self.tell_changed(screen);
        if let Some(primary) = self.primary_of(screen) {
            self.screen_mut(primary).changes.remove(ScreenChanges::LEASES);
        }
        self.screen_mut(screen).changes.remove(ScreenChanges::LEASES);
        self.screen_mut(screen).leases[index].state = state;
    }

    /// CreateLease: every resource must belong to `screen` and be free.
    /// Nothing is registered unless the driver hands over a descriptor.
    pub fn create_lease(
        &mut self,
        screen: ScreenId,
        id: LeaseId,
        crtcs: &[CrtcId],
        outputs: &[OutputId],
    ) -> RrResult<OwnedFd> {
        if self.resources.contains(id.0) {
            return Err(RrError::IdChoice(id.0));
        }
        for &crtc in crtcs {
            let (owner, _) = self.find_crtc(crtc)?;
            if owner != screen {
                return Err(RrError::Match(crtc.0));
            }
            if self.crtc_is_leased(crtc) {
                return Err(RrError::Access(crtc.0));
            }
        }
        for &output in outputs {
            let (owner, _) = self.find_output(output)?;
            if owner != screen {
                return Err(RrError::Match(output.0));
            }
            if self.output_is_leased(output) {
                return Err(RrError::Access(output.0));
            }
        }

        let request = LeaseRequest {
            lease: id,
            crtcs,
            outputs,
        };
        let fd = match self.screen_mut(screen).driver.create_lease(&request) {
            Ok(fd) => fd,
            Err(DriverError::NotImplemented) => return Err(RrError::Match(id.0)),
            Err(err) => {
                log::warn!("lease {:#x} refused: {}", id.0, err);
                return Err(RrError::Match(id.0));
            }
        };

        self.resources.add(id.0, ResourceKind::Lease, Some(screen))?;
        let leases = &mut self.screen_mut(screen).leases;
        leases.push(Lease {
            key: id,
            id: Some(id),
            screen,
            state: LeaseState::Creating,
            crtcs: crtcs.to_vec(),
            outputs: outputs.to_vec(),
        });
        let index = leases.len() - 1;
        self.change_lease_state(screen, index, LeaseState::Creating, LeaseState::Running);
        log::info!(
            "lease {:#x} running: {} crtcs, {} outputs",
            id.0,
            crtcs.len(),
            outputs.len()
        );
        Ok(fd)
    }

    /// Ask the driver to take the resources back
    pub fn terminate_lease(&mut self, screen: ScreenId, key: LeaseId) {
        if self.lease_index(screen, key).is_none() {
            return;
        }
        match self.screen_mut(screen).driver.terminate_lease(key) {
            Ok(LeaseTermination::Immediate) | Err(DriverError::NotImplemented) => self.lease_terminated(screen, key),
            Ok(LeaseTermination::Deferred) => log::debug!("lease {:#x} termination deferred", key.0),
            Err(err) => {
                log::warn!("lease {:#x}: driver termination failed: {}", key.0, err);
                self.lease_terminated(screen, key);
            }
        }
    }

    /// The driver has the resources back; drop the lease
    pub fn lease_terminated(&mut self, screen: ScreenId, key: LeaseId) {
        let Some(index) = self.lease_index(screen, key) else {
            return;
        };
        if self.screen(screen).leases[index].state == LeaseState::Running {
            self.change_lease_state(screen, index, LeaseState::Terminating, LeaseState::Terminating);
        }
        let lease = self.screen_mut(screen).leases.remove(index);
        if let Some(id) = lease.id {
            self.resources.free(id.0);
        }
        log::info!("lease {:#x} terminated", key.0);
    }

    /// FreeLease. Without `terminate` only the id goes away, quietly,
    /// and the driver is still asked to end the lease.
    pub fn free_lease(&mut self, id: LeaseId, terminate: bool) -> RrResult<()> {
        let screen = self
            .resources
            .lookup(id.0, ResourceKind::Lease)?
            .ok_or(RrError::Lease(id.0))?;
        let index = self.lease_index(screen, id).ok_or(RrError::Lease(id.0))?;
        if !terminate {
            self.screen_mut(screen).leases[index].id = None;
            self.resources.free(id.0);
        }
        self.terminate_lease(screen, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crtc::CrtcConfig;
    use crate::event::NotifyMask;
    use crate::property::PropertyOwner;
    use crate::testing::{Call, Rig, CONNECTED};
    use crate::types::Timestamp;

    fn lease_events(rig: &mut Rig) -> Vec<bool> {
        rig.randr
            .take_events()
            .into_iter()
            .filter_map(|e| match e.notify {
                Notify::Lease { created, .. } => Some(created),
                _ => None,
            })
            .collect()
    }

    fn leasing_rig() -> (Rig, CrtcId, OutputId) {
        let mut rig = Rig::new(1920, 1080);
        rig.behave(|b| b.leases = true);
        let crtc = rig.add_crtc();
        let output = rig.add_output("HMD-1", CONNECTED, &[crtc], 2160, 1200);
        rig.randr.take_events();
        (rig, crtc, output)
    }

    #[test]
    fn test_lease_is_exclusive() {
        let (mut rig, crtc, output) = leasing_rig();
        let screen = rig.screen;
        rig.randr.create_lease(screen, LeaseId(0x20_0001), &[crtc], &[output]).unwrap();
        assert_eq!(lease_events(&mut rig), vec![true]);
        assert!(rig.randr.crtc_is_leased(crtc));
        assert!(rig.randr.output_is_leased(output));

        let err = rig
            .randr
            .create_lease(screen, LeaseId(0x20_0002), &[crtc], &[])
            .unwrap_err();
        assert_eq!(err, RrError::Access(crtc.0));
        let lease = &rig.randr.leases(screen)[0];
        assert_eq!(lease.state, LeaseState::Running);
        assert_eq!((lease.crtcs.clone(), lease.outputs.clone()), (vec![crtc], vec![output]));
    }

    #[test]
    fn test_refused_lease_leaves_no_trace() {
        let (mut rig, crtc, output) = leasing_rig();
        rig.behave(|b| b.leases = false);
        let id = LeaseId(0x20_0001);
        assert_eq!(
            rig.randr.create_lease(rig.screen, id, &[crtc], &[output]).unwrap_err(),
            RrError::Match(id.0)
        );
        assert!(!rig.randr.crtc_is_leased(crtc));
        assert!(!rig.randr.resources.contains(id.0));
        assert!(rig.randr.take_events().is_empty());
    }

    #[test]
    fn test_lease_id_must_be_unused() {
        let (mut rig, crtc, _) = leasing_rig();
        let taken = LeaseId(crtc.0);
        assert_eq!(
            rig.randr.create_lease(rig.screen, taken, &[], &[]).unwrap_err(),
            RrError::IdChoice(crtc.0)
        );
    }

    #[test]
    fn test_leased_resources_are_read_only() {
        let (mut rig, crtc, output) = leasing_rig();
        rig.randr.create_lease(rig.screen, LeaseId(0x20_0001), &[crtc], &[output]).unwrap();

        let config = CrtcConfig {
            crtc,
            timestamp: Timestamp(0),
            mode: None,
            x: 0,
            y: 0,
            rotation: 1,
            outputs: &[],
        };
        assert_eq!(rig.randr.set_crtc_config(&config).unwrap_err(), RrError::Access(crtc.0));
        assert_eq!(rig.randr.crtc_info(crtc).unwrap().possible, Vec::new());
        assert_eq!(rig.randr.crtc_info(crtc).unwrap().rotations, crate::types::Rotation::ROTATE_0);

        let name = rig.randr.atoms.make("EDID");
        let owner = PropertyOwner::Output(output);
        assert_eq!(
            rig.randr.change_property_request(owner, name, 19, 8, 0, &[1]),
            Err(RrError::Access(name))
        );
        assert_eq!(
            rig.randr.set_output_primary(rig.screen, Some(output)),
            Err(RrError::Access(output.0))
        );
        assert!(rig.randr.output_info(output).unwrap().modes.is_empty());
    }

    #[test]
    fn test_free_with_terminate_announces_end() {
        let (mut rig, crtc, output) = leasing_rig();
        let id = LeaseId(0x20_0001);
        rig.randr.create_lease(rig.screen, id, &[crtc], &[output]).unwrap();
        rig.randr.take_events();

        rig.randr.free_lease(id, true).unwrap();
        assert_eq!(lease_events(&mut rig), vec![false]);
        assert!(rig.calls().contains(&Call::TerminateLease(id)));
        assert!(!rig.randr.crtc_is_leased(crtc));
        assert_eq!(rig.randr.free_lease(id, true).unwrap_err(), RrError::Lease(id.0));
    }

    #[test]
    fn test_free_without_terminate_is_quiet() {
        let (mut rig, crtc, _) = leasing_rig();
        let id = LeaseId(0x20_0001);
        rig.randr.create_lease(rig.screen, id, &[crtc], &[]).unwrap();
        rig.randr.take_events();

        rig.randr.free_lease(id, false).unwrap();
        assert!(lease_events(&mut rig).is_empty());
        assert!(rig.randr.leases(rig.screen).is_empty());
        assert!(!rig.randr.resources.contains(id.0));
    }

    #[test]
    fn test_deferred_termination_finishes_later() {
        let (mut rig, crtc, _) = leasing_rig();
        rig.behave(|b| b.deferred_termination = true);
        let id = LeaseId(0x20_0001);
        rig.randr.create_lease(rig.screen, id, &[crtc], &[]).unwrap();

        rig.randr.free_lease(id, true).unwrap();
        assert!(rig.randr.crtc_is_leased(crtc));

        rig.randr.take_events();
        rig.randr.lease_terminated(rig.screen, id);
        assert!(!rig.randr.crtc_is_leased(crtc));
        let events = rig.randr.take_events();
        assert!(events.iter().any(|e| e.notify.mask() == NotifyMask::LEASE));
    }

    #[test]
    fn test_destroying_crtc_terminates_its_lease_first() {
        let (mut rig, crtc, _) = leasing_rig();
        let id = LeaseId(0x20_0001);
        rig.randr.create_lease(rig.screen, id, &[crtc], &[]).unwrap();
        rig.clear_calls();

        rig.randr.destroy_crtc(crtc).unwrap();
        assert_eq!(rig.calls().first(), Some(&Call::TerminateLease(id)));
        assert!(rig.randr.leases(rig.screen).is_empty());
        assert_eq!(rig.randr.crtc(crtc).unwrap_err(), RrError::Crtc(crtc.0));
    }
}
