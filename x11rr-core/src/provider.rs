//! GPU providers and the PRIME links between screens
//!
//! Each screen has at most one provider. A sink provider scans out of its
//! output source's pixmaps; an offload source renders for its offload
//! sink. Linking a provider also moves its screen in the secondary graph.

use crate::atom::{PRIME_SYNC, XA_INTEGER};
use crate::driver::{self, DriverError, DriverResult};
use crate::error::{RrError, RrResult};
use crate::property::{PropMode, PropertyList, PropertyOwner};
use crate::resource::ResourceKind;
use crate::screen::{Randr, ScreenChanges};
use crate::types::{CrtcId, OutputId, ProviderId, ScreenId, Timestamp};
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProviderCapabilities: u32 {
        const SOURCE_OUTPUT = 1 << 0;
        const SINK_OUTPUT = 1 << 1;
        const SOURCE_OFFLOAD = 1 << 2;
        const SINK_OFFLOAD = 1 << 3;
    }
}

#[derive(Debug)]
pub struct Provider {
    pub id: ProviderId,
    pub screen: ScreenId,
    pub name: String,
    /// Fixed at creation
    pub capabilities: ProviderCapabilities,
    pub output_source: Option<ProviderId>,
    pub offload_sink: Option<ProviderId>,
    pub properties: PropertyList,
    pub pending_properties: bool,
    pub changed: bool,
}

/// GetProviderInfo reply body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub timestamp: Timestamp,
    pub capabilities: ProviderCapabilities,
    pub crtcs: Vec<CrtcId>,
    pub outputs: Vec<OutputId>,
    /// Linked providers and the role each plays for this one
    pub associated: Vec<(ProviderId, ProviderCapabilities)>,
    pub name: String,
}

/// Map a link hook result onto the protocol error
fn link_result(result: DriverResult<()>, id: ProviderId) -> RrResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(DriverError::NotImplemented) => Err(RrError::Match(id.0)),
        Err(err) => {
            log::warn!("provider {:#x}: {}", id.0, err);
            Err(RrError::Value(id.0))
        }
    }
}

impl Randr {
    pub(crate) fn find_provider(&self, id: ProviderId) -> RrResult<ScreenId> {
        let screen = self
            .resources
            .lookup(id.0, ResourceKind::Provider)?
            .ok_or(RrError::Provider(id.0))?;
        match &self.screen(screen).provider {
            Some(p) if p.id == id => Ok(screen),
            _ => Err(RrError::Provider(id.0)),
        }
    }

    pub fn provider(&self, id: ProviderId) -> RrResult<&Provider> {
        let screen = self.find_provider(id)?;
        self.screen(screen).provider.as_ref().ok_or(RrError::Provider(id.0))
    }

    pub fn provider_mut(&mut self, id: ProviderId) -> RrResult<&mut Provider> {
        let screen = self.find_provider(id)?;
        self.screen_mut(screen).provider.as_mut().ok_or(RrError::Provider(id.0))
    }

    pub fn create_provider(
        &mut self,
        screen: ScreenId,
        name: &str,
        capabilities: ProviderCapabilities,
    ) -> RrResult<ProviderId> {
        if self.screen(screen).provider.is_some() {
            return Err(RrError::Match(screen.0 as u32));
        }
        let id = ProviderId(self.resources.alloc(ResourceKind::Provider, Some(screen))?);
        self.screen_mut(screen).provider = Some(Provider {
            id,
            screen,
            name: name.to_string(),
            capabilities,
            output_source: None,
            offload_sink: None,
            properties: PropertyList::new(),
            pending_properties: false,
            changed: false,
        });
        self.set_changed(screen, ScreenChanges::RESOURCES);
        log::debug!("provider {:#x} {} on screen {} caps {:?}", id.0, name, screen.0, capabilities);
        Ok(id)
    }

    pub fn destroy_provider(&mut self, id: ProviderId) -> RrResult<()> {
        let screen = self.find_provider(id)?;
        driver::log_failure(self.screen_mut(screen).driver.provider_destroy(id), "destroy provider");

        // Screens linked through this provider, with the roles they lose
        let mut detached: Vec<(ScreenId, bool, bool)> = Vec::new();
        for scr in self.screens.iter_mut() {
            let Some(p) = scr.provider.as_mut() else {
                continue;
            };
            let (output, offload) = if p.id == id {
                (p.output_source.is_some(), p.offload_sink.is_some())
            } else {
                let output = p.output_source == Some(id);
                let offload = p.offload_sink == Some(id);
                if output {
                    p.output_source = None;
                }
                if offload {
                    p.offload_sink = None;
                }
                p.changed |= output || offload;
                (output, offload)
            };
            if output || offload {
                detached.push((scr.id, output, offload));
            }
        }

        let mut primaries = vec![screen];
        for &(s, output, offload) in &detached {
            primaries.extend(self.screen(s).current_primary);
            let scr = self.screen_mut(s);
            if offload {
                scr.is_offload_secondary = false;
            }
            if output {
                scr.is_output_secondary = false;
                self.fini_prime_sync_props(s);
            }
            self.unlink_secondary(s);
        }

        self.screen_mut(screen).provider = None;
        self.resources.free(id.0);
        primaries.dedup();
        for primary in primaries {
            self.set_changed(primary, ScreenChanges::RESOURCES);
            self.tell_changed(primary);
        }
        Ok(())
    }

    /// GetProviders: the screen's own provider, then its secondaries'
    pub fn providers(&self, screen: ScreenId) -> (Timestamp, Vec<ProviderId>) {
        let scr = self.screen(screen);
        let mut ids: Vec<ProviderId> = scr.provider.iter().map(|p| p.id).collect();
        for &s in &scr.secondaries {
            ids.extend(self.screen(s).provider.iter().map(|p| p.id));
        }
        (scr.last_set_time, ids)
    }

    pub fn provider_info(&self, id: ProviderId) -> RrResult<ProviderInfo> {
        let screen_id = self.find_provider(id)?;
        let screen = self.screen(screen_id);
        let provider = self.provider(id)?;

        let mut associated = Vec::new();
        if let Some(primary) = screen.current_primary {
            if let Some(p) = &self.screen(primary).provider {
                if screen.is_output_secondary {
                    associated.push((p.id, ProviderCapabilities::SOURCE_OUTPUT));
                }
                if screen.is_offload_secondary {
                    associated.push((p.id, ProviderCapabilities::SINK_OFFLOAD));
                }
            }
        }
        for &s in &screen.secondaries {
            let secondary = self.screen(s);
            let Some(p) = &secondary.provider else {
                continue;
            };
            if secondary.is_output_secondary {
                associated.push((p.id, ProviderCapabilities::SINK_OUTPUT));
            }
            if secondary.is_offload_secondary {
                associated.push((p.id, ProviderCapabilities::SOURCE_OFFLOAD));
            }
        }

        Ok(ProviderInfo {
            timestamp: screen.last_set_time,
            capabilities: provider.capabilities,
            crtcs: screen.crtcs.iter().map(|c| c.id).collect(),
            outputs: screen.outputs.iter().map(|o| o.id).collect(),
            associated,
            name: provider.name.clone(),
        })
    }

    /// Take `secondary` out of its primary's list once nothing links it
    fn unlink_secondary(&mut self, secondary: ScreenId) {
        let scr = self.screen(secondary);
        if scr.is_output_secondary || scr.is_offload_secondary {
            return;
        }
        if let Some(primary) = scr.current_primary {
            self.screen_mut(primary).secondaries.retain(|&s| s != secondary);
            self.screen_mut(secondary).current_primary = None;
        }
    }

    /// A screen still linked in its other role keeps its current primary
    fn check_link(&self, secondary: ScreenId, primary: ScreenId, other_role: bool) -> RrResult<()> {
        match self.screen(secondary).current_primary {
            Some(current) if other_role && current != primary => Err(RrError::Match(secondary.0 as u32)),
            _ => Ok(()),
        }
    }

    fn link_secondary(&mut self, secondary: ScreenId, primary: ScreenId) -> RrResult<()> {
        match self.screen(secondary).current_primary {
            Some(current) if current != primary => Err(RrError::Match(secondary.0 as u32)),
            Some(_) => Ok(()),
            None => self.attach_gpu_screen(secondary, primary),
        }
    }

    /// The sync property lets clients turn off synchronized sharing
    fn init_prime_sync_props(&mut self, screen: ScreenId) -> RrResult<()> {
        let atom = self.atoms.make(PRIME_SYNC);
        let outputs: Vec<OutputId> = self.screen(screen).outputs.iter().map(|o| o.id).collect();
        for id in outputs {
            let owner = PropertyOwner::Output(id);
            self.configure_property(owner, atom, true, false, false, &[0, 1])?;
            self.change_property(owner, atom, XA_INTEGER, 32, PropMode::Replace, &1u32.to_ne_bytes(), false, false)?;
        }
        Ok(())
    }

    fn fini_prime_sync_props(&mut self, screen: ScreenId) {
        let Some(atom) = self.atoms.get_id(PRIME_SYNC) else {
            return;
        };
        for output in self.screen_mut(screen).outputs.iter_mut() {
            output.properties.remove(atom);
        }
    }

    /// SetProviderOutputSource: `sink` scans out of `source`'s screen
    pub fn set_output_source(&mut self, sink: ProviderId, source: Option<ProviderId>) -> RrResult<()> {
        let sink_screen = self.find_provider(sink)?;
        let current = self.provider(sink)?;
        if !current.capabilities.contains(ProviderCapabilities::SINK_OUTPUT) {
            return Err(RrError::Value(sink.0));
        }
        let previous = current.output_source;
        let source_screen = match source {
            Some(source) => {
                let screen = self.find_provider(source)?;
                if !self.provider(source)?.capabilities.contains(ProviderCapabilities::SOURCE_OUTPUT) {
                    return Err(RrError::Value(source.0));
                }
                if !self.screen(sink_screen).is_gpu || self.screen(screen).is_gpu {
                    return Err(RrError::Match(source.0));
                }
                Some(screen)
            }
            None => None,
        };
        if previous == source {
            return Ok(());
        }
        if let Some(primary) = source_screen {
            let offload = self.screen(sink_screen).is_offload_secondary;
            self.check_link(sink_screen, primary, offload)?;
        }

        let hook = self.screen_mut(sink_screen).driver.provider_set_output_source(sink, source);
        link_result(hook, sink)?;

        let old_primary = self.screen(sink_screen).current_primary;
        self.screen_mut(sink_screen).is_output_secondary = false;
        self.unlink_secondary(sink_screen);
        match source_screen {
            Some(primary) => {
                self.link_secondary(sink_screen, primary)?;
                self.screen_mut(sink_screen).is_output_secondary = true;
                self.init_prime_sync_props(sink_screen)?;
            }
            None => self.fini_prime_sync_props(sink_screen),
        }

        self.provider_mut(sink)?.output_source = source;
        self.provider_mut(sink)?.changed = true;
        for peer in [previous, source].into_iter().flatten() {
            if let Ok(p) = self.provider_mut(peer) {
                p.changed = true;
            }
        }
        log::info!("provider {:#x} output source now {:?}", sink.0, source.map(|s| s.0));

        for primary in [old_primary, source_screen].into_iter().flatten() {
            self.set_changed(primary, ScreenChanges::CONFIG);
            self.tell_changed(primary);
        }
        Ok(())
    }

    /// SetProviderOffloadSink: `source` renders for `sink`'s screen
    pub fn set_offload_sink(&mut self, source: ProviderId, sink: Option<ProviderId>) -> RrResult<()> {
        let source_screen = self.find_provider(source)?;
        let current = self.provider(source)?;
        if !current.capabilities.contains(ProviderCapabilities::SOURCE_OFFLOAD) {
            return Err(RrError::Value(source.0));
        }
        let previous = current.offload_sink;
        let sink_screen = match sink {
            Some(sink) => {
                let screen = self.find_provider(sink)?;
                if !self.provider(sink)?.capabilities.contains(ProviderCapabilities::SINK_OFFLOAD) {
                    return Err(RrError::Value(sink.0));
                }
                if !self.screen(source_screen).is_gpu || self.screen(screen).is_gpu {
                    return Err(RrError::Match(sink.0));
                }
                Some(screen)
            }
            None => None,
        };
        if previous == sink {
            return Ok(());
        }
        if let Some(primary) = sink_screen {
            let output = self.screen(source_screen).is_output_secondary;
            self.check_link(source_screen, primary, output)?;
        }

        let hook = self.screen_mut(source_screen).driver.provider_set_offload_sink(source, sink);
        link_result(hook, source)?;

        let old_primary = self.screen(source_screen).current_primary;
        self.screen_mut(source_screen).is_offload_secondary = false;
        self.unlink_secondary(source_screen);
        if let Some(primary) = sink_screen {
            self.link_secondary(source_screen, primary)?;
            self.screen_mut(source_screen).is_offload_secondary = true;
        }

        self.provider_mut(source)?.offload_sink = sink;
        self.provider_mut(source)?.changed = true;
        log::info!("provider {:#x} offload sink now {:?}", source.0, sink.map(|s| s.0));

        for primary in [old_primary, sink_screen].into_iter().flatten() {
            self.set_changed(primary, ScreenChanges::empty());
            self.tell_changed(primary);
        }
        Ok(())
    }

    /// Link a freshly attached GPU screen to its primary without a client
    /// asking. Output routing wins over offload when both would fit.
    pub fn auto_config_gpu_screen(&mut self, secondary: ScreenId, primary: ScreenId) -> RrResult<bool> {
        let (Some(provider), Some(primary_provider)) = (
            self.screen(secondary).provider.as_ref().map(|p| (p.id, p.capabilities)),
            self.screen(primary).provider.as_ref().map(|p| (p.id, p.capabilities)),
        ) else {
            return Ok(false);
        };
        let (id, caps) = provider;
        let (primary_id, primary_caps) = primary_provider;

        if caps.contains(ProviderCapabilities::SINK_OUTPUT)
            && primary_caps.contains(ProviderCapabilities::SOURCE_OUTPUT)
        {
            self.set_output_source(id, Some(primary_id))?;
        } else if caps.contains(ProviderCapabilities::SOURCE_OFFLOAD)
            && primary_caps.contains(ProviderCapabilities::SINK_OFFLOAD)
        {
            self.set_offload_sink(id, Some(primary_id))?;
        } else {
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Notify, NotifyMask};
    use crate::testing::{Call, Rig, CONNECTED};

    fn prime_rig() -> (Rig, ScreenId, ProviderId, ProviderId) {
        let mut rig = Rig::new(1920, 1080);
        let gpu = rig.add_gpu_screen(0, 0);
        let source = rig.add_provider(rig.screen, ProviderCapabilities::SOURCE_OUTPUT | ProviderCapabilities::SINK_OFFLOAD);
        let sink = rig.add_provider(gpu, ProviderCapabilities::SINK_OUTPUT | ProviderCapabilities::SOURCE_OFFLOAD);
        (rig, gpu, source, sink)
    }

    #[test]
    fn test_one_provider_per_screen() {
        let (mut rig, _, _, _) = prime_rig();
        let screen = rig.screen;
        assert_eq!(
            rig.randr.create_provider(screen, "again", ProviderCapabilities::empty()),
            Err(RrError::Match(screen.0 as u32))
        );
    }

    #[test]
    fn test_output_source_links_screens_and_adds_sync() {
        let (mut rig, gpu, source, sink) = prime_rig();
        let crtc = rig.add_crtc_on(gpu);
        let output = rig.add_output_on(gpu, "HDMI-1", CONNECTED, &[crtc], 1280, 720);
        rig.randr.take_events();

        rig.randr.set_output_source(sink, Some(source)).unwrap();
        assert!(rig.calls_on(gpu).contains(&Call::SetOutputSource(sink, Some(source))));
        let gpu_screen = rig.randr.screen(gpu);
        assert!(gpu_screen.is_output_secondary);
        assert_eq!(gpu_screen.current_primary, Some(rig.screen));
        assert_eq!(rig.randr.providers(rig.screen).1, vec![source, sink]);

        let sync = rig.randr.atoms.get_id(PRIME_SYNC).unwrap();
        let prop = rig.randr.output(output).unwrap().properties.get(sync).unwrap();
        assert!(prop.is_pending);
        assert_eq!(prop.valid_values, vec![0, 1]);
        assert_eq!(prop.current.data, 1u32.to_ne_bytes());

        let events = rig.randr.take_events();
        let changed: Vec<_> = events
            .iter()
            .filter_map(|e| match e.notify {
                Notify::Provider { provider, .. } => Some(provider),
                _ => None,
            })
            .collect();
        assert!(changed.contains(&sink) && changed.contains(&source));

        let info = rig.randr.provider_info(source).unwrap();
        assert_eq!(info.associated, vec![(sink, ProviderCapabilities::SINK_OUTPUT)]);
        let info = rig.randr.provider_info(sink).unwrap();
        assert_eq!(info.associated, vec![(source, ProviderCapabilities::SOURCE_OUTPUT)]);
        assert_eq!(info.outputs, vec![output]);

        rig.randr.set_output_source(sink, None).unwrap();
        assert!(!rig.randr.screen(gpu).is_output_secondary);
        assert_eq!(rig.randr.screen(gpu).current_primary, None);
        assert!(rig.randr.output(output).unwrap().properties.get(sync).is_none());
    }

    #[test]
    fn test_capabilities_gate_links() {
        let (mut rig, _, source, sink) = prime_rig();
        assert_eq!(rig.randr.set_output_source(source, Some(sink)), Err(RrError::Value(source.0)));
        assert_eq!(rig.randr.set_offload_sink(source, Some(sink)), Err(RrError::Value(source.0)));
        assert_eq!(rig.randr.set_output_source(sink, Some(ProviderId(0x1234))), Err(RrError::Provider(0x1234)));
        assert!(rig.randr.provider(sink).unwrap().output_source.is_none());
    }

    #[test]
    fn test_offload_marks_offload_secondary() {
        let (mut rig, gpu, source, sink) = prime_rig();
        rig.randr.set_offload_sink(sink, Some(source)).unwrap();
        assert!(rig.randr.screen(gpu).is_offload_secondary);
        assert!(!rig.randr.screen(gpu).is_output_secondary);
        let info = rig.randr.provider_info(source).unwrap();
        assert_eq!(info.associated, vec![(sink, ProviderCapabilities::SOURCE_OFFLOAD)]);
    }

    #[test]
    fn test_auto_config_prefers_output_routing() {
        let (mut rig, gpu, source, sink) = prime_rig();
        assert!(rig.randr.auto_config_gpu_screen(gpu, rig.screen).unwrap());
        assert_eq!(rig.randr.provider(sink).unwrap().output_source, Some(source));
        assert_eq!(rig.randr.provider(sink).unwrap().offload_sink, None);

        let plain = rig.add_plain_screen(800, 600);
        assert!(!rig.randr.auto_config_gpu_screen(plain, rig.screen).unwrap());
    }

    #[test]
    fn test_destroy_clears_peer_links() {
        let (mut rig, gpu, source, sink) = prime_rig();
        rig.randr.set_output_source(sink, Some(source)).unwrap();
        rig.randr.take_events();

        rig.randr.destroy_provider(source).unwrap();
        assert!(rig.calls().contains(&Call::ProviderDestroy(source)));
        assert_eq!(rig.randr.provider(sink).unwrap().output_source, None);
        assert_eq!(rig.randr.provider(source).unwrap_err(), RrError::Provider(source.0));
        assert!(rig.randr.providers(rig.screen).1.is_empty());
        let gpu_screen = rig.randr.screen(gpu);
        assert!(gpu_screen.provider.is_some());
        assert!(!gpu_screen.is_output_secondary);
        assert_eq!(gpu_screen.current_primary, None);
        assert!(rig.randr.screen(rig.screen).secondaries.is_empty());
        let events = rig.randr.take_events();
        assert!(events.iter().any(|e| e.notify.mask() == NotifyMask::RESOURCE_CHANGE));
    }

    #[test]
    fn test_destroying_sink_leaves_secondary_graph() {
        let (mut rig, gpu, source, sink) = prime_rig();
        let crtc = rig.add_crtc_on(gpu);
        let output = rig.add_output_on(gpu, "HDMI-1", CONNECTED, &[crtc], 1280, 720);
        rig.randr.set_output_source(sink, Some(source)).unwrap();
        rig.randr.take_events();

        rig.randr.destroy_provider(sink).unwrap();
        assert!(!rig.randr.screen(gpu).is_output_secondary);
        assert_eq!(rig.randr.screen(gpu).current_primary, None);
        assert_eq!(rig.randr.providers(rig.screen).1, vec![source]);
        assert!(rig.randr.provider_info(source).unwrap().associated.is_empty());
        let sync = rig.randr.atoms.get_id(PRIME_SYNC).unwrap();
        assert!(rig.randr.output(output).unwrap().properties.get(sync).is_none());
        let events = rig.randr.take_events();
        assert!(events.iter().any(|e| e.notify.mask() == NotifyMask::RESOURCE_CHANGE));
    }

    #[test]
    fn test_unreachable_source_skips_driver() {
        let (mut rig, gpu, source, sink) = prime_rig();
        rig.randr.set_offload_sink(sink, Some(source)).unwrap();
        let other = rig.add_plain_screen(800, 600);
        let other_source = rig.add_provider(other, ProviderCapabilities::SOURCE_OUTPUT);
        rig.clear_calls();

        assert_eq!(
            rig.randr.set_output_source(sink, Some(other_source)),
            Err(RrError::Match(gpu.0 as u32))
        );
        assert!(rig.calls_on(gpu).is_empty());
        let gpu_screen = rig.randr.screen(gpu);
        assert_eq!(gpu_screen.current_primary, Some(rig.screen));
        assert!(gpu_screen.is_offload_secondary && !gpu_screen.is_output_secondary);
        assert_eq!(rig.randr.provider(sink).unwrap().output_source, None);
    }
}
