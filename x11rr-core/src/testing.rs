//! Test rig: a `Randr` whose screens run a recording driver
//!
//! Each screen's driver logs the hooks it is asked to run and behaves as
//! its `Behavior` says. The rig keeps handles to both so tests can assert
//! on calls and flip behavior after the driver has been boxed.

use crate::driver::{
    CrtcRequest, DriverError, DriverResult, Hook, LeaseRequest, LeaseTermination, Panning, RandrDriver, ScreenSize,
};
use crate::mode::ModeInfo;
use crate::pixmap::Pixmap;
use crate::property::PropertyValue;
use crate::provider::ProviderCapabilities;
use crate::screen::Randr;
use crate::types::{
    Atom, Connection, CrtcId, LeaseId, ModeId, OutputId, PixmapId, ProviderId, Rotation, ScreenId,
};
use std::cell::RefCell;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::rc::Rc;

pub const CONNECTED: Connection = Connection::Connected;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CrtcSet {
        crtc: CrtcId,
        mode: Option<ModeId>,
        x: i32,
        y: i32,
        rotation: Rotation,
        outputs: Vec<OutputId>,
    },
    SetConfig {
        rate: u16,
        width: u16,
        height: u16,
        mm_width: u32,
        mm_height: u32,
    },
    ScreenSetSize {
        width: u16,
        height: u16,
    },
    SetGamma(CrtcId),
    SetPanning(CrtcId),
    SetScanout(CrtcId, Option<PixmapId>),
    EnableFlipping(CrtcId),
    DisableFlipping(CrtcId),
    StartTracking(PixmapId),
    StopTracking(PixmapId),
    StartFlipTracking(PixmapId, PixmapId),
    StopFlipTracking(PixmapId, PixmapId),
    Present(PixmapId),
    CreateLease(LeaseId),
    TerminateLease(LeaseId),
    SetOutputSource(ProviderId, Option<ProviderId>),
    SetOffloadSink(ProviderId, Option<ProviderId>),
    ProviderDestroy(ProviderId),
}

#[derive(Debug, Default)]
pub struct Behavior {
    /// No crtc_set hook; only the whole-screen set_config
    pub single_size: bool,
    pub refuse_crtc_set: bool,
    /// Both pixmap flipping hook families work
    pub flipping: bool,
    pub screen_set_size: bool,
    pub leases: bool,
    pub deferred_termination: bool,
    pub veto_properties: Vec<Atom>,
    /// Panning hooks exist and report this area
    pub panning: Option<Panning>,
}

struct RecordingDriver {
    calls: Rc<RefCell<Vec<Call>>>,
    behavior: Rc<RefCell<Behavior>>,
}

impl RecordingDriver {
    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn veto(&self, name: Atom) -> DriverResult<()> {
        if self.behavior.borrow().veto_properties.contains(&name) {
            return Err(DriverError::Failed(format!("property {} vetoed", name)));
        }
        Ok(())
    }
}

impl RandrDriver for RecordingDriver {
    fn supports(&self, hook: Hook) -> bool {
        let b = self.behavior.borrow();
        match hook {
            Hook::ScreenSetSize => b.screen_set_size,
            Hook::SharedPixmapFlipping | Hook::FlippingPixmapTracking => b.flipping,
            Hook::CreateLease => b.leases,
        }
    }

    fn crtc_set(&mut self, req: &CrtcRequest<'_>) -> DriverResult<()> {
        if self.behavior.borrow().single_size {
            return Err(DriverError::NotImplemented);
        }
        self.record(Call::CrtcSet {
            crtc: req.crtc,
            mode: req.mode.map(|m| m.id),
            x: req.x,
            y: req.y,
            rotation: req.rotation,
            outputs: req.outputs.to_vec(),
        });
        if self.behavior.borrow().refuse_crtc_set {
            return Err(DriverError::Failed("crtc busy".into()));
        }
        Ok(())
    }

    fn set_config(&mut self, _rotation: Rotation, rate: u16, size: &ScreenSize) -> DriverResult<()> {
        self.record(Call::SetConfig {
            rate,
            width: size.width,
            height: size.height,
            mm_width: size.mm_width,
            mm_height: size.mm_height,
        });
        Ok(())
    }

    fn screen_set_size(&mut self, size: &ScreenSize) -> DriverResult<()> {
        self.record(Call::ScreenSetSize {
            width: size.width,
            height: size.height,
        });
        Ok(())
    }

    fn crtc_set_gamma(&mut self, crtc: CrtcId, _gamma: &crate::crtc::GammaRamp) -> DriverResult<()> {
        self.record(Call::SetGamma(crtc));
        Ok(())
    }

    fn get_panning(&self, _crtc: CrtcId) -> DriverResult<Panning> {
        self.behavior.borrow().panning.ok_or(DriverError::NotImplemented)
    }

    fn set_panning(&mut self, crtc: CrtcId, panning: &Panning) -> DriverResult<()> {
        let mut b = self.behavior.borrow_mut();
        if b.panning.is_none() {
            return Err(DriverError::NotImplemented);
        }
        b.panning = Some(*panning);
        drop(b);
        self.record(Call::SetPanning(crtc));
        Ok(())
    }

    fn output_set_property(&mut self, _output: OutputId, name: Atom, _value: &PropertyValue) -> DriverResult<()> {
        self.veto(name)
    }

    fn provider_set_property(&mut self, _provider: ProviderId, name: Atom, _value: &PropertyValue) -> DriverResult<()> {
        self.veto(name)
    }

    fn provider_set_output_source(&mut self, provider: ProviderId, source: Option<ProviderId>) -> DriverResult<()> {
        self.record(Call::SetOutputSource(provider, source));
        Ok(())
    }

    fn provider_set_offload_sink(&mut self, provider: ProviderId, sink: Option<ProviderId>) -> DriverResult<()> {
        self.record(Call::SetOffloadSink(provider, sink));
        Ok(())
    }

    fn provider_destroy(&mut self, provider: ProviderId) -> DriverResult<()> {
        self.record(Call::ProviderDestroy(provider));
        Ok(())
    }

    fn create_lease(&mut self, req: &LeaseRequest<'_>) -> DriverResult<OwnedFd> {
        if !self.behavior.borrow().leases {
            return Err(DriverError::NotImplemented);
        }
        let file = File::open("/dev/null").map_err(|e| DriverError::Failed(e.to_string()))?;
        self.record(Call::CreateLease(req.lease));
        Ok(OwnedFd::from(file))
    }

    fn terminate_lease(&mut self, lease: LeaseId) -> DriverResult<LeaseTermination> {
        self.record(Call::TerminateLease(lease));
        if self.behavior.borrow().deferred_termination {
            Ok(LeaseTermination::Deferred)
        } else {
            Ok(LeaseTermination::Immediate)
        }
    }

    fn crtc_set_scanout_pixmap(&mut self, crtc: CrtcId, pixmap: Option<&Pixmap>) -> DriverResult<()> {
        self.record(Call::SetScanout(crtc, pixmap.map(|p| p.id)));
        Ok(())
    }

    fn enable_shared_pixmap_flipping(&mut self, crtc: CrtcId, _front: &Pixmap, _back: &Pixmap) -> DriverResult<()> {
        if !self.behavior.borrow().flipping {
            return Err(DriverError::NotImplemented);
        }
        self.record(Call::EnableFlipping(crtc));
        Ok(())
    }

    fn disable_shared_pixmap_flipping(&mut self, crtc: CrtcId) -> DriverResult<()> {
        self.record(Call::DisableFlipping(crtc));
        Ok(())
    }

    fn start_pixmap_tracking(&mut self, target: &Pixmap, _x: i32, _y: i32, _rotation: Rotation) -> DriverResult<()> {
        self.record(Call::StartTracking(target.id));
        Ok(())
    }

    fn stop_pixmap_tracking(&mut self, target: PixmapId) -> DriverResult<()> {
        self.record(Call::StopTracking(target));
        Ok(())
    }

    fn start_flipping_pixmap_tracking(
        &mut self,
        _crtc: CrtcId,
        front: &Pixmap,
        back: &Pixmap,
        _x: i32,
        _y: i32,
        _rotation: Rotation,
    ) -> DriverResult<()> {
        if !self.behavior.borrow().flipping {
            return Err(DriverError::NotImplemented);
        }
        self.record(Call::StartFlipTracking(front.id, back.id));
        Ok(())
    }

    fn stop_flipping_pixmap_tracking(&mut self, front: PixmapId, back: PixmapId) -> DriverResult<()> {
        self.record(Call::StopFlipTracking(front, back));
        Ok(())
    }

    fn present_shared_pixmap(&mut self, front: PixmapId) -> DriverResult<()> {
        self.record(Call::Present(front));
        Ok(())
    }
}

struct Handles {
    calls: Rc<RefCell<Vec<Call>>>,
    behavior: Rc<RefCell<Behavior>>,
}

pub struct Rig {
    pub randr: Randr,
    /// The first, plain screen
    pub screen: ScreenId,
    handles: Vec<Handles>,
}

impl Rig {
    pub fn new(width: u16, height: u16) -> Self {
        let mut rig = Self {
            randr: Randr::new(),
            screen: ScreenId(0),
            handles: Vec::new(),
        };
        rig.screen = rig.add_screen(width, height, false);
        rig
    }

    fn add_screen(&mut self, width: u16, height: u16, is_gpu: bool) -> ScreenId {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let behavior = Rc::new(RefCell::new(Behavior::default()));
        let driver = RecordingDriver {
            calls: Rc::clone(&calls),
            behavior: Rc::clone(&behavior),
        };
        let size = ScreenSize {
            width,
            height,
            mm_width: width as u32 * 254 / 960,
            mm_height: height as u32 * 254 / 960,
        };
        let id = self.randr.add_screen(size, is_gpu, Box::new(driver)).unwrap();
        assert_eq!(id.0, self.handles.len());
        self.handles.push(Handles { calls, behavior });
        id
    }

    pub fn add_plain_screen(&mut self, width: u16, height: u16) -> ScreenId {
        self.add_screen(width, height, false)
    }

    /// A GPU screen, not yet linked to any primary
    pub fn add_gpu_screen(&mut self, width: u16, height: u16) -> ScreenId {
        self.add_screen(width, height, true)
    }

    pub fn add_crtc(&mut self) -> CrtcId {
        self.add_crtc_on(self.screen)
    }

    pub fn add_crtc_on(&mut self, screen: ScreenId) -> CrtcId {
        let crtc = self.randr.create_crtc(screen).unwrap();
        self.randr.set_crtc_rotations(crtc, Rotation::ANGLES).unwrap();
        crtc
    }

    pub fn add_output(
        &mut self,
        name: &str,
        connection: Connection,
        crtcs: &[CrtcId],
        width: u16,
        height: u16,
    ) -> OutputId {
        self.add_output_on(self.screen, name, connection, crtcs, width, height)
    }

    /// An output with a single preferred `WxH` mode
    pub fn add_output_on(
        &mut self,
        screen: ScreenId,
        name: &str,
        connection: Connection,
        crtcs: &[CrtcId],
        width: u16,
        height: u16,
    ) -> OutputId {
        let output = self.randr.create_output(screen, name).unwrap();
        self.randr.set_output_crtcs(output, crtcs).unwrap();
        self.randr.set_output_connection(output, connection).unwrap();
        let mode = self
            .randr
            .modes
            .get(&mut self.randr.resources, &format!("{}x{}", width, height), ModeInfo::simple(width, height))
            .unwrap();
        self.randr.set_output_modes(output, vec![mode], 1).unwrap();
        output
    }

    /// Light `crtc` with the first output's first mode
    pub fn enable(&mut self, crtc: CrtcId, x: i32, y: i32, outputs: &[OutputId]) {
        let mode = self.randr.output(outputs[0]).unwrap().modes[0].clone();
        let done = self
            .randr
            .crtc_set(crtc, Some(mode), x, y, Rotation::ROTATE_0, outputs)
            .unwrap();
        assert!(done, "crtc {:#x} refused", crtc.0);
    }

    pub fn add_provider(&mut self, screen: ScreenId, capabilities: ProviderCapabilities) -> ProviderId {
        let name = format!("gpu{}", screen.0);
        self.randr.create_provider(screen, &name, capabilities).unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls_on(self.screen)
    }

    pub fn calls_on(&self, screen: ScreenId) -> Vec<Call> {
        self.handles[screen.0].calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        for handles in &self.handles {
            handles.calls.borrow_mut().clear();
        }
    }

    pub fn behave(&self, f: impl FnOnce(&mut Behavior)) {
        self.behave_on(self.screen, f);
    }

    pub fn behave_on(&self, screen: ScreenId, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.handles[screen.0].behavior.borrow_mut());
    }
}
