//! The hardware side of a screen
//!
//! Every hook has a default that reports `NotImplemented`, so a driver only
//! overrides what its hardware can do. The core treats `NotImplemented` as
//! the absence of the capability and `Failed` as a refusal.

use crate::crtc::GammaRamp;
use crate::mode::Mode;
use crate::pixmap::Pixmap;
use crate::property::PropertyValue;
use crate::transform::ClientTransform;
use crate::types::{Atom, Bounds, CrtcId, LeaseId, OutputId, PixmapId, ProviderId, Rotation};
use std::os::fd::OwnedFd;
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("hook not implemented")]
    NotImplemented,

    #[error("driver refused: {0}")]
    Failed(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Note a hook failure where the core carries on regardless
pub(crate) fn log_failure(result: DriverResult<()>, what: &str) {
    match result {
        Ok(()) | Err(DriverError::NotImplemented) => {}
        Err(err) => log::warn!("{}: {}", what, err),
    }
}

/// Capabilities the core probes without calling the hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    ScreenSetSize,
    /// Secondary can flip between two shared scanout pixmaps
    SharedPixmapFlipping,
    /// Primary can track and present into flipping shared pixmaps
    FlippingPixmapTracking,
    CreateLease,
}

/// Requested crtc configuration, handed to the driver as a whole
#[derive(Debug, Clone, Copy)]
pub struct CrtcRequest<'a> {
    pub crtc: CrtcId,
    pub mode: Option<&'a Rc<Mode>>,
    pub x: i32,
    pub y: i32,
    pub rotation: Rotation,
    pub outputs: &'a [OutputId],
    pub transform: &'a ClientTransform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScreenSize {
    pub width: u16,
    pub height: u16,
    pub mm_width: u32,
    pub mm_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Panning {
    pub total: Bounds,
    pub tracking: Bounds,
    /// left, top, right, bottom
    pub border: [i16; 4],
}

/// How the driver handled a termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseTermination {
    /// Resources are back; the core finishes the lease now
    Immediate,
    /// The driver calls `Randr::lease_terminated` later
    Deferred,
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseRequest<'a> {
    pub lease: LeaseId,
    pub crtcs: &'a [CrtcId],
    pub outputs: &'a [OutputId],
}

pub trait RandrDriver {
    fn supports(&self, _hook: Hook) -> bool {
        false
    }

    /// Full crtc configuration. On success the core records the requested
    /// state as current.
    fn crtc_set(&mut self, _req: &CrtcRequest<'_>) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    /// Single-size interface: screen size follows the mode
    fn set_config(&mut self, _rotation: Rotation, _rate: u16, _size: &ScreenSize) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn screen_set_size(&mut self, _size: &ScreenSize) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn crtc_set_gamma(&mut self, _crtc: CrtcId, _gamma: &GammaRamp) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    /// A fresh ramp from the hardware, or `None` to keep the stored one
    fn crtc_get_gamma(&mut self, _crtc: CrtcId) -> DriverResult<Option<GammaRamp>> {
        Err(DriverError::NotImplemented)
    }

    fn get_panning(&self, _crtc: CrtcId) -> DriverResult<Panning> {
        Err(DriverError::NotImplemented)
    }

    fn set_panning(&mut self, _crtc: CrtcId, _panning: &Panning) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    /// Veto a pending property value before it is stored
    fn output_set_property(&mut self, _output: OutputId, _name: Atom, _value: &PropertyValue) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    /// Refresh a property from hardware before a read
    fn output_get_property(&mut self, _output: OutputId, _name: Atom) -> DriverResult<Option<PropertyValue>> {
        Err(DriverError::NotImplemented)
    }

    fn provider_set_property(
        &mut self,
        _provider: ProviderId,
        _name: Atom,
        _value: &PropertyValue,
    ) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn provider_get_property(&mut self, _provider: ProviderId, _name: Atom) -> DriverResult<Option<PropertyValue>> {
        Err(DriverError::NotImplemented)
    }

    fn provider_set_output_source(&mut self, _provider: ProviderId, _source: Option<ProviderId>) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn provider_set_offload_sink(&mut self, _provider: ProviderId, _sink: Option<ProviderId>) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn provider_destroy(&mut self, _provider: ProviderId) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    /// Hand the resources over, returning the fd the lessee drives them with
    fn create_lease(&mut self, _req: &LeaseRequest<'_>) -> DriverResult<OwnedFd> {
        Err(DriverError::NotImplemented)
    }

    fn terminate_lease(&mut self, _lease: LeaseId) -> DriverResult<LeaseTermination> {
        Ok(LeaseTermination::Immediate)
    }

    // Secondary screen side of pixmap sharing

    fn crtc_set_scanout_pixmap(&mut self, _crtc: CrtcId, _pixmap: Option<&Pixmap>) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn enable_shared_pixmap_flipping(
        &mut self,
        _crtc: CrtcId,
        _front: &Pixmap,
        _back: &Pixmap,
    ) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn disable_shared_pixmap_flipping(&mut self, _crtc: CrtcId) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    // Primary screen side of pixmap sharing

    /// Start copying damage from the root window into `target`
    fn start_pixmap_tracking(&mut self, _target: &Pixmap, _x: i32, _y: i32, _rotation: Rotation) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn stop_pixmap_tracking(&mut self, _target: PixmapId) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn start_flipping_pixmap_tracking(
        &mut self,
        _crtc: CrtcId,
        _front: &Pixmap,
        _back: &Pixmap,
        _x: i32,
        _y: i32,
        _rotation: Rotation,
    ) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn stop_flipping_pixmap_tracking(&mut self, _front: PixmapId, _back: PixmapId) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }

    fn present_shared_pixmap(&mut self, _front: PixmapId) -> DriverResult<()> {
        Err(DriverError::NotImplemented)
    }
}

/// A driver with no hooks at all
#[derive(Debug, Default)]
pub struct NullDriver;

impl RandrDriver for NullDriver {}
