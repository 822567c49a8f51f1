//! Notifications queued for delivery to listening clients
//!
//! Events carry a snapshot of the state at the time they were raised.
//! The window field on the wire is filled in per listener by the server.

use crate::types::{
    Atom, Connection, CrtcId, LeaseId, ModeId, OutputId, ProviderId, Rotation, ScreenId, SubpixelOrder, Timestamp,
};
use bitflags::bitflags;

bitflags! {
    /// SelectInput mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NotifyMask: u16 {
        const SCREEN_CHANGE = 1 << 0;
        const CRTC_CHANGE = 1 << 1;
        const OUTPUT_CHANGE = 1 << 2;
        const OUTPUT_PROPERTY = 1 << 3;
        const PROVIDER_CHANGE = 1 << 4;
        const PROVIDER_PROPERTY = 1 << 5;
        const RESOURCE_CHANGE = 1 << 6;
        const LEASE = 1 << 7;
    }
}

/// Property notify state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PropertyState {
    NewValue = 0,
    Deleted = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notify {
    Screen {
        rotation: Rotation,
        timestamp: Timestamp,
        config_timestamp: Timestamp,
        root: u32,
        width: u16,
        height: u16,
        mm_width: u16,
        mm_height: u16,
    },
    Crtc {
        timestamp: Timestamp,
        crtc: CrtcId,
        mode: Option<ModeId>,
        rotation: Rotation,
        x: i16,
        y: i16,
        width: u16,
        height: u16,
    },
    Output {
        timestamp: Timestamp,
        config_timestamp: Timestamp,
        output: OutputId,
        crtc: Option<CrtcId>,
        mode: Option<ModeId>,
        rotation: Rotation,
        connection: Connection,
        subpixel: SubpixelOrder,
    },
    OutputProperty {
        output: OutputId,
        atom: Atom,
        timestamp: Timestamp,
        state: PropertyState,
    },
    Provider {
        timestamp: Timestamp,
        provider: ProviderId,
    },
    ProviderProperty {
        provider: ProviderId,
        atom: Atom,
        timestamp: Timestamp,
        state: PropertyState,
    },
    Resource {
        timestamp: Timestamp,
    },
    Lease {
        timestamp: Timestamp,
        lease: LeaseId,
        created: bool,
    },
}

impl Notify {
    /// Mask bit a listener must have selected to receive this
    pub fn mask(&self) -> NotifyMask {
        match self {
            Notify::Screen { .. } => NotifyMask::SCREEN_CHANGE,
            Notify::Crtc { .. } => NotifyMask::CRTC_CHANGE,
            Notify::Output { .. } => NotifyMask::OUTPUT_CHANGE,
            Notify::OutputProperty { .. } => NotifyMask::OUTPUT_PROPERTY,
            Notify::Provider { .. } => NotifyMask::PROVIDER_CHANGE,
            Notify::ProviderProperty { .. } => NotifyMask::PROVIDER_PROPERTY,
            Notify::Resource { .. } => NotifyMask::RESOURCE_CHANGE,
            Notify::Lease { .. } => NotifyMask::LEASE,
        }
    }
}

/// An event raised on behalf of a screen's root window listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrEvent {
    pub screen: ScreenId,
    pub notify: Notify,
}
