//! x11rr-core - X11 RandR display configuration
//!
//! Crtcs, outputs, modes, monitors, leases and providers for one or more
//! screens, with the RandR request dispatcher on top. Hardware access goes
//! through a `RandrDriver` per screen; this crate does no IO.

mod atom;
mod crtc;
mod driver;
mod error;
mod event;
mod lease;
mod mode;
mod monitor;
mod output;
mod pixmap;
mod property;
mod provider;
mod resource;
mod screen;
mod server;
mod transform;
mod types;
mod wire;

#[cfg(test)]
mod testing;

pub use atom::{AtomStore, NON_DESKTOP, PRIME_SYNC, XA_ATOM, XA_CARDINAL, XA_INTEGER, XA_STRING};
pub use crtc::{ConfigStatus, Crtc, CrtcConfig, CrtcInfo, CrtcTransformInfo, GammaRamp};
pub use driver::{
    CrtcRequest, DriverError, DriverResult, Hook, LeaseRequest, LeaseTermination, NullDriver, Panning, RandrDriver,
    ScreenSize,
};
pub use error::{RrError, RrResult};
pub use event::{Notify, NotifyMask, PropertyState, RrEvent};
pub use lease::{Lease, LeaseState};
pub use mode::{Mode, ModeInfo, ModeStore};
pub use monitor::{Monitor, MonitorGeometry};
pub use output::{Output, OutputInfo};
pub use pixmap::{Pixmap, PixmapStore};
pub use property::{PropMode, Property, PropertyOwner, PropertyRead, PropertyValue, ANY_PROPERTY_TYPE};
pub use provider::{Provider, ProviderCapabilities, ProviderInfo};
pub use resource::{ResourceKind, ResourceRegistry};
pub use screen::{Randr, Screen, ScreenChanges, ScreenResources, SizeRange, MAX_SCREEN_SIZE};
pub use server::{ClientId, RandrServer, Response, EXTENSION_NAME, SERVER_VERSION};
pub use transform::{ClientTransform, DeviceTransform, Filter, FixedMatrix};
pub use types::{
    Atom, Bounds, Connection, CrtcId, LeaseId, ModeId, OutputId, PixmapId, ProviderId, Rotation, ScreenId,
    SubpixelOrder, Timestamp, WindowId, Xid, NONE,
};
pub use wire::{encode_error, ByteOrder, Reply, RequestReader};
