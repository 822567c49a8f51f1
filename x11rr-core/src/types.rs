//! Identifiers and small value types shared by every RandR object

use bitflags::bitflags;
use std::sync::OnceLock;
use std::time::Instant;

/// X resource id
pub type Xid = u32;
/// Interned atom id
pub type Atom = u32;

/// The `None` resource / atom
pub const NONE: u32 = 0;

macro_rules! xid_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Xid);

        impl From<$name> for u32 {
            fn from(id: $name) -> u32 {
                id.0
            }
        }
    };
}

xid_type!(
    /// Display pipeline handle
    CrtcId
);
xid_type!(
    /// Connector handle
    OutputId
);
xid_type!(ModeId);
xid_type!(ProviderId);
xid_type!(
    /// Client-chosen lease handle
    LeaseId
);
xid_type!(WindowId);
xid_type!(PixmapId);

/// Index of a screen in the server's screen list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScreenId(pub usize);

bitflags! {
    /// Rotation and reflection bits as carried on the wire
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rotation: u16 {
        const ROTATE_0 = 1;
        const ROTATE_90 = 2;
        const ROTATE_180 = 4;
        const ROTATE_270 = 8;
        const REFLECT_X = 16;
        const REFLECT_Y = 32;
    }
}

impl Rotation {
    pub const ANGLES: Rotation = Rotation::ROTATE_0
        .union(Rotation::ROTATE_90)
        .union(Rotation::ROTATE_180)
        .union(Rotation::ROTATE_270);

    /// Only the rotation part, reflections stripped
    pub fn angle(self) -> Rotation {
        self & Self::ANGLES
    }

    /// Exactly one rotation bit set
    pub fn has_single_angle(self) -> bool {
        matches!(
            self.angle(),
            Rotation::ROTATE_0 | Rotation::ROTATE_90 | Rotation::ROTATE_180 | Rotation::ROTATE_270
        )
    }

    /// Quarter turns swap width and height
    pub fn swaps_axes(self) -> bool {
        matches!(self.angle(), Rotation::ROTATE_90 | Rotation::ROTATE_270)
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::ROTATE_0
    }
}

/// Output connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Connection {
    Connected = 0,
    Disconnected = 1,
    #[default]
    Unknown = 2,
}

/// Subpixel order (render extension values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SubpixelOrder {
    #[default]
    Unknown = 0,
    HorizontalRgb = 1,
    HorizontalBgr = 2,
    VerticalRgb = 3,
    VerticalBgr = 4,
    None = 5,
}

/// Axis-aligned box, x2/y2 exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bounds {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Bounds {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_size(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// No area
    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn is_zero(&self) -> bool {
        *self == Bounds::default()
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds::new(
            self.x1.min(other.x1),
            self.y1.min(other.y1),
            self.x2.max(other.x2),
            self.y2.max(other.y2),
        )
    }

    /// Overlapping or sharing an edge
    pub fn touches(&self, other: &Bounds) -> bool {
        let left = self.x1.max(other.x1);
        let right = self.x2.min(other.x2);
        let top = self.y1.max(other.y1);
        let bottom = self.y2.min(other.y2);
        left <= right && top <= bottom
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }
}

/// Server time in milliseconds, wraps like the X server clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u32);

impl Timestamp {
    pub fn now() -> Self {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        // Zero is CurrentTime on the wire
        Timestamp((epoch.elapsed().as_millis() as u32).max(1))
    }
}

/// Round a byte count up to whole protocol words
pub fn pad4(len: usize) -> usize {
    (len + 3) & !3
}
