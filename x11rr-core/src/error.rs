//! Protocol error classes raised by RandR operations

use thiserror::Error;

/// Core X11 error codes
mod codes {
    pub const BAD_REQUEST: u8 = 1;
    pub const BAD_VALUE: u8 = 2;
    pub const BAD_WINDOW: u8 = 3;
    pub const BAD_ATOM: u8 = 5;
    pub const BAD_MATCH: u8 = 8;
    pub const BAD_ACCESS: u8 = 10;
    pub const BAD_ALLOC: u8 = 11;
    pub const BAD_ID_CHOICE: u8 = 14;
    pub const BAD_NAME: u8 = 15;
    pub const BAD_LENGTH: u8 = 16;
    pub const BAD_IMPLEMENTATION: u8 = 17;
}

/// Offsets from the extension's first error
mod rr_codes {
    pub const BAD_OUTPUT: u8 = 0;
    pub const BAD_CRTC: u8 = 1;
    pub const BAD_MODE: u8 = 2;
    pub const BAD_PROVIDER: u8 = 3;
    pub const BAD_LEASE: u8 = 4;
}

/// A failed request. The payload is the protocol `bad value` field.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrError {
    #[error("inconsistent request (value {0:#x})")]
    Match(u32),

    #[error("value out of range: {0:#x}")]
    Value(u32),

    #[error("allocation failed")]
    Alloc,

    #[error("access denied (resource {0:#x})")]
    Access(u32),

    #[error("unknown name (atom {0:#x})")]
    Name(u32),

    #[error("invalid atom {0:#x}")]
    Atom(u32),

    #[error("request length mismatch")]
    Length,

    #[error("no such window {0:#x}")]
    Window(u32),

    #[error("resource id {0:#x} not available")]
    IdChoice(u32),

    #[error("server implementation error")]
    Implementation,

    #[error("unsupported request")]
    Request,

    #[error("no such output {0:#x}")]
    Output(u32),

    #[error("no such crtc {0:#x}")]
    Crtc(u32),

    #[error("no such mode {0:#x}")]
    Mode(u32),

    #[error("no such provider {0:#x}")]
    Provider(u32),

    #[error("no such lease {0:#x}")]
    Lease(u32),
}

pub type RrResult<T> = Result<T, RrError>;

impl RrError {
    /// Wire error code given the extension's first error number
    pub fn code(&self, error_base: u8) -> u8 {
        match self {
            RrError::Match(_) => codes::BAD_MATCH,
            RrError::Value(_) => codes::BAD_VALUE,
            RrError::Alloc => codes::BAD_ALLOC,
            RrError::Access(_) => codes::BAD_ACCESS,
            RrError::Name(_) => codes::BAD_NAME,
            RrError::Atom(_) => codes::BAD_ATOM,
            RrError::Length => codes::BAD_LENGTH,
            RrError::Window(_) => codes::BAD_WINDOW,
            RrError::IdChoice(_) => codes::BAD_ID_CHOICE,
            RrError::Implementation => codes::BAD_IMPLEMENTATION,
            RrError::Request => codes::BAD_REQUEST,
            RrError::Output(_) => error_base + rr_codes::BAD_OUTPUT,
            RrError::Crtc(_) => error_base + rr_codes::BAD_CRTC,
            RrError::Mode(_) => error_base + rr_codes::BAD_MODE,
            RrError::Provider(_) => error_base + rr_codes::BAD_PROVIDER,
            RrError::Lease(_) => error_base + rr_codes::BAD_LEASE,
        }
    }

    pub fn bad_value(&self) -> u32 {
        match *self {
            RrError::Match(v)
            | RrError::Value(v)
            | RrError::Access(v)
            | RrError::Name(v)
            | RrError::Atom(v)
            | RrError::Window(v)
            | RrError::IdChoice(v)
            | RrError::Output(v)
            | RrError::Crtc(v)
            | RrError::Mode(v)
            | RrError::Provider(v)
            | RrError::Lease(v) => v,
            RrError::Alloc | RrError::Length | RrError::Implementation | RrError::Request => 0,
        }
    }
}
