//! RandR wire encoding
//!
//! Requests are parsed and replies built in the byte order the client
//! announced at connection setup. Property data is kept in host order and
//! swapped per item on the way in and out.

use crate::error::{RrError, RrResult};
use crate::event::{Notify, RrEvent};
use crate::types::{pad4, Timestamp, NONE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// `ScreenChangeNotify`, relative to the event base
pub const SCREEN_CHANGE_NOTIFY: u8 = 0;
/// `RRNotify`, relative to the event base
pub const RR_NOTIFY: u8 = 1;

/// RRNotify subcodes
mod subcode {
    pub const CRTC_CHANGE: u8 = 0;
    pub const OUTPUT_CHANGE: u8 = 1;
    pub const OUTPUT_PROPERTY: u8 = 2;
    pub const PROVIDER_CHANGE: u8 = 3;
    pub const PROVIDER_PROPERTY: u8 = 4;
    pub const RESOURCE_CHANGE: u8 = 5;
    pub const LEASE: u8 = 6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// First byte of the connection setup: `l` or `B`
    pub fn from_setup_byte(byte: u8) -> Option<Self> {
        match byte {
            b'l' => Some(ByteOrder::Little),
            b'B' => Some(ByteOrder::Big),
            _ => None,
        }
    }

    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }
}

/// Swap every 16 or 32 bit item of `data` in place
pub fn swap_items(data: &mut [u8], format: u8) {
    match format {
        16 => data.chunks_exact_mut(2).for_each(|c| c.swap(0, 1)),
        32 => data.chunks_exact_mut(4).for_each(|c| c.reverse()),
        _ => {}
    }
}

/// Convert property items between `order` and host order
pub fn reorder_items(data: &mut [u8], format: u8, order: ByteOrder) {
    if order != ByteOrder::native() {
        swap_items(data, format);
    }
}

/// Cursor over a request body
pub struct RequestReader<'a> {
    buf: &'a [u8],
    order: ByteOrder,
}

impl<'a> RequestReader<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self { buf, order }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, len: usize) -> RrResult<()> {
        if self.buf.remaining() < len {
            return Err(RrError::Length);
        }
        Ok(())
    }

    pub fn u8(&mut self) -> RrResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self) -> RrResult<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> RrResult<u16> {
        self.need(2)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_u16_le(),
            ByteOrder::Big => self.buf.get_u16(),
        })
    }

    pub fn i16(&mut self) -> RrResult<i16> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> RrResult<u32> {
        self.need(4)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_u32_le(),
            ByteOrder::Big => self.buf.get_u32(),
        })
    }

    pub fn i32(&mut self) -> RrResult<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn skip(&mut self, len: usize) -> RrResult<()> {
        self.need(len)?;
        self.buf.advance(len);
        Ok(())
    }

    pub fn bytes(&mut self, len: usize) -> RrResult<&'a [u8]> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// `len` bytes followed by padding to a word boundary
    pub fn padded_bytes(&mut self, len: usize) -> RrResult<&'a [u8]> {
        let data = self.bytes(len)?;
        let pad = (pad4(len) - len).min(self.remaining());
        self.skip(pad)?;
        Ok(data)
    }

    pub fn u16_list(&mut self, count: usize) -> RrResult<Vec<u16>> {
        self.need(count * 2)?;
        (0..count).map(|_| self.u16()).collect()
    }

    pub fn u32_list(&mut self, count: usize) -> RrResult<Vec<u32>> {
        self.need(count * 4)?;
        (0..count).map(|_| self.u32()).collect()
    }

    /// Every remaining word
    pub fn rest_u32(&mut self) -> RrResult<Vec<u32>> {
        let count = self.remaining() / 4;
        self.u32_list(count)
    }

    pub fn timestamp(&mut self) -> RrResult<Timestamp> {
        Ok(Timestamp(self.u32()?))
    }
}

/// Reply under construction. `body` starts right after the 8 byte header.
pub struct Reply {
    /// Header byte 1
    pub data: u8,
    body: BytesMut,
    order: ByteOrder,
}

impl Reply {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            data: 0,
            body: BytesMut::with_capacity(24),
            order,
        }
    }

    pub fn with_data(order: ByteOrder, data: u8) -> Self {
        Self {
            data,
            ..Self::new(order)
        }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.body.put_u8(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(v as u8)
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        match self.order {
            ByteOrder::Little => self.body.put_u16_le(v),
            ByteOrder::Big => self.body.put_u16(v),
        }
        self
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.u16(v as u16)
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        match self.order {
            ByteOrder::Little => self.body.put_u32_le(v),
            ByteOrder::Big => self.body.put_u32(v),
        }
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.u32(v as u32)
    }

    pub fn timestamp(&mut self, t: Timestamp) -> &mut Self {
        self.u32(t.0)
    }

    pub fn pad(&mut self, len: usize) -> &mut Self {
        self.body.put_bytes(0, len);
        self
    }

    /// Raw bytes followed by padding to a word boundary
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.body.put_slice(data);
        self.pad(pad4(data.len()) - data.len())
    }

    pub fn u16s(&mut self, values: &[u16]) -> &mut Self {
        for &v in values {
            self.u16(v);
        }
        self.pad(pad4(values.len() * 2) - values.len() * 2)
    }

    pub fn u32s<T: Copy + Into<u32>>(&mut self, values: &[T]) -> &mut Self {
        for &v in values {
            self.u32(v.into());
        }
        self
    }

    /// Fixed part must be complete before variable data; pad it to 24
    pub fn end_fixed(&mut self) -> &mut Self {
        if self.body.len() < 24 {
            let fill = 24 - self.body.len();
            self.pad(fill);
        }
        self
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Final bytes with the reply header filled in
    pub fn finish(mut self, sequence: u16) -> Bytes {
        self.end_fixed();
        let extra = pad4(self.body.len()) - self.body.len();
        self.pad(extra);
        let length = ((self.body.len() - 24) / 4) as u32;

        let mut out = BytesMut::with_capacity(8 + self.body.len());
        out.put_u8(1);
        out.put_u8(self.data);
        match self.order {
            ByteOrder::Little => {
                out.put_u16_le(sequence);
                out.put_u32_le(length);
            }
            ByteOrder::Big => {
                out.put_u16(sequence);
                out.put_u32(length);
            }
        }
        out.put_slice(&self.body);
        out.freeze()
    }
}

/// 32 byte X error
pub fn encode_error(err: &RrError, sequence: u16, major: u8, minor: u8, error_base: u8, order: ByteOrder) -> Bytes {
    let mut out = BytesMut::with_capacity(32);
    out.put_u8(0);
    out.put_u8(err.code(error_base));
    let (seq, value, minor) = (sequence, err.bad_value(), minor as u16);
    match order {
        ByteOrder::Little => {
            out.put_u16_le(seq);
            out.put_u32_le(value);
            out.put_u16_le(minor);
        }
        ByteOrder::Big => {
            out.put_u16(seq);
            out.put_u32(value);
            out.put_u16(minor);
        }
    }
    out.put_u8(major);
    out.put_bytes(0, 21);
    out.freeze()
}

/// 32 byte event for one listener on `window`
pub fn encode_event(event: &RrEvent, sequence: u16, window: u32, event_base: u8, order: ByteOrder) -> Bytes {
    let mut w = Reply::new(order);
    let (code, detail) = match &event.notify {
        Notify::Screen {
            rotation,
            timestamp,
            config_timestamp,
            root,
            width,
            height,
            mm_width,
            mm_height,
        } => {
            w.timestamp(*timestamp).timestamp(*config_timestamp).u32(*root).u32(window);
            // size id and subpixel order
            w.u16(0).u16(0);
            w.u16(*width).u16(*height).u16(*mm_width).u16(*mm_height);
            (SCREEN_CHANGE_NOTIFY, rotation.bits() as u8)
        }
        Notify::Crtc {
            timestamp,
            crtc,
            mode,
            rotation,
            x,
            y,
            width,
            height,
        } => {
            w.timestamp(*timestamp).u32(window).u32(crtc.0);
            w.u32(mode.map_or(NONE, |m| m.0)).u16(rotation.bits()).pad(2);
            w.i16(*x).i16(*y).u16(*width).u16(*height);
            (RR_NOTIFY, subcode::CRTC_CHANGE)
        }
        Notify::Output {
            timestamp,
            config_timestamp,
            output,
            crtc,
            mode,
            rotation,
            connection,
            subpixel,
        } => {
            w.timestamp(*timestamp).timestamp(*config_timestamp).u32(window).u32(output.0);
            w.u32(crtc.map_or(NONE, |c| c.0)).u32(mode.map_or(NONE, |m| m.0));
            w.u16(rotation.bits()).u8(*connection as u8).u8(*subpixel as u8);
            (RR_NOTIFY, subcode::OUTPUT_CHANGE)
        }
        Notify::OutputProperty {
            output,
            atom,
            timestamp,
            state,
        } => {
            w.u32(window).u32(output.0).u32(*atom).timestamp(*timestamp).u8(*state as u8);
            (RR_NOTIFY, subcode::OUTPUT_PROPERTY)
        }
        Notify::Provider { timestamp, provider } => {
            w.timestamp(*timestamp).u32(window).u32(provider.0);
            (RR_NOTIFY, subcode::PROVIDER_CHANGE)
        }
        Notify::ProviderProperty {
            provider,
            atom,
            timestamp,
            state,
        } => {
            w.u32(window).u32(provider.0).u32(*atom).timestamp(*timestamp).u8(*state as u8);
            (RR_NOTIFY, subcode::PROVIDER_PROPERTY)
        }
        Notify::Resource { timestamp } => {
            w.timestamp(*timestamp).u32(window);
            (RR_NOTIFY, subcode::RESOURCE_CHANGE)
        }
        Notify::Lease {
            timestamp,
            lease,
            created,
        } => {
            w.timestamp(*timestamp).u32(window).u32(lease.0).bool(*created);
            (RR_NOTIFY, subcode::LEASE)
        }
    };
    w.end_fixed();

    let mut out = BytesMut::with_capacity(32);
    out.put_u8(event_base + code);
    out.put_u8(detail);
    match order {
        ByteOrder::Little => out.put_u16_le(sequence),
        ByteOrder::Big => out.put_u16(sequence),
    }
    out.put_slice(&w.body[..28]);
    out.freeze()
}
