//! RandR request dispatch
//!
//! Decodes extension requests against a client's byte order, runs them on
//! the shared `Randr` state and encodes the reply or error. Events raised
//! while handling are fanned out to every client that selected them.

use crate::crtc::{ConfigStatus, CrtcConfig, GammaRamp};
use crate::driver::{Panning, ScreenSize};
use crate::error::{RrError, RrResult};
use crate::event::NotifyMask;
use crate::monitor::{Monitor, MonitorGeometry};
use crate::property::PropertyOwner;
use crate::screen::Randr;
use crate::transform::FixedMatrix;
use crate::types::{
    Bounds, CrtcId, LeaseId, ModeId, OutputId, ProviderId, ScreenId, Timestamp, WindowId, NONE,
};
use crate::wire::{self, ByteOrder, Reply, RequestReader};
use bytes::Bytes;
use std::collections::HashMap;
use std::os::fd::OwnedFd;

/// RandR minor opcodes
mod opcodes {
    pub use x11rb_protocol::protocol::randr::{
        CHANGE_OUTPUT_PROPERTY_REQUEST, CHANGE_PROVIDER_PROPERTY_REQUEST, CONFIGURE_OUTPUT_PROPERTY_REQUEST,
        CONFIGURE_PROVIDER_PROPERTY_REQUEST, CREATE_LEASE_REQUEST, DELETE_MONITOR_REQUEST,
        DELETE_OUTPUT_PROPERTY_REQUEST, DELETE_PROVIDER_PROPERTY_REQUEST, FREE_LEASE_REQUEST,
        GET_CRTC_GAMMA_REQUEST, GET_CRTC_GAMMA_SIZE_REQUEST, GET_CRTC_INFO_REQUEST, GET_CRTC_TRANSFORM_REQUEST,
        GET_MONITORS_REQUEST, GET_OUTPUT_INFO_REQUEST, GET_OUTPUT_PRIMARY_REQUEST, GET_OUTPUT_PROPERTY_REQUEST,
        GET_PANNING_REQUEST, GET_PROVIDERS_REQUEST, GET_PROVIDER_INFO_REQUEST, GET_PROVIDER_PROPERTY_REQUEST,
        GET_SCREEN_RESOURCES_CURRENT_REQUEST, GET_SCREEN_RESOURCES_REQUEST, GET_SCREEN_SIZE_RANGE_REQUEST,
        LIST_OUTPUT_PROPERTIES_REQUEST, LIST_PROVIDER_PROPERTIES_REQUEST, QUERY_OUTPUT_PROPERTY_REQUEST,
        QUERY_PROVIDER_PROPERTY_REQUEST, QUERY_VERSION_REQUEST, SELECT_INPUT_REQUEST, SET_CRTC_CONFIG_REQUEST,
        SET_CRTC_GAMMA_REQUEST, SET_CRTC_TRANSFORM_REQUEST, SET_MONITOR_REQUEST, SET_OUTPUT_PRIMARY_REQUEST,
        SET_PANNING_REQUEST, SET_PROVIDER_OFFLOAD_SINK_REQUEST, SET_PROVIDER_OUTPUT_SOURCE_REQUEST,
        SET_SCREEN_SIZE_REQUEST,
    };
}

pub use x11rb_protocol::protocol::randr::X11_EXTENSION_NAME as EXTENSION_NAME;

/// Highest protocol version spoken
pub const SERVER_VERSION: (u32, u32) = (1, 6);

pub type ClientId = u32;

struct ClientState {
    order: ByteOrder,
    version: (u32, u32),
    selections: Vec<(WindowId, NotifyMask)>,
    leases: Vec<LeaseId>,
    last_sequence: u16,
}

/// Result of one request: an encoded reply or error, plus any descriptors
/// that must travel with it
#[derive(Debug, Default)]
pub struct Response {
    pub reply: Option<Bytes>,
    pub fds: Vec<OwnedFd>,
}

impl Response {
    fn reply(bytes: Bytes) -> Self {
        Self {
            reply: Some(bytes),
            fds: Vec::new(),
        }
    }
}

type Handled = RrResult<Response>;

pub struct RandrServer {
    pub randr: Randr,
    pub major_opcode: u8,
    pub event_base: u8,
    pub error_base: u8,
    clients: HashMap<ClientId, ClientState>,
}

impl RandrServer {
    pub fn new(randr: Randr, major_opcode: u8, event_base: u8, error_base: u8) -> Self {
        Self {
            randr,
            major_opcode,
            event_base,
            error_base,
            clients: HashMap::new(),
        }
    }

    pub fn add_client(&mut self, id: ClientId, order: ByteOrder) {
        self.clients.insert(
            id,
            ClientState {
                order,
                version: (0, 0),
                selections: Vec::new(),
                leases: Vec::new(),
                last_sequence: 0,
            },
        );
    }

    /// Drop a client; leases it still names are freed as with FreeLease
    pub fn remove_client(&mut self, id: ClientId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        for lease in client.leases {
            if let Err(err) = self.randr.free_lease(lease, false) {
                log::debug!("client {} lease {:#x}: {}", id, lease.0, err);
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Handle one complete request, header included
    pub fn handle_request(&mut self, client: ClientId, sequence: u16, data: &[u8]) -> Response {
        let Some(state) = self.clients.get_mut(&client) else {
            log::warn!("request from unknown client {}", client);
            return Response::default();
        };
        state.last_sequence = sequence;
        let order = state.order;
        let minor = data.get(1).copied().unwrap_or(0);
        let body = data.get(4..).unwrap_or(&[]);

        match self.process_request(client, order, sequence, minor, body) {
            Ok(response) => response,
            Err(err) => {
                log::debug!("client {} minor {}: {}", client, minor, err);
                Response::reply(wire::encode_error(
                    &err,
                    sequence,
                    self.major_opcode,
                    minor,
                    self.error_base,
                    order,
                ))
            }
        }
    }

    fn process_request(&mut self, client: ClientId, order: ByteOrder, seq: u16, minor: u8, body: &[u8]) -> Handled {
        use opcodes::*;
        let mut r = RequestReader::new(body, order);
        let r = &mut r;
        match minor {
            QUERY_VERSION_REQUEST => self.handle_query_version(client, r, seq),
            SELECT_INPUT_REQUEST => self.handle_select_input(client, r),
            GET_SCREEN_SIZE_RANGE_REQUEST => self.handle_get_screen_size_range(r, seq),
            SET_SCREEN_SIZE_REQUEST => self.handle_set_screen_size(r),
            GET_SCREEN_RESOURCES_REQUEST | GET_SCREEN_RESOURCES_CURRENT_REQUEST => {
                self.handle_get_screen_resources(r, seq)
            }
            GET_OUTPUT_INFO_REQUEST => self.handle_get_output_info(r, seq),
            LIST_OUTPUT_PROPERTIES_REQUEST => {
                let owner = PropertyOwner::Output(OutputId(r.u32()?));
                self.handle_list_properties(owner, order, seq)
            }
            QUERY_OUTPUT_PROPERTY_REQUEST => {
                let owner = PropertyOwner::Output(OutputId(r.u32()?));
                self.handle_query_property(owner, r, seq)
            }
            CONFIGURE_OUTPUT_PROPERTY_REQUEST => {
                let owner = PropertyOwner::Output(OutputId(r.u32()?));
                self.handle_configure_property(owner, r)
            }
            CHANGE_OUTPUT_PROPERTY_REQUEST => {
                let owner = PropertyOwner::Output(OutputId(r.u32()?));
                self.handle_change_property(owner, r)
            }
            DELETE_OUTPUT_PROPERTY_REQUEST => {
                let owner = PropertyOwner::Output(OutputId(r.u32()?));
                self.handle_delete_property(owner, r)
            }
            GET_OUTPUT_PROPERTY_REQUEST => {
                let owner = PropertyOwner::Output(OutputId(r.u32()?));
                self.handle_get_property(owner, r, seq)
            }
            GET_CRTC_INFO_REQUEST => self.handle_get_crtc_info(r, seq),
            SET_CRTC_CONFIG_REQUEST => self.handle_set_crtc_config(r, seq),
            GET_CRTC_GAMMA_SIZE_REQUEST => self.handle_get_crtc_gamma_size(r, seq),
            GET_CRTC_GAMMA_REQUEST => self.handle_get_crtc_gamma(r, seq),
            SET_CRTC_GAMMA_REQUEST => self.handle_set_crtc_gamma(r),
            SET_CRTC_TRANSFORM_REQUEST => self.handle_set_crtc_transform(r),
            GET_CRTC_TRANSFORM_REQUEST => self.handle_get_crtc_transform(r, seq),
            GET_PANNING_REQUEST => self.handle_get_panning(r, seq),
            SET_PANNING_REQUEST => self.handle_set_panning(r, seq),
            SET_OUTPUT_PRIMARY_REQUEST => self.handle_set_output_primary(r),
            GET_OUTPUT_PRIMARY_REQUEST => self.handle_get_output_primary(r, seq),
            GET_PROVIDERS_REQUEST => self.handle_get_providers(r, seq),
            GET_PROVIDER_INFO_REQUEST => self.handle_get_provider_info(r, seq),
            SET_PROVIDER_OFFLOAD_SINK_REQUEST => {
                let (provider, peer) = read_provider_pair(r)?;
                self.randr.set_offload_sink(provider, peer)?;
                Ok(Response::default())
            }
            SET_PROVIDER_OUTPUT_SOURCE_REQUEST => {
                let (provider, peer) = read_provider_pair(r)?;
                self.randr.set_output_source(provider, peer)?;
                Ok(Response::default())
            }
            LIST_PROVIDER_PROPERTIES_REQUEST => {
                let owner = PropertyOwner::Provider(ProviderId(r.u32()?));
                self.handle_list_properties(owner, order, seq)
            }
            QUERY_PROVIDER_PROPERTY_REQUEST => {
                let owner = PropertyOwner::Provider(ProviderId(r.u32()?));
                self.handle_query_property(owner, r, seq)
            }
            CONFIGURE_PROVIDER_PROPERTY_REQUEST => {
                let owner = PropertyOwner::Provider(ProviderId(r.u32()?));
                self.handle_configure_property(owner, r)
            }
            CHANGE_PROVIDER_PROPERTY_REQUEST => {
                let owner = PropertyOwner::Provider(ProviderId(r.u32()?));
                self.handle_change_property(owner, r)
            }
            DELETE_PROVIDER_PROPERTY_REQUEST => {
                let owner = PropertyOwner::Provider(ProviderId(r.u32()?));
                self.handle_delete_property(owner, r)
            }
            GET_PROVIDER_PROPERTY_REQUEST => {
                let owner = PropertyOwner::Provider(ProviderId(r.u32()?));
                self.handle_get_property(owner, r, seq)
            }
            GET_MONITORS_REQUEST => self.handle_get_monitors(r, seq),
            SET_MONITOR_REQUEST => self.handle_set_monitor(r),
            DELETE_MONITOR_REQUEST => {
                let screen = self.window_screen(r)?;
                let name = r.u32()?;
                self.randr.delete_monitor(screen, name)?;
                Ok(Response::default())
            }
            CREATE_LEASE_REQUEST => self.handle_create_lease(client, r, seq),
            FREE_LEASE_REQUEST => self.handle_free_lease(client, r),
            _ => {
                log::debug!("unsupported randr request {}", minor);
                Err(RrError::Request)
            }
        }
    }

    fn window_screen(&self, r: &mut RequestReader<'_>) -> RrResult<ScreenId> {
        self.randr.screen_for_window(WindowId(r.u32()?))
    }

    fn handle_query_version(&mut self, client: ClientId, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let requested = (r.u32()?, r.u32()?);
        let version = requested.min(SERVER_VERSION);
        if let Some(state) = self.clients.get_mut(&client) {
            state.version = version;
        }
        let mut reply = Reply::new(r.order());
        reply.u32(version.0).u32(version.1);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_select_input(&mut self, client: ClientId, r: &mut RequestReader<'_>) -> Handled {
        let window = WindowId(r.u32()?);
        let mask = NotifyMask::from_bits_truncate(r.u16()?);
        self.randr.screen_for_window(window)?;
        if let Some(state) = self.clients.get_mut(&client) {
            state.selections.retain(|(w, _)| *w != window);
            if !mask.is_empty() {
                state.selections.push((window, mask));
            }
        }
        Ok(Response::default())
    }

    fn handle_get_screen_size_range(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let screen = self.window_screen(r)?;
        let range = self.randr.screen_size_range(screen);
        let mut reply = Reply::new(r.order());
        reply
            .u16(range.min_width)
            .u16(range.min_height)
            .u16(range.max_width)
            .u16(range.max_height);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_set_screen_size(&mut self, r: &mut RequestReader<'_>) -> Handled {
        let screen = self.window_screen(r)?;
        let size = ScreenSize {
            width: r.u16()?,
            height: r.u16()?,
            mm_width: r.u32()?,
            mm_height: r.u32()?,
        };
        self.randr.set_screen_size(screen, &size)?;
        Ok(Response::default())
    }

    fn handle_get_screen_resources(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let screen = self.window_screen(r)?;
        let res = self.randr.screen_resources(screen);
        let names_len: usize = res.modes.iter().map(|m| m.name.len()).sum();

        let mut reply = Reply::new(r.order());
        reply
            .timestamp(res.timestamp)
            .timestamp(res.config_timestamp)
            .u16(res.crtcs.len() as u16)
            .u16(res.outputs.len() as u16)
            .u16(res.modes.len() as u16)
            .u16(names_len as u16)
            .end_fixed();
        reply.u32s(&res.crtcs).u32s(&res.outputs);
        for mode in &res.modes {
            let info = &mode.info;
            reply
                .u32(mode.id.0)
                .u16(info.width)
                .u16(info.height)
                .u32(info.dot_clock)
                .u16(info.h_sync_start)
                .u16(info.h_sync_end)
                .u16(info.h_total)
                .u16(info.h_skew)
                .u16(info.v_sync_start)
                .u16(info.v_sync_end)
                .u16(info.v_total)
                .u16(mode.name.len() as u16)
                .u32(info.flags);
        }
        let names: Vec<u8> = res.modes.iter().flat_map(|m| m.name.bytes()).collect();
        reply.bytes(&names);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_get_output_info(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let output = OutputId(r.u32()?);
        let _config_timestamp = r.timestamp()?;
        let info = self.randr.output_info(output)?;

        let mut reply = Reply::with_data(r.order(), ConfigStatus::Success as u8);
        reply
            .timestamp(info.timestamp)
            .u32(info.crtc.map_or(NONE, |c| c.0))
            .u32(info.mm_width)
            .u32(info.mm_height)
            .u8(info.connection as u8)
            .u8(info.subpixel as u8)
            .u16(info.crtcs.len() as u16)
            .u16(info.modes.len() as u16)
            .u16(info.num_preferred)
            .u16(info.clones.len() as u16)
            .u16(info.name.len() as u16);
        reply
            .u32s(&info.crtcs)
            .u32s(&info.modes)
            .u32s(&info.clones)
            .bytes(info.name.as_bytes());
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_list_properties(&mut self, owner: PropertyOwner, order: ByteOrder, seq: u16) -> Handled {
        let atoms = self.randr.list_properties(owner)?;
        let mut reply = Reply::new(order);
        reply.u16(atoms.len() as u16).end_fixed();
        reply.u32s(&atoms);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_query_property(&mut self, owner: PropertyOwner, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let name = r.u32()?;
        let prop = self.randr.query_property(owner, name)?;
        let mut reply = Reply::new(r.order());
        reply
            .bool(prop.is_pending)
            .bool(prop.range)
            .bool(prop.immutable)
            .end_fixed();
        for &value in &prop.valid_values {
            reply.i32(value);
        }
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_configure_property(&mut self, owner: PropertyOwner, r: &mut RequestReader<'_>) -> Handled {
        let name = r.u32()?;
        let pending = r.bool()?;
        let range = r.bool()?;
        r.skip(2)?;
        let values: Vec<i32> = r.rest_u32()?.into_iter().map(|v| v as i32).collect();
        self.randr
            .configure_property_request(owner, name, pending, range, &values)?;
        Ok(Response::default())
    }

    fn handle_change_property(&mut self, owner: PropertyOwner, r: &mut RequestReader<'_>) -> Handled {
        let name = r.u32()?;
        let type_ = r.u32()?;
        let format = r.u8()?;
        let mode = r.u8()?;
        r.skip(2)?;
        let units = r.u32()?;
        if !matches!(format, 8 | 16 | 32) {
            return Err(RrError::Value(format as u32));
        }
        let len = (units as usize)
            .checked_mul(format as usize / 8)
            .ok_or(RrError::Length)?;
        let mut data = r.bytes(len)?.to_vec();
        wire::reorder_items(&mut data, format, r.order());
        self.randr
            .change_property_request(owner, name, type_, format, mode, &data)?;
        Ok(Response::default())
    }

    fn handle_delete_property(&mut self, owner: PropertyOwner, r: &mut RequestReader<'_>) -> Handled {
        let name = r.u32()?;
        self.randr.delete_property(owner, name)?;
        Ok(Response::default())
    }

    fn handle_get_property(&mut self, owner: PropertyOwner, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let name = r.u32()?;
        let type_ = r.u32()?;
        let long_offset = r.u32()?;
        let long_length = r.u32()?;
        let delete = r.bool()?;
        let pending = r.bool()?;
        let read = self
            .randr
            .get_property(owner, name, type_, long_offset, long_length, delete, pending)?;

        let mut data = read.data.clone();
        wire::reorder_items(&mut data, read.format, r.order());
        let mut reply = Reply::with_data(r.order(), read.format);
        reply
            .u32(read.type_)
            .u32(read.bytes_after)
            .u32(read.num_items())
            .end_fixed()
            .bytes(&data);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_get_crtc_info(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let crtc = CrtcId(r.u32()?);
        let _config_timestamp = r.timestamp()?;
        let info = self.randr.crtc_info(crtc)?;

        let mut reply = Reply::with_data(r.order(), ConfigStatus::Success as u8);
        reply
            .timestamp(info.timestamp)
            .i16(info.x)
            .i16(info.y)
            .u16(info.width)
            .u16(info.height)
            .u32(info.mode.map_or(NONE, |m| m.0))
            .u16(info.rotation.bits())
            .u16(info.rotations.bits())
            .u16(info.outputs.len() as u16)
            .u16(info.possible.len() as u16);
        reply.u32s(&info.outputs).u32s(&info.possible);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_set_crtc_config(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let crtc = CrtcId(r.u32()?);
        let timestamp = r.timestamp()?;
        let _config_timestamp = r.timestamp()?;
        let x = r.i16()?;
        let y = r.i16()?;
        let mode = r.u32()?;
        let rotation = r.u16()?;
        r.skip(2)?;
        let outputs: Vec<OutputId> = r.rest_u32()?.into_iter().map(OutputId).collect();

        let config = CrtcConfig {
            crtc,
            timestamp,
            mode: (mode != NONE).then_some(ModeId(mode)),
            x,
            y,
            rotation,
            outputs: &outputs,
        };
        let (status, time) = self.randr.set_crtc_config(&config)?;
        let mut reply = Reply::with_data(r.order(), status as u8);
        reply.timestamp(time);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_get_crtc_gamma_size(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let size = self.randr.gamma_size(CrtcId(r.u32()?))?;
        let mut reply = Reply::new(r.order());
        reply.u16(size as u16);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_get_crtc_gamma(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let ramp = self.randr.gamma_get(CrtcId(r.u32()?))?;
        let mut reply = Reply::new(r.order());
        reply.u16(ramp.size() as u16).end_fixed();
        let all: Vec<u16> = [&ramp.red, &ramp.green, &ramp.blue]
            .into_iter()
            .flatten()
            .copied()
            .collect();
        reply.u16s(&all);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_set_crtc_gamma(&mut self, r: &mut RequestReader<'_>) -> Handled {
        let crtc = CrtcId(r.u32()?);
        let size = r.u16()? as usize;
        r.skip(2)?;
        let ramp = GammaRamp {
            red: r.u16_list(size)?,
            green: r.u16_list(size)?,
            blue: r.u16_list(size)?,
        };
        self.randr.gamma_set(crtc, ramp)?;
        Ok(Response::default())
    }

    fn handle_set_crtc_transform(&mut self, r: &mut RequestReader<'_>) -> Handled {
        let crtc = CrtcId(r.u32()?);
        let mut cells = [0i32; 9];
        for cell in cells.iter_mut() {
            *cell = r.i32()?;
        }
        let filter_len = r.u16()? as usize;
        r.skip(2)?;
        let filter = r.padded_bytes(filter_len)?;
        let params: Vec<i32> = r.rest_u32()?.into_iter().map(|v| v as i32).collect();
        self.randr
            .transform_set(crtc, FixedMatrix::from_array(cells), filter, &params)?;
        Ok(Response::default())
    }

    fn handle_get_crtc_transform(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let info = self.randr.crtc_transform(CrtcId(r.u32()?))?;
        let pending_filter = info.pending.filter.as_ref().map_or("", |f| f.name());
        let current_filter = info.current.filter.as_ref().map_or("", |f| f.name());

        let mut reply = Reply::new(r.order());
        for cell in info.pending.matrix.to_array() {
            reply.i32(cell);
        }
        reply.bool(info.has_transforms).pad(3);
        for cell in info.current.matrix.to_array() {
            reply.i32(cell);
        }
        reply
            .pad(4)
            .u16(pending_filter.len() as u16)
            .u16(info.pending.params.len() as u16)
            .u16(current_filter.len() as u16)
            .u16(info.current.params.len() as u16);
        reply.bytes(pending_filter.as_bytes());
        for &p in &info.pending.params {
            reply.i32(p);
        }
        reply.bytes(current_filter.as_bytes());
        for &p in &info.current.params {
            reply.i32(p);
        }
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_get_panning(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let (time, panning) = self.randr.panning(CrtcId(r.u32()?))?;
        let mut reply = Reply::with_data(r.order(), ConfigStatus::Success as u8);
        reply.timestamp(time);
        put_box(&mut reply, &panning.total);
        put_box(&mut reply, &panning.tracking);
        for border in panning.border {
            reply.i16(border);
        }
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_set_panning(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let crtc = CrtcId(r.u32()?);
        let timestamp = r.timestamp()?;
        let total = read_box(r)?;
        let tracking = read_box(r)?;
        let mut border = [0i16; 4];
        for b in border.iter_mut() {
            *b = r.i16()?;
        }
        let panning = Panning {
            total,
            tracking,
            border,
        };
        let (status, time) = self.randr.set_panning(crtc, timestamp, &panning)?;
        let mut reply = Reply::with_data(r.order(), status as u8);
        reply.timestamp(time);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_set_output_primary(&mut self, r: &mut RequestReader<'_>) -> Handled {
        let screen = self.window_screen(r)?;
        let output = r.u32()?;
        self.randr
            .set_output_primary(screen, (output != NONE).then_some(OutputId(output)))?;
        Ok(Response::default())
    }

    fn handle_get_output_primary(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let screen = self.window_screen(r)?;
        let output = self.randr.output_primary(screen);
        let mut reply = Reply::new(r.order());
        reply.u32(output.map_or(NONE, |o| o.0));
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_get_providers(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let screen = self.window_screen(r)?;
        let (time, providers) = self.randr.providers(screen);
        let mut reply = Reply::new(r.order());
        reply.timestamp(time).u16(providers.len() as u16).end_fixed();
        reply.u32s(&providers);
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_get_provider_info(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let provider = ProviderId(r.u32()?);
        let _config_timestamp = r.timestamp()?;
        let info = self.randr.provider_info(provider)?;

        let mut reply = Reply::with_data(r.order(), ConfigStatus::Success as u8);
        reply
            .timestamp(info.timestamp)
            .u32(info.capabilities.bits())
            .u16(info.crtcs.len() as u16)
            .u16(info.outputs.len() as u16)
            .u16(info.associated.len() as u16)
            .u16(info.name.len() as u16)
            .end_fixed();
        reply.u32s(&info.crtcs).u32s(&info.outputs);
        for (peer, _) in &info.associated {
            reply.u32(peer.0);
        }
        for (_, role) in &info.associated {
            reply.u32(role.bits());
        }
        reply.bytes(info.name.as_bytes());
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_get_monitors(&mut self, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let screen = self.window_screen(r)?;
        let get_active = r.bool()?;
        let (time, monitors) = self.randr.get_monitors(screen, get_active);
        let num_outputs: usize = monitors.iter().map(|m| m.outputs.len()).sum();

        let mut reply = Reply::new(r.order());
        reply
            .timestamp(time)
            .u32(monitors.len() as u32)
            .u32(num_outputs as u32)
            .end_fixed();
        for monitor in &monitors {
            let geometry = &monitor.geometry;
            reply
                .u32(monitor.name)
                .bool(monitor.primary)
                .bool(monitor.automatic)
                .u16(monitor.outputs.len() as u16)
                .i16(geometry.bounds.x1 as i16)
                .i16(geometry.bounds.y1 as i16)
                .u16(geometry.bounds.width() as u16)
                .u16(geometry.bounds.height() as u16)
                .u32(geometry.mm_width)
                .u32(geometry.mm_height)
                .u32s(&monitor.outputs);
        }
        Ok(Response::reply(reply.finish(seq)))
    }

    fn handle_set_monitor(&mut self, r: &mut RequestReader<'_>) -> Handled {
        let screen = self.window_screen(r)?;
        let name = r.u32()?;
        let primary = r.bool()?;
        let _automatic = r.bool()?;
        let num_outputs = r.u16()? as usize;
        let x = r.i16()? as i32;
        let y = r.i16()? as i32;
        let width = r.u16()? as i32;
        let height = r.u16()? as i32;
        let mm_width = r.u32()?;
        let mm_height = r.u32()?;
        let outputs: Vec<OutputId> = r.u32_list(num_outputs)?.into_iter().map(OutputId).collect();
        if r.remaining() != 0 {
            return Err(RrError::Length);
        }
        for &output in &outputs {
            self.randr.output(output)?;
        }

        let geometry = MonitorGeometry {
            bounds: Bounds::from_size(x, y, width, height),
            mm_width,
            mm_height,
        };
        self.randr
            .set_monitor(screen, Monitor::declared(name, screen, outputs, primary, geometry))?;
        Ok(Response::default())
    }

    fn handle_create_lease(&mut self, client: ClientId, r: &mut RequestReader<'_>, seq: u16) -> Handled {
        let screen = self.window_screen(r)?;
        let id = LeaseId(r.u32()?);
        let num_crtcs = r.u16()? as usize;
        let num_outputs = r.u16()? as usize;
        let crtcs: Vec<CrtcId> = r.u32_list(num_crtcs)?.into_iter().map(CrtcId).collect();
        let outputs: Vec<OutputId> = r.u32_list(num_outputs)?.into_iter().map(OutputId).collect();
        if r.remaining() != 0 {
            return Err(RrError::Length);
        }

        let fd = self.randr.create_lease(screen, id, &crtcs, &outputs)?;
        if let Some(state) = self.clients.get_mut(&client) {
            state.leases.push(id);
        }
        let reply = Reply::with_data(r.order(), 1);
        Ok(Response {
            reply: Some(reply.finish(seq)),
            fds: vec![fd],
        })
    }

    fn handle_free_lease(&mut self, client: ClientId, r: &mut RequestReader<'_>) -> Handled {
        let id = LeaseId(r.u32()?);
        let terminate = r.bool()?;
        self.randr.free_lease(id, terminate)?;
        if let Some(state) = self.clients.get_mut(&client) {
            state.leases.retain(|&l| l != id);
        }
        Ok(Response::default())
    }

    /// Encode queued events for every client that selected them on the
    /// event's root window
    pub fn pending_events(&mut self) -> Vec<(ClientId, Bytes)> {
        let events = self.randr.take_events();
        let mut out = Vec::new();
        for event in &events {
            let root = self.randr.screen(event.screen).root;
            let mask = event.notify.mask();
            for (&id, client) in &self.clients {
                // 1.0 clients only understand ScreenChangeNotify
                if client.version < (1, 2) && mask != NotifyMask::SCREEN_CHANGE {
                    continue;
                }
                for &(window, selected) in &client.selections {
                    if window == root && selected.contains(mask) {
                        out.push((
                            id,
                            wire::encode_event(event, client.last_sequence, window.0, self.event_base, client.order),
                        ));
                    }
                }
            }
        }
        out
    }
}

fn read_provider_pair(r: &mut RequestReader<'_>) -> RrResult<(ProviderId, Option<ProviderId>)> {
    let provider = ProviderId(r.u32()?);
    let peer = r.u32()?;
    let _config_timestamp: Timestamp = r.timestamp()?;
    Ok((provider, (peer != NONE).then_some(ProviderId(peer))))
}

fn read_box(r: &mut RequestReader<'_>) -> RrResult<Bounds> {
    let left = r.u16()? as i32;
    let top = r.u16()? as i32;
    let width = r.u16()? as i32;
    let height = r.u16()? as i32;
    Ok(Bounds::from_size(left, top, width, height))
}

fn put_box(reply: &mut Reply, b: &Bounds) {
    reply
        .u16(b.x1 as u16)
        .u16(b.y1 as u16)
        .u16(b.width().max(0) as u16)
        .u16(b.height().max(0) as u16);
}
