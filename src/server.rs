//! Unix socket X server carrying the RandR extension
//!
//! Speaks just enough core protocol for xcb/Xlib clients to connect, find
//! the extension and sync; everything else with major opcode
//! `RANDR_MAJOR_OPCODE` goes to the RandR dispatcher.

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use tokio::io::{AsyncReadExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use x11rr_core::{
    encode_error, ByteOrder, ClientId, Randr, RandrServer, Reply, RequestReader, RrError, EXTENSION_NAME,
};

const X11_UNIX_DIR: &str = "/tmp/.X11-unix";

// Extension numbers
const RANDR_MAJOR_OPCODE: u8 = 140;
const RANDR_EVENT_BASE: u8 = 89;
const RANDR_ERROR_BASE: u8 = 147;

const VENDOR: &[u8] = b"x11rr";
const ROOT_VISUAL: u32 = 0x21;
const DEFAULT_COLORMAP: u32 = 0x20;
const CLIENT_ID_MASK: u32 = 0x001f_ffff;

/// Core opcodes handled here
mod opcodes {
    pub const INTERN_ATOM: u8 = 16;
    pub const GET_ATOM_NAME: u8 = 17;
    pub const GET_PROPERTY: u8 = 20;
    pub const GET_INPUT_FOCUS: u8 = 43;
    pub const QUERY_EXTENSION: u8 = 98;
    pub const LIST_EXTENSIONS: u8 = 99;

    /// Requests without a reply that clients send during startup
    pub const IGNORED: &[u8] = &[1, 2, 4, 8, 10, 12, 18, 19, 42, 45, 46, 55, 60];
}

/// Bytes for one client, with descriptors riding on the first write
struct Outgoing {
    bytes: Bytes,
    fds: Vec<OwnedFd>,
}

/// Everything shared between client tasks
struct Core {
    rr: RandrServer,
    next_client: ClientId,
    outboxes: HashMap<ClientId, mpsc::UnboundedSender<Outgoing>>,
}

impl Core {
    fn new(randr: Randr) -> Self {
        Self {
            rr: RandrServer::new(randr, RANDR_MAJOR_OPCODE, RANDR_EVENT_BASE, RANDR_ERROR_BASE),
            next_client: 1,
            outboxes: HashMap::new(),
        }
    }

    fn connect(&mut self, order: ByteOrder, outbox: mpsc::UnboundedSender<Outgoing>) -> ClientId {
        let id = self.next_client;
        self.next_client += 1;
        self.rr.add_client(id, order);
        self.outboxes.insert(id, outbox);
        id
    }

    fn disconnect(&mut self, id: ClientId) {
        self.outboxes.remove(&id);
        self.rr.remove_client(id);
        self.flush_events();
    }

    /// Hand queued RandR events to their clients
    fn flush_events(&mut self) {
        for (client, bytes) in self.rr.pending_events() {
            if let Some(outbox) = self.outboxes.get(&client) {
                if let Err(err) = outbox.send(Outgoing { bytes, fds: Vec::new() }) {
                    log::debug!("client {} event dropped: {}", client, err);
                }
            }
        }
    }

    /// Connection setup reply listing every non-GPU screen
    fn setup_reply(&self, client: ClientId, order: ByteOrder) -> Bytes {
        let randr = &self.rr.randr;
        let screens: Vec<_> = randr.screens().iter().filter(|s| !s.is_gpu).collect();

        let mut body = Put::new(order);
        body.u32(0) // release
            .u32(client << 21)
            .u32(CLIENT_ID_MASK)
            .u32(0) // motion buffer
            .u16(VENDOR.len() as u16)
            .u16(0xffff)
            .u8(screens.len() as u8)
            .u8(1) // formats
            .u8(matches!(order, ByteOrder::Big) as u8)
            .u8(0)
            .u8(32)
            .u8(32)
            .u8(8)
            .u8(255)
            .pad(4)
            .bytes(VENDOR);
        // format: depth 24, 32 bpp, pad 32
        body.u8(24).u8(32).u8(32).pad(5);
        for screen in screens {
            body.u32(screen.root.0)
                .u32(DEFAULT_COLORMAP)
                .u32(0x00ff_ffff)
                .u32(0)
                .u32(0)
                .u16(screen.width)
                .u16(screen.height)
                .u16(screen.mm_width as u16)
                .u16(screen.mm_height as u16)
                .u16(1)
                .u16(1)
                .u32(ROOT_VISUAL)
                .u8(0)
                .u8(0)
                .u8(screen.root_depth)
                .u8(1);
            // one depth with one TrueColor visual
            body.u8(screen.root_depth).u8(0).u16(1).pad(4);
            body.u32(ROOT_VISUAL)
                .u8(4)
                .u8(8)
                .u16(256)
                .u32(0x00ff_0000)
                .u32(0x0000_ff00)
                .u32(0x0000_00ff)
                .pad(4);
        }

        let body = body.finish();
        let mut head = Put::new(order);
        head.u8(1).u8(0).u16(11).u16(0).u16((body.len() / 4) as u16);
        let mut out = BytesMut::from(&head.finish()[..]);
        out.put_slice(&body);
        out.freeze()
    }

    fn handle(&mut self, client: ClientId, order: ByteOrder, seq: u16, data: &[u8]) -> Option<Outgoing> {
        let major = data[0];
        if major == RANDR_MAJOR_OPCODE {
            let response = self.rr.handle_request(client, seq, data);
            return response.reply.map(|bytes| Outgoing {
                bytes,
                fds: response.fds,
            });
        }

        let mut r = RequestReader::new(&data[4..], order);
        let result = match major {
            opcodes::INTERN_ATOM => self.intern_atom(data[1] != 0, &mut r, seq).map(Some),
            opcodes::GET_ATOM_NAME => self.get_atom_name(&mut r, seq).map(Some),
            opcodes::GET_PROPERTY => {
                // no window properties here
                let mut reply = Reply::new(order);
                reply.u32(0).u32(0).u32(0);
                Ok(Some(reply.finish(seq)))
            }
            opcodes::GET_INPUT_FOCUS => {
                let root = self.rr.randr.screens().first().map_or(0, |s| s.root.0);
                let mut reply = Reply::new(order);
                reply.u32(root);
                Ok(Some(reply.finish(seq)))
            }
            opcodes::QUERY_EXTENSION => self.query_extension(&mut r, seq).map(Some),
            opcodes::LIST_EXTENSIONS => {
                let mut reply = Reply::with_data(order, 1);
                reply.end_fixed();
                let mut names = vec![EXTENSION_NAME.len() as u8];
                names.extend_from_slice(EXTENSION_NAME.as_bytes());
                reply.bytes(&names);
                Ok(Some(reply.finish(seq)))
            }
            op if opcodes::IGNORED.contains(&op) => Ok(None),
            op => {
                log::debug!("client {}: unhandled core opcode {}", client, op);
                Err(RrError::Request)
            }
        };

        let bytes = match result {
            Ok(reply) => reply?,
            Err(err) => encode_error(&err, seq, major, 0, RANDR_ERROR_BASE, order),
        };
        Some(Outgoing {
            bytes,
            fds: Vec::new(),
        })
    }

    fn intern_atom(&mut self, only_if_exists: bool, r: &mut RequestReader<'_>, seq: u16) -> Result<Bytes, RrError> {
        let len = r.u16()? as usize;
        r.skip(2)?;
        let name = String::from_utf8_lossy(r.bytes(len)?).into_owned();
        let atom = self.rr.randr.atoms.intern(&name, only_if_exists).unwrap_or(0);
        let mut reply = Reply::new(r.order());
        reply.u32(atom);
        Ok(reply.finish(seq))
    }

    fn get_atom_name(&self, r: &mut RequestReader<'_>, seq: u16) -> Result<Bytes, RrError> {
        let atom = r.u32()?;
        let name = self.rr.randr.atoms.get_name(atom).ok_or(RrError::Atom(atom))?;
        let mut reply = Reply::new(r.order());
        reply.u16(name.len() as u16).end_fixed().bytes(name.as_bytes());
        Ok(reply.finish(seq))
    }

    fn query_extension(&self, r: &mut RequestReader<'_>, seq: u16) -> Result<Bytes, RrError> {
        let len = r.u16()? as usize;
        r.skip(2)?;
        let name = r.bytes(len)?;
        let present = name == EXTENSION_NAME.as_bytes();
        log::debug!("QueryExtension {} -> {}", String::from_utf8_lossy(name), present);

        let mut reply = Reply::new(r.order());
        if present {
            reply
                .bool(true)
                .u8(RANDR_MAJOR_OPCODE)
                .u8(RANDR_EVENT_BASE)
                .u8(RANDR_ERROR_BASE);
        } else {
            reply.pad(4);
        }
        Ok(reply.finish(seq))
    }
}

/// Byte-order aware builder for the setup reply
struct Put {
    buf: BytesMut,
    order: ByteOrder,
}

impl Put {
    fn new(order: ByteOrder) -> Self {
        Self {
            buf: BytesMut::new(),
            order,
        }
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        match self.order {
            ByteOrder::Little => self.buf.put_u16_le(v),
            ByteOrder::Big => self.buf.put_u16(v),
        }
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        match self.order {
            ByteOrder::Little => self.buf.put_u32_le(v),
            ByteOrder::Big => self.buf.put_u32(v),
        }
        self
    }

    fn pad(&mut self, n: usize) -> &mut Self {
        self.buf.put_bytes(0, n);
        self
    }

    fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self.pad((4 - data.len() % 4) % 4)
    }

    fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// Length of the setup request once its fixed part is in
fn setup_len(pending: &[u8], order: ByteOrder) -> Option<usize> {
    let mut r = RequestReader::new(pending.get(6..10)?, order);
    let name = r.u16().ok()? as usize;
    let data = r.u16().ok()? as usize;
    let pad = |n: usize| (n + 3) & !3;
    Some(12 + pad(name) + pad(data))
}

/// Write `out`, passing its descriptors as SCM_RIGHTS on the first chunk
async fn send(stream: &UnixStream, out: Outgoing) -> std::io::Result<()> {
    let raw: Vec<RawFd> = out.fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let mut written = 0;
    while written < out.bytes.len() {
        stream.writable().await?;
        let chunk = &out.bytes[written..];
        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(chunk)];
            let rights = [ControlMessage::ScmRights(&raw)];
            let cmsgs: &[ControlMessage] = if written == 0 && !raw.is_empty() { &rights } else { &[] };
            sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None).map_err(std::io::Error::from)
        });
        match result {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    // descriptors close here, the client holds its own copies
    drop(out.fds);
    Ok(())
}

async fn serve_client(core: Rc<RefCell<Core>>, mut stream: UnixStream) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut buf = vec![0u8; 65536];
    let mut pending = Vec::new();
    let mut session: Option<(ClientId, ByteOrder)> = None;
    let mut sequence: u16 = 0;

    let result: Result<()> = loop {
        tokio::select! {
            n = stream.read(&mut buf) => {
                let n = match n {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                };
                pending.extend_from_slice(&buf[..n]);

                let mut replies = Vec::new();
                loop {
                    let Some((client, order)) = session else {
                        let Some(order) = pending.first().copied().and_then(ByteOrder::from_setup_byte) else {
                            break;
                        };
                        let Some(needed) = setup_len(&pending, order) else { break };
                        if pending.len() < needed {
                            break;
                        }
                        pending.drain(..needed);
                        let mut core = core.borrow_mut();
                        let client = core.connect(order, tx.clone());
                        log::info!("client {} connected ({:?} endian)", client, order);
                        replies.push(Outgoing { bytes: core.setup_reply(client, order), fds: Vec::new() });
                        session = Some((client, order));
                        continue;
                    };

                    if pending.len() < 4 {
                        break;
                    }
                    let words = RequestReader::new(&pending[2..4], order).u16().unwrap_or(0) as usize;
                    if words == 0 {
                        break;
                    }
                    let needed = words * 4;
                    if pending.len() < needed {
                        break;
                    }
                    sequence = sequence.wrapping_add(1);
                    let request: Vec<u8> = pending.drain(..needed).collect();
                    let mut core = core.borrow_mut();
                    if let Some(out) = core.handle(client, order, sequence, &request) {
                        replies.push(out);
                    }
                    core.flush_events();
                }

                let mut failed = None;
                for out in replies {
                    if let Err(e) = send(&stream, out).await {
                        failed = Some(e);
                        break;
                    }
                }
                if let Some(e) = failed {
                    break Err(e.into());
                }
                if session.is_none() && !pending.is_empty() && ByteOrder::from_setup_byte(pending[0]).is_none() {
                    break Err(anyhow::anyhow!("bad byte order byte {:#x}", pending[0]));
                }
                if let Some((_, order)) = session {
                    if pending.len() >= 4 && RequestReader::new(&pending[2..4], order).u16().unwrap_or(0) == 0 {
                        break Err(anyhow::anyhow!("zero length request"));
                    }
                }
            }
            Some(out) = rx.recv() => {
                if let Err(e) = send(&stream, out).await {
                    break Err(e.into());
                }
            }
        }
    };

    if let Some((client, _)) = session {
        core.borrow_mut().disconnect(client);
        log::info!("client {} disconnected", client);
    }
    result
}

/// Serve `randr` on display `:display_num` until interrupted
pub async fn run(display_num: u32, randr: Randr) -> Result<()> {
    let socket_path = format!("{}/X{}", X11_UNIX_DIR, display_num);
    let _ = std::fs::remove_file(&socket_path);
    std::fs::create_dir_all(X11_UNIX_DIR).context("creating socket directory")?;
    let listener = UnixListener::bind(&socket_path).with_context(|| format!("binding {}", socket_path))?;
    log::info!("serving RandR on DISPLAY=:{}", display_num);

    let core = Rc::new(RefCell::new(Core::new(randr)));
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _) = accepted?;
                        let core = Rc::clone(&core);
                        tokio::task::spawn_local(async move {
                            if let Err(e) = serve_client(core, stream).await {
                                log::warn!("client error: {:#}", e);
                            }
                        });
                    }
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("shutting down");
                        break;
                    }
                }
            }
            let _ = std::fs::remove_file(&socket_path);
            anyhow::Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{build, OutputSpec};
    use x11rr_core::{ScreenChanges, ScreenId};

    fn core() -> Core {
        let outputs: Vec<OutputSpec> = vec!["HDMI-1:1920x1080".parse().unwrap()];
        Core::new(build(&outputs, &[]).unwrap())
    }

    #[test]
    fn test_setup_reply_length_matches_body() {
        let mut core = core();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = core.connect(ByteOrder::Little, tx);
        let reply = core.setup_reply(client, ByteOrder::Little);
        let words = u16::from_le_bytes([reply[6], reply[7]]) as usize;
        assert_eq!(reply[0], 1);
        assert_eq!(reply.len(), 8 + words * 4);
        // vendor follows the 32 byte fixed part
        assert_eq!(&reply[40..45], VENDOR);
        // first screen root, after 8 bytes of vendor and one format
        let root = core.rr.randr.screens()[0].root.0;
        assert_eq!(u32::from_le_bytes([reply[56], reply[57], reply[58], reply[59]]), root);
    }

    #[test]
    fn test_query_extension_finds_randr() {
        let mut core = core();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = core.connect(ByteOrder::Little, tx);
        let mut req = vec![opcodes::QUERY_EXTENSION, 0, 4, 0, 5, 0, 0, 0];
        req.extend_from_slice(b"RANDR\0\0\0");
        let out = core.handle(client, ByteOrder::Little, 1, &req).unwrap();
        assert_eq!(&out.bytes[8..12], &[1, RANDR_MAJOR_OPCODE, RANDR_EVENT_BASE, RANDR_ERROR_BASE]);
    }

    #[test]
    fn test_events_skip_closed_outboxes() {
        let mut core = core();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        let live = core.connect(ByteOrder::Little, live_tx);
        let gone = core.connect(ByteOrder::Little, gone_tx);
        drop(gone_rx);

        let root = core.rr.randr.screens()[0].root.0;
        for (client, seq) in [(live, 1), (gone, 1)] {
            let mut req = vec![RANDR_MAJOR_OPCODE, 4, 3, 0];
            req.extend_from_slice(&root.to_le_bytes());
            req.extend_from_slice(&[1, 0, 0, 0]);
            assert!(core.rr.handle_request(client, seq, &req).reply.is_none());
        }
        core.rr.randr.set_changed(ScreenId(0), ScreenChanges::empty());
        core.rr.randr.tell_changed(ScreenId(0));

        core.flush_events();
        let event = live_rx.try_recv().unwrap();
        assert_eq!(event.bytes.len(), 32);
        assert_eq!(event.bytes[0], RANDR_EVENT_BASE);
        assert!(core.rr.pending_events().is_empty());
    }

    #[test]
    fn test_setup_len_counts_auth_padding() {
        let header = [b'l', 0, 11, 0, 0, 0, 18, 0, 16, 0, 0, 0];
        assert_eq!(setup_len(&header, ByteOrder::Little), Some(12 + 20 + 16));
    }
}
