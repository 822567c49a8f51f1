//! Simulated display hardware
//!
//! Outputs are described on the command line as `NAME:WxH[@X,Y]`. The
//! driver accepts every configuration, keeps panning per crtc and hands
//! out `/dev/null` as the lease descriptor.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::str::FromStr;
use x11rr_core::{
    CrtcId, CrtcRequest, DriverError, DriverResult, GammaRamp, Hook, LeaseId, LeaseRequest, LeaseTermination,
    ModeInfo, OutputId, Panning, Pixmap, PixmapId, ProviderCapabilities, ProviderId, RandrDriver, Randr, Rotation,
    ScreenId, ScreenSize, SizeRange,
};

const GAMMA_SIZE: usize = 256;
const MIN_WIDTH: u16 = 320;
const MIN_HEIGHT: u16 = 200;
/// Largest framebuffer the simulated hardware scans out of
const MAX_SIZE: u16 = 8192;

const SIZE_RANGE: SizeRange = SizeRange {
    min_width: MIN_WIDTH,
    min_height: MIN_HEIGHT,
    max_width: MAX_SIZE,
    max_height: MAX_SIZE,
};

/// Smaller modes offered next to each output's native one
const EXTRA_MODES: &[(u16, u16)] = &[(1920, 1080), (1280, 720), (1024, 768), (800, 600)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: String,
    pub width: u16,
    pub height: u16,
    pub position: Option<(i32, i32)>,
}

impl FromStr for OutputSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, rest) = s.split_once(':').context("expected NAME:WxH[@X,Y]")?;
        if name.is_empty() {
            bail!("empty output name in {:?}", s);
        }
        let (size, position) = match rest.split_once('@') {
            Some((size, pos)) => (size, Some(pos)),
            None => (rest, None),
        };
        let (w, h) = size.split_once('x').context("size must be WxH")?;
        let width: u16 = w.parse().context("invalid width")?;
        let height: u16 = h.parse().context("invalid height")?;
        if width == 0 || height == 0 {
            bail!("zero sized output {:?}", name);
        }
        let position = match position {
            Some(pos) => {
                let (x, y) = pos.split_once(',').context("position must be X,Y")?;
                Some((x.parse().context("invalid x")?, y.parse().context("invalid y")?))
            }
            None => None,
        };
        Ok(Self {
            name: name.to_string(),
            width,
            height,
            position,
        })
    }
}

/// Millimeters at 96 dpi
fn mm(px: u16) -> u32 {
    px as u32 * 254 / 960
}

#[derive(Debug, Default)]
pub struct SimDriver {
    panning: HashMap<CrtcId, Panning>,
}

impl RandrDriver for SimDriver {
    fn supports(&self, hook: Hook) -> bool {
        matches!(hook, Hook::ScreenSetSize | Hook::CreateLease)
    }

    fn crtc_set(&mut self, req: &CrtcRequest<'_>) -> DriverResult<()> {
        match req.mode {
            Some(mode) => log::info!(
                "crtc {:#x}: {} at {},{} {:?} -> {:?}",
                req.crtc.0,
                mode.name,
                req.x,
                req.y,
                req.rotation,
                req.outputs
            ),
            None => {
                log::info!("crtc {:#x}: off", req.crtc.0);
                self.panning.remove(&req.crtc);
            }
        }
        Ok(())
    }

    fn screen_set_size(&mut self, size: &ScreenSize) -> DriverResult<()> {
        log::info!("screen size {}x{} ({}x{} mm)", size.width, size.height, size.mm_width, size.mm_height);
        Ok(())
    }

    fn crtc_set_gamma(&mut self, crtc: CrtcId, gamma: &GammaRamp) -> DriverResult<()> {
        log::debug!("crtc {:#x}: gamma ramp of {}", crtc.0, gamma.size());
        Ok(())
    }

    fn crtc_get_gamma(&mut self, _crtc: CrtcId) -> DriverResult<Option<GammaRamp>> {
        Ok(None)
    }

    fn get_panning(&self, crtc: CrtcId) -> DriverResult<Panning> {
        Ok(self.panning.get(&crtc).copied().unwrap_or_default())
    }

    fn set_panning(&mut self, crtc: CrtcId, panning: &Panning) -> DriverResult<()> {
        if panning.total.is_empty() {
            self.panning.remove(&crtc);
        } else {
            self.panning.insert(crtc, *panning);
        }
        Ok(())
    }

    fn provider_set_output_source(&mut self, provider: ProviderId, source: Option<ProviderId>) -> DriverResult<()> {
        log::info!("provider {:#x}: output source {:?}", provider.0, source);
        Ok(())
    }

    fn provider_set_offload_sink(&mut self, provider: ProviderId, sink: Option<ProviderId>) -> DriverResult<()> {
        log::info!("provider {:#x}: offload sink {:?}", provider.0, sink);
        Ok(())
    }

    fn provider_destroy(&mut self, _provider: ProviderId) -> DriverResult<()> {
        Ok(())
    }

    fn create_lease(&mut self, req: &LeaseRequest<'_>) -> DriverResult<OwnedFd> {
        let file = File::open("/dev/null").map_err(|e| DriverError::Failed(e.to_string()))?;
        log::info!(
            "lease {:#x}: crtcs {:?} outputs {:?}",
            req.lease.0,
            req.crtcs,
            req.outputs
        );
        Ok(OwnedFd::from(file))
    }

    fn terminate_lease(&mut self, lease: LeaseId) -> DriverResult<LeaseTermination> {
        log::info!("lease {:#x}: returned", lease.0);
        Ok(LeaseTermination::Immediate)
    }

    fn crtc_set_scanout_pixmap(&mut self, _crtc: CrtcId, _pixmap: Option<&Pixmap>) -> DriverResult<()> {
        Ok(())
    }

    fn start_pixmap_tracking(&mut self, target: &Pixmap, x: i32, y: i32, _rotation: Rotation) -> DriverResult<()> {
        log::debug!("tracking {:#x} at {},{}", target.id.0, x, y);
        Ok(())
    }

    fn stop_pixmap_tracking(&mut self, _target: PixmapId) -> DriverResult<()> {
        Ok(())
    }
}

/// Positions for `specs`: explicit ones as given, the rest left to right
fn place(specs: &[OutputSpec]) -> Vec<(i32, i32)> {
    let mut next_x = specs
        .iter()
        .filter_map(|s| s.position.map(|(x, _)| x + s.width as i32))
        .max()
        .unwrap_or(0);
    specs
        .iter()
        .map(|s| match s.position {
            Some(pos) => pos,
            None => {
                let pos = (next_x, 0);
                next_x += s.width as i32;
                pos
            }
        })
        .collect()
}

fn screen_size(specs: &[OutputSpec], positions: &[(i32, i32)]) -> ScreenSize {
    let width = specs
        .iter()
        .zip(positions)
        .map(|(s, &(x, _))| x + s.width as i32)
        .max()
        .unwrap_or(0)
        .clamp(MIN_WIDTH as i32, MAX_SIZE as i32) as u16;
    let height = specs
        .iter()
        .zip(positions)
        .map(|(s, &(_, y))| y + s.height as i32)
        .max()
        .unwrap_or(0)
        .clamp(MIN_HEIGHT as i32, MAX_SIZE as i32) as u16;
    ScreenSize {
        width,
        height,
        mm_width: mm(width),
        mm_height: mm(height),
    }
}

/// One crtc and one connected output per spec, every output able to use
/// every crtc of its screen
fn populate(randr: &mut Randr, screen: ScreenId, specs: &[OutputSpec]) -> Result<Vec<(CrtcId, OutputId)>> {
    let mut crtcs = Vec::new();
    for _ in specs {
        let crtc = randr.create_crtc(screen)?;
        randr.set_crtc_rotations(crtc, Rotation::ANGLES | Rotation::REFLECT_X | Rotation::REFLECT_Y)?;
        randr.set_crtc_transform_support(crtc, true)?;
        randr.gamma_set_size(crtc, GAMMA_SIZE)?;
        crtcs.push(crtc);
    }

    let mut pairs = Vec::new();
    for (spec, &crtc) in specs.iter().zip(&crtcs) {
        if randr.screens().iter().any(|s| s.outputs.iter().any(|o| o.name == spec.name)) {
            bail!("duplicate output name {:?}", spec.name);
        }
        let output = randr.create_output(screen, &spec.name)?;
        randr.set_output_crtcs(output, &crtcs)?;
        randr.set_output_connection(output, x11rr_core::Connection::Connected)?;
        randr.set_output_physical_size(output, mm(spec.width), mm(spec.height))?;

        let mut modes = Vec::new();
        let native = [(spec.width, spec.height)];
        let smaller = EXTRA_MODES
            .iter()
            .copied()
            .filter(|&(w, h)| w <= spec.width && h <= spec.height && (w, h) != (spec.width, spec.height));
        for (w, h) in native.into_iter().chain(smaller) {
            let name = format!("{}x{}", w, h);
            modes.push(randr.modes.get(&mut randr.resources, &name, ModeInfo::simple(w, h))?);
        }
        randr.set_output_modes(output, modes, 1)?;
        pairs.push((crtc, output));
    }
    Ok(pairs)
}

fn light(randr: &mut Randr, pairs: &[(CrtcId, OutputId)], positions: &[(i32, i32)]) -> Result<()> {
    for (&(crtc, output), &(x, y)) in pairs.iter().zip(positions) {
        let mode = randr.output(output)?.modes.first().cloned();
        if !randr.crtc_set(crtc, mode, x, y, Rotation::ROTATE_0, &[output])? {
            bail!("crtc {:#x} refused its initial mode", crtc.0);
        }
    }
    Ok(())
}

/// Build the state for a primary screen with `outputs`, and optionally a
/// GPU screen with `gpu_outputs` slaved to it as an output source
pub fn build(outputs: &[OutputSpec], gpu_outputs: &[OutputSpec]) -> Result<Randr> {
    if outputs.is_empty() {
        bail!("at least one output is required");
    }
    let mut randr = Randr::new();

    let positions = place(outputs);
    let size = screen_size(outputs, &positions);
    let primary = randr.add_screen(size, false, Box::new(SimDriver::default()))?;
    randr.set_screen_size_range(primary, SIZE_RANGE)?;
    randr.create_provider(
        primary,
        "sim",
        ProviderCapabilities::SOURCE_OUTPUT | ProviderCapabilities::SINK_OFFLOAD,
    )?;
    let pairs = populate(&mut randr, primary, outputs)?;
    light(&mut randr, &pairs, &positions)?;

    if !gpu_outputs.is_empty() {
        let gpu_positions = place(gpu_outputs);
        let gpu_size = screen_size(gpu_outputs, &gpu_positions);
        let gpu = randr.add_screen(gpu_size, true, Box::new(SimDriver::default()))?;
        randr.set_screen_size_range(gpu, SIZE_RANGE)?;
        randr.attach_gpu_screen(gpu, primary)?;
        randr.create_provider(
            gpu,
            "sim-gpu",
            ProviderCapabilities::SINK_OUTPUT | ProviderCapabilities::SOURCE_OFFLOAD,
        )?;
        populate(&mut randr, gpu, gpu_outputs)?;
        if randr.auto_config_gpu_screen(gpu, primary)? {
            log::info!("gpu screen {} attached as output sink", gpu.0);
        }
    }

    randr.take_events();
    Ok(randr)
}
