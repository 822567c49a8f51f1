//! Print the RandR state of a running X server, xrandr style

use anyhow::{Context, Result};
use x11rb::connection::Connection;
use x11rb::protocol::randr::{self, ConnectionExt as RandrExt};
use x11rb::protocol::xproto::ConnectionExt;
use x11rb::rust_connection::RustConnection;

fn atom_name(conn: &RustConnection, atom: u32) -> Result<String> {
    let reply = conn.get_atom_name(atom)?.reply()?;
    Ok(String::from_utf8_lossy(&reply.name).into_owned())
}

pub fn run_query(display: &str) -> Result<()> {
    let (conn, screen_num) = x11rb::connect(Some(display)).context("failed to connect to X server")?;
    let version = conn
        .randr_query_version(1, 6)?
        .reply()
        .context("RandR not available")?;
    println!("RandR {}.{}", version.major_version, version.minor_version);

    let root = conn.setup().roots[screen_num].root;
    let range = conn.randr_get_screen_size_range(root)?.reply()?;
    let resources = conn.randr_get_screen_resources_current(root)?.reply()?;
    let screen = &conn.setup().roots[screen_num];
    println!(
        "Screen {}: minimum {} x {}, current {} x {}, maximum {} x {}",
        screen_num,
        range.min_width,
        range.min_height,
        screen.width_in_pixels,
        screen.height_in_pixels,
        range.max_width,
        range.max_height
    );

    let mode_name = |id: u32| -> String {
        let mut offset = 0usize;
        for mode in &resources.modes {
            let len = mode.name_len as usize;
            if mode.id == id {
                if let Some(name) = resources.names.get(offset..offset + len) {
                    return String::from_utf8_lossy(name).into_owned();
                }
            }
            offset += len;
        }
        format!("{:#x}", id)
    };

    let primary = conn.randr_get_output_primary(root)?.reply()?.output;
    for &output in &resources.outputs {
        let info = conn
            .randr_get_output_info(output, resources.config_timestamp)?
            .reply()?;
        let name = String::from_utf8_lossy(&info.name);
        let state = match info.connection {
            randr::Connection::CONNECTED => "connected",
            randr::Connection::DISCONNECTED => "disconnected",
            _ => "unknown connection",
        };
        let mut line = format!("{} {}", name, state);
        if output == primary {
            line.push_str(" primary");
        }
        if info.crtc != x11rb::NONE {
            let crtc = conn
                .randr_get_crtc_info(info.crtc, resources.config_timestamp)?
                .reply()?;
            line.push_str(&format!(" {}x{}+{}+{}", crtc.width, crtc.height, crtc.x, crtc.y));
        }
        line.push_str(&format!(" {}mm x {}mm", info.mm_width, info.mm_height));
        println!("{}", line);

        for (i, &mode) in info.modes.iter().enumerate() {
            let preferred = if i < info.num_preferred as usize { " +" } else { "" };
            println!("   {}{}", mode_name(mode), preferred);
        }
    }

    let monitors = conn.randr_get_monitors(root, true)?.reply()?;
    println!("Monitors: {}", monitors.monitors.len());
    for (i, m) in monitors.monitors.iter().enumerate() {
        println!(
            " {}: {}{}{} {}/{}x{}/{}+{}+{}",
            i,
            if m.automatic { "+" } else { "" },
            if m.primary { "*" } else { "" },
            atom_name(&conn, m.name)?,
            m.width,
            m.width_in_millimeters,
            m.height,
            m.height_in_millimeters,
            m.x,
            m.y
        );
    }

    let providers = conn.randr_get_providers(root)?.reply()?;
    println!("Providers: number : {}", providers.providers.len());
    for (i, &provider) in providers.providers.iter().enumerate() {
        let info = conn
            .randr_get_provider_info(provider, resources.config_timestamp)?
            .reply()?;
        println!(
            "Provider {}: id: {:#x} cap: {:#x} crtcs: {} outputs: {} associated providers: {} name:{}",
            i,
            provider,
            u32::from(info.capabilities),
            info.crtcs.len(),
            info.outputs.len(),
            info.associated_providers.len(),
            String::from_utf8_lossy(&info.name)
        );
    }
    Ok(())
}
