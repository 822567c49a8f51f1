//! x11rr - X11 RandR display configuration server
//!
//! Runs the RandR resource manager over a simulated display so real
//! clients (`xrandr`, window managers) can drive crtcs, outputs,
//! monitors, providers and leases.
//!
//! ```text
//! x11rr serve -d 5 -o eDP-1:1920x1080 -o HDMI-1:2560x1440
//! DISPLAY=:5 xrandr --output HDMI-1 --left-of eDP-1
//! ```

mod driver;
mod query;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use driver::OutputSpec;
use x11rr_core::{Randr, ScreenId};

#[derive(Parser)]
#[command(name = "x11rr")]
#[command(about = "X11 RandR display configuration server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a simulated display on a local X socket
    Serve {
        /// Display number to listen on (e.g., 5 for :5)
        #[arg(short, long, default_value = "5")]
        display: String,

        /// Outputs of the primary screen, NAME:WxH[@X,Y]
        #[arg(short, long = "output", required = true)]
        outputs: Vec<OutputSpec>,

        /// Outputs of a secondary GPU screen
        #[arg(short, long = "gpu-output")]
        gpu_outputs: Vec<OutputSpec>,
    },

    /// Build the simulated configuration and print it
    Dump {
        #[arg(short, long = "output", required = true)]
        outputs: Vec<OutputSpec>,

        #[arg(short, long = "gpu-output")]
        gpu_outputs: Vec<OutputSpec>,
    },

    /// Print the RandR state of a running X server
    Query {
        /// X display to query (e.g., :0)
        #[arg(short, long, default_value = ":0")]
        display: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            display,
            outputs,
            gpu_outputs,
        } => {
            let randr = driver::build(&outputs, &gpu_outputs)?;
            server::run(parse_display(&display)?, randr).await
        }
        Commands::Dump { outputs, gpu_outputs } => {
            let mut randr = driver::build(&outputs, &gpu_outputs)?;
            dump(&mut randr);
            Ok(())
        }
        Commands::Query { display } => {
            tokio::task::spawn_blocking(move || query::run_query(&display)).await?
        }
    }
}

fn parse_display(display: &str) -> Result<u32> {
    display
        .trim_start_matches(':')
        .parse()
        .context("invalid display number")
}

fn dump(randr: &mut Randr) {
    let count = randr.screens().len();
    for index in 0..count {
        let id = ScreenId(index);
        let screen = randr.screen(id);
        println!(
            "screen {}{}: {}x{} ({}x{} mm) root {:#x}",
            index,
            if screen.is_gpu { " (gpu)" } else { "" },
            screen.width,
            screen.height,
            screen.mm_width,
            screen.mm_height,
            screen.root.0
        );
        for crtc in &screen.crtcs {
            match &crtc.mode {
                Some(mode) => println!(
                    "  crtc {:#x}: {} +{}+{} {:?} {:?}",
                    crtc.id.0, mode.name, crtc.x, crtc.y, crtc.rotation, crtc.outputs
                ),
                None => println!("  crtc {:#x}: off", crtc.id.0),
            }
        }
        for output in &screen.outputs {
            let modes: Vec<&str> = output.modes.iter().map(|m| m.name.as_str()).collect();
            println!(
                "  output {:#x} {}: {:?} {}x{} mm modes {}",
                output.id.0,
                output.name,
                output.connection,
                output.mm_width,
                output.mm_height,
                modes.join(" ")
            );
        }
        if let Some(provider) = &screen.provider {
            println!("  provider {:#x} {} {:?}", provider.id.0, provider.name, provider.capabilities);
        }

        if screen.is_gpu {
            continue;
        }
        let (_, monitors) = randr.get_monitors(id, true);
        for monitor in monitors {
            let name = randr.atoms.get_name(monitor.name).unwrap_or("?").to_string();
            let b = monitor.geometry.bounds;
            println!(
                "  monitor {}{}: {}x{}+{}+{} ({}x{} mm) {:?}",
                if monitor.primary { "*" } else { "" },
                name,
                b.width(),
                b.height(),
                b.x1,
                b.y1,
                monitor.geometry.mm_width,
                monitor.geometry.mm_height,
                monitor.outputs
            );
        }
    }
}
