use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use rust_photo_grid::compositor::GridCompositor;
use rust_photo_grid::config::{Configuration, YamlConfigSource};
use rust_photo_grid::processing::layout::CanvasSize;
use rust_photo_grid::tasks::{session, viewer};
use rust_photo_grid::text::TextPainter;

#[derive(Debug, Parser)]
#[command(
    name = "photo-grid",
    version,
    about = "Rotating grid of photos from a folder"
)]
struct Args {
    /// Path to YAML config; re-read before every batch
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// Render offscreen and write each frame to this PNG instead of opening a window
    #[arg(long = "frame-out", value_name = "PNG")]
    frame_out: Option<PathBuf>,
    /// Offscreen canvas size, e.g. 1280x800
    #[arg(long = "canvas", value_name = "WxH", default_value = "1280x800", value_parser = parse_canvas)]
    canvas: CanvasSize,
    /// Stop after writing this many offscreen frames
    #[arg(long = "max-frames", value_name = "N", requires = "frame_out")]
    max_frames: Option<usize>,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn parse_canvas(raw: &str) -> Result<CanvasSize> {
    let (w, h) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("expected WIDTHxHEIGHT, got `{raw}`"))?;
    let width = w.trim().parse().context("invalid canvas width")?;
    let height = h.trim().parse().context("invalid canvas height")?;
    if width == 0 || height == 0 {
        return Err(anyhow!("canvas dimensions must be positive"));
    }
    Ok(CanvasSize::new(width, height))
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        config,
        frame_out,
        canvas,
        max_frames,
        verbose,
    } = Args::parse();
    init_tracing(verbose);

    let cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;
    tracing::info!(
        "Loaded configuration from {}:\n{:#?}",
        config.display(),
        cfg
    );

    let cancel = CancellationToken::new();

    // Ctrl-D/Ctrl-C stop the session
    if io::stdin().is_terminal() {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut sink = Vec::new();
            match io::stdin().read_to_end(&mut sink) {
                Ok(_) => tracing::info!("stdin closed; initiating shutdown"),
                Err(err) => tracing::warn!("stdin watcher failed: {err}"),
            }
            cancel.cancel();
        });
    } else {
        tracing::debug!("stdin is not a terminal; skipping shutdown watcher");
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let font_family = cfg.appearance.font.clone();
    let text = tokio::task::spawn_blocking(move || TextPainter::system(font_family.as_deref()))
        .await
        .context("font discovery task failed")?;
    let compositor = GridCompositor::new(text);
    let source = Arc::new(YamlConfigSource::new(config));
    let (handle, session_task) = session::spawn(source, compositor, cancel.clone());

    match frame_out {
        Some(path) => {
            tracing::info!(path = %path.display(), ?canvas, "rendering offscreen");
            handle.on_surface_ready(Box::new(viewer::PngSurface::new(
                canvas,
                path,
                max_frames,
                cancel.clone(),
            )));
            cancel.cancelled().await;
            handle.on_surface_gone();
        }
        None => {
            // Blocks this thread until the window closes or cancellation occurs
            if let Err(e) = viewer::run_windowed(handle.clone(), cancel.clone(), "Photo Grid")
                .context("viewer failed")
            {
                tracing::error!("{e:?}");
            }
        }
    }
    cancel.cancel();

    if let Err(err) = session_task.await {
        tracing::error!("session task failed: {err}");
    }
    Ok(())
}
