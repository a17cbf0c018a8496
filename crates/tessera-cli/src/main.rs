//! tessera - inspect and drive a canvas database from the shell.
//!
//! Usage:
//!   tessera --db canvas.db info
//!   tessera place 200 300 255 0 0 --anon 10.0.0.7
//!   tessera tile 1 2 --checksum <hex>
//!   tessera since 0 --known 1,2=<hex>
//!   tessera export --format csv --out canvas.csv
//!
//! Output is JSON on stdout, logs go to stderr (`RUST_LOG` to tune).

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tessera_kernel::{
    Canvas, CanvasConfig, CanvasError, ExportFormat, PlaceRequest, Region, TileChecksum,
    known_checksums,
};
use tessera_types::{Identity, TileCoord};

/// Tiled canvas store, sync, and placement tool.
#[derive(Parser, Debug)]
#[command(name = "tessera", version)]
struct Cli {
    /// Canvas database file
    #[arg(long, global = true, default_value = "tessera.db")]
    db: PathBuf,

    /// Canvas geometry and limits (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Board geometry
    Info,
    /// Place one cell
    Place {
        x: i64,
        y: i64,
        r: i64,
        g: i64,
        b: i64,
        /// Tile checksum last seen; the placement fails if the tile moved on
        #[arg(long)]
        checksum: Option<String>,
        /// Skip the cooldown and checksum gates
        #[arg(long, conflicts_with = "checksum")]
        raw: bool,
        #[command(flatten)]
        writer: WriterArgs,
    },
    /// Fetch a tile, or report it unchanged
    Tile {
        tx: u32,
        ty: u32,
        #[arg(long)]
        checksum: Option<String>,
    },
    /// Every change after a cursor
    Since {
        cursor: i64,
        /// Tiles the caller mirrors, as `tx,ty=checksum`
        #[arg(long = "known", value_parser = parse_known)]
        known: Vec<(String, String)>,
    },
    /// Which `tx,ty=checksum` entries are out of date
    Verify {
        #[arg(value_parser = parse_known, required = true)]
        tiles: Vec<(String, String)>,
    },
    /// Placement counters for one writer
    Stats {
        #[command(flatten)]
        writer: WriterArgs,
    },
    /// Writer with the most placements
    Top,
    /// Dump a region of the canvas
    Export {
        #[arg(long, default_value = "json", value_parser = parse_format)]
        format: ExportFormat,
        #[arg(long)]
        x: Option<i64>,
        #[arg(long)]
        y: Option<i64>,
        #[arg(long)]
        width: Option<i64>,
        #[arg(long)]
        height: Option<i64>,
        /// Write here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct WriterArgs {
    /// Anonymous writer, by network address
    #[arg(long)]
    anon: Option<String>,
    /// Authenticated writer, by account id
    #[arg(long)]
    account: Option<i64>,
}

impl WriterArgs {
    fn identity(&self) -> Result<Identity> {
        match (&self.anon, self.account) {
            (Some(addr), None) if !addr.is_empty() => Ok(Identity::anonymous(addr.as_str())),
            (None, Some(id)) => Ok(Identity::account(id)),
            _ => bail!("give exactly one of --anon or --account"),
        }
    }
}

fn parse_known(s: &str) -> Result<(String, String), String> {
    let (tile, sum) = s
        .split_once('=')
        .ok_or_else(|| format!("expected tx,ty=checksum, got '{s}'"))?;
    if TileCoord::from_key(tile).is_none() {
        return Err(format!("bad tile '{tile}'"));
    }
    Ok((tile.to_string(), sum.to_string()))
}

fn parse_format(s: &str) -> Result<ExportFormat, String> {
    ExportFormat::from_str(s).ok_or_else(|| format!("unknown export format '{s}'"))
}

/// Failure body printed for rejected canvas operations.
#[derive(Serialize)]
struct Rejection {
    success: bool,
    reason: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<TileChecksum>,
}

impl From<&CanvasError> for Rejection {
    fn from(err: &CanvasError) -> Self {
        let checksum = match err {
            CanvasError::Conflict { current, .. } => Some(current.clone()),
            _ => None,
        };
        Self {
            success: false,
            reason: err.reason().to_string(),
            message: err.to_string(),
            wait_ms: err.wait().map(|w| w.as_millis() as u64),
            checksum,
        }
    }
}

fn write_json(out: &mut impl Write, value: &impl Serialize) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<CanvasConfig> {
    match &cli.config {
        Some(path) => Ok(CanvasConfig::load(path)?),
        None => Ok(CanvasConfig::default()),
    }
}

/// Run one command. `Ok(false)` means the canvas rejected the request and a
/// rejection body was written.
fn run(cli: &Cli, out: &mut impl Write) -> Result<bool> {
    let config = load_config(cli)?;
    let canvas = Canvas::open(&cli.db, config)
        .with_context(|| format!("opening {}", cli.db.display()))?;

    let result = match &cli.command {
        Command::Info => Ok(write_json(out, &canvas.info())),
        Command::Place {
            x,
            y,
            r,
            g,
            b,
            checksum,
            raw,
            writer,
        } => {
            let mut req = PlaceRequest::new(*x, *y, *r, *g, *b);
            if let Some(sum) = checksum {
                req = req.with_checksum(sum.as_str());
            }
            let who = writer.identity()?;
            if *raw {
                canvas
                    .place_pixel_raw(&req, &who)
                    .map(|placed| write_json(out, &placed))
            } else {
                canvas
                    .place_pixel(&req, &who)
                    .map(|placed| write_json(out, &placed))
            }
        }
        Command::Tile { tx, ty, checksum } => {
            let known = checksum.as_deref().map(TileChecksum::from);
            canvas
                .sync_tile(TileCoord::new(*tx, *ty), known.as_ref())
                .map(|sync| write_json(out, &sync))
        }
        Command::Since { cursor, known } => canvas
            .sync_since_with(*cursor, &known_checksums(known.iter().cloned()))
            .map(|resp| write_json(out, &resp)),
        Command::Verify { tiles } => canvas
            .verify_tiles(&known_checksums(tiles.iter().cloned()))
            .map(|v| write_json(out, &v)),
        Command::Stats { writer } => {
            let who = writer.identity()?;
            canvas.get_stats(&who).map(|stats| write_json(out, &stats))
        }
        Command::Top => canvas
            .top_contributor()
            .map(|top| write_json(out, &top)),
        Command::Export {
            format,
            x,
            y,
            width,
            height,
            out: path,
        } => {
            let config = canvas.config();
            let region = Region::clamp(
                config,
                x.unwrap_or(0),
                y.unwrap_or(0),
                width.unwrap_or(i64::from(config.width)),
                height.unwrap_or(i64::from(config.height)),
            );
            canvas.export_region(region, *format).map(|export| -> Result<()> {
                let bytes = export.to_bytes()?;
                match path {
                    Some(path) => {
                        std::fs::write(path, &bytes)
                            .with_context(|| format!("writing {}", path.display()))?;
                        tracing::info!(
                            path = %path.display(),
                            cells = export.cell_count,
                            format = %format,
                            "exported region"
                        );
                        Ok(())
                    }
                    None => Ok(out.write_all(&bytes)?),
                }
            })
        }
    };

    match result {
        Ok(written) => {
            written?;
            Ok(true)
        }
        Err(CanvasError::Storage(e)) => Err(e).context("canvas storage failed"),
        Err(err) => {
            write_json(out, &Rejection::from(&err))?;
            Ok(false)
        }
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();
    match run(&cli, &mut stdout) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
