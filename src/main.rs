//! chunklink: direct chunk access and external-link resolution
//!
//! Usage:
//!   chunklink create      --file data.ckl --dataset frames --shape 10,4,4 --chunks 1,4,4 --zstd 9
//!   chunklink write-chunk --file data.ckl --dataset frames --offset 0,0,0 --input chunk.bin --filter-mask 0
//!   chunklink read-chunk  --file data.ckl --dataset frames --offset 0,0,0 --output chunk.bin
//!   chunklink info        --file data.ckl --dataset frames
//!   chunklink copy-chunks --src a.ckl --src-dataset frames --dst b.ckl --dst-dataset frames
//!   chunklink link        --file a.ckl --name ext --target-file b.ckl --target-path frames
//!   chunklink resolve     --file a.ckl --link ext --locking best-effort --mode r

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chunklink::config::Config;
use chunklink::error::ChunkError;
use chunklink::link_access::{LinkAccessFields, Locking};
use chunklink::storage::access::{AccessFlags, AccessMode};
use chunklink::storage::container::Container;
use chunklink::storage::dataset::Dataset;
use chunklink::storage::filters::{Filter, FilterPipeline};
use chunklink::storage::layout::DatasetSpec;

#[derive(Parser)]
#[command(name = "chunklink", about = "Direct chunk access for chunked containers", version)]
struct Cli {
    /// Optional TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct DatasetArgs {
    /// Container file.
    #[arg(short, long)]
    file: PathBuf,
    /// Dataset name inside the container.
    #[arg(short, long)]
    dataset: String,
}

#[derive(Subcommand)]
enum Command {
    /// Create a chunked dataset (and the container if it does not exist).
    Create {
        #[command(flatten)]
        target: DatasetArgs,
        /// Dataset shape, e.g. `10,4,4`.
        #[arg(long)]
        shape: Dims,
        /// Chunk shape, e.g. `1,4,4`.
        #[arg(long)]
        chunks: Dims,
        /// Element size in bytes.
        #[arg(long, default_value_t = 4)]
        element_size: u32,
        /// Add a zstd stage with this level.
        #[arg(long)]
        zstd: Option<i32>,
        /// Add a CRC-32 checksum stage.
        #[arg(long)]
        checksum: bool,
    },
    /// Store a file's bytes verbatim as one chunk.
    WriteChunk {
        #[command(flatten)]
        target: DatasetArgs,
        #[arg(long)]
        offset: Dims,
        #[arg(long)]
        input: PathBuf,
        /// Filters NOT applied to the input, decimal or `0x` hex.
        #[arg(long, default_value = "0", value_parser = parse_mask)]
        filter_mask: u32,
    },
    /// Print a chunk's filter mask and optionally save its stored bytes.
    ReadChunk {
        #[command(flatten)]
        target: DatasetArgs,
        #[arg(long)]
        offset: Dims,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List the allocated chunks of a dataset as JSON.
    Info {
        #[command(flatten)]
        target: DatasetArgs,
    },
    /// Copy every stored chunk from one dataset to another without re-encoding.
    CopyChunks {
        #[arg(long)]
        src: PathBuf,
        #[arg(long)]
        src_dataset: String,
        #[arg(long)]
        dst: PathBuf,
        #[arg(long)]
        dst_dataset: String,
    },
    /// Create an external link to a dataset in another container.
    Link {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        target_file: String,
        #[arg(long)]
        target_path: String,
    },
    /// Follow an external link and describe the dataset it reaches.
    Resolve {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long)]
        link: String,
        /// `true`, `false` or `best-effort`.
        #[arg(long)]
        locking: Option<Locking>,
        /// `r` or `r+`.
        #[arg(long)]
        mode: Option<AccessMode>,
        #[arg(long)]
        swmr: Option<bool>,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        nlinks: Option<u32>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Failed to load config");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = run(cli.command, &cfg) {
        error!("Command failed: {e:#}");
        std::process::exit(1);
    }
}

fn run(command: Command, cfg: &Config) -> Result<()> {
    match command {
        Command::Create { target, shape: Dims(shape), chunks: Dims(chunks), element_size, zstd, checksum } => {
            let mut filters = Vec::new();
            if let Some(level) = zstd {
                filters.push(Filter::Zstd { level });
            }
            if checksum {
                filters.push(Filter::Checksum);
            }
            let spec = DatasetSpec::new(&shape, &chunks, element_size)
                .with_pipeline(FilterPipeline::new(filters)?);

            let path = cfg.storage.resolve_path(&target.file);
            let container = if path.exists() {
                open_container(cfg, &path, AccessFlags::RDWR)?
            } else {
                Container::create(&path, cfg.storage.file_access())
                    .with_context(|| format!("create {path:?}"))?
            };
            container.create_dataset(&target.dataset, spec)?;
            info!(dataset = %target.dataset, shape = ?shape, chunks = ?chunks, "Dataset created");
            container.close()?;
        }
        Command::WriteChunk { target, offset: Dims(offset), input, filter_mask } => {
            let data = std::fs::read(&input).with_context(|| format!("read {input:?}"))?;
            let dataset = open_dataset(cfg, &target, AccessFlags::RDWR)?;
            dataset.write_raw_chunk(&offset, &data, filter_mask)?;
            info!(offset = ?offset, bytes = data.len(), filter_mask, "Chunk written");
            dataset.container().clone().close()?;
        }
        Command::ReadChunk { target, offset: Dims(offset), output } => {
            let dataset = open_dataset(cfg, &target, AccessFlags::RDONLY)?;
            let (filter_mask, data) = dataset.read_raw_chunk(&offset)?;
            println!(
                "{}",
                serde_json::json!({
                    "offset": offset,
                    "filter_mask": filter_mask,
                    "byte_size": data.len(),
                })
            );
            if let Some(out) = output {
                std::fs::write(&out, &data).with_context(|| format!("write {out:?}"))?;
            }
        }
        Command::Info { target } => {
            let dataset = open_dataset(cfg, &target, AccessFlags::RDONLY)?;
            let chunks = (0..dataset.num_chunks())
                .map(|i| dataset.get_chunk_info(i))
                .collect::<chunklink::error::Result<Vec<_>>>()?;
            let report = serde_json::json!({
                "dataset": dataset.name(),
                "created_at": dataset.container().created_at().to_rfc3339(),
                "shape": dataset.shape(),
                "chunk_shape": dataset.chunk_shape(),
                "chunk_grid": dataset.spec().chunk_grid(),
                "filters": dataset.spec().pipeline.filters().iter().map(Filter::id).collect::<Vec<_>>(),
                "chunks": chunks,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::CopyChunks { src, src_dataset, dst, dst_dataset } => {
            let src_path = cfg.storage.resolve_path(&src);
            let dst_path = cfg.storage.resolve_path(&dst);
            let dst_container = open_container(cfg, &dst_path, AccessFlags::RDWR)?;
            let src_container = if same_file(&src_path, &dst_path) {
                dst_container.clone()
            } else {
                open_container(cfg, &src_path, AccessFlags::RDONLY)?
            };
            let from = src_container.dataset(&src_dataset)?;
            let to = dst_container.dataset(&dst_dataset)?;
            let copied = copy_chunks(&from, &to, cfg.storage.copy_buffer_kb * 1024)?;
            info!(chunks = copied, "Chunks copied");
            dst_container.close()?;
        }
        Command::Link { file, name, target_file, target_path } => {
            let container = open_container(cfg, &cfg.storage.resolve_path(&file), AccessFlags::RDWR)?;
            container.create_external_link(&name, &target_file, &target_path)?;
            container.close()?;
        }
        Command::Resolve { file, link, locking, mode, swmr, prefix, nlinks } => {
            let container =
                open_container(cfg, &cfg.storage.resolve_path(&file), AccessFlags::RDONLY)?;
            let policy = cfg.link_access().update(LinkAccessFields {
                locking,
                mode,
                swmr_mode: swmr,
                prefix,
                nlinks,
            });
            let dataset = match policy.open_external(&container, &link) {
                Ok(d) => d,
                Err(e @ ChunkError::LinkDepthExceeded { .. }) => {
                    bail!("{e}; raise --nlinks or check for a link cycle")
                }
                Err(e) => return Err(e.into()),
            };
            println!(
                "{}",
                serde_json::json!({
                    "link": link,
                    "container": dataset.container().path(),
                    "mode": dataset.container().mode().as_str(),
                    "swmr": dataset.container().swmr_mode(),
                    "dataset": dataset.name(),
                    "shape": dataset.shape(),
                    "chunks_allocated": dataset.num_chunks(),
                })
            );
        }
    }
    Ok(())
}

/// Whether two spellings name the same file on disk.
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn open_container(cfg: &Config, path: &Path, flags: AccessFlags) -> Result<Container> {
    Container::open(path, flags, cfg.storage.file_access()).with_context(|| format!("open {path:?}"))
}

fn open_dataset(cfg: &Config, target: &DatasetArgs, flags: AccessFlags) -> Result<Dataset> {
    let container = open_container(cfg, &cfg.storage.resolve_path(&target.file), flags)?;
    Ok(container.dataset(&target.dataset)?)
}

/// Move stored chunks through one reusable buffer, growing it when a chunk
/// does not fit.
fn copy_chunks(from: &Dataset, to: &Dataset, initial_capacity: usize) -> Result<usize> {
    if from.chunk_shape() != to.chunk_shape() {
        bail!(
            "chunk shapes differ: {:?} vs {:?}",
            from.chunk_shape(),
            to.chunk_shape()
        );
    }
    if from.spec().pipeline != to.spec().pipeline {
        warn!("Filter pipelines differ, copied chunks may not decode in the destination");
    }

    let mut buffer = BytesMut::zeroed(initial_capacity);
    let count = from.num_chunks();
    for i in 0..count {
        let info = from.get_chunk_info(i)?;
        let (mask, written) = match from.read_raw_chunk_into(&info.chunk_offset, &mut buffer) {
            Ok(r) => r,
            Err(ChunkError::BufferTooSmall { needed, .. }) => {
                buffer = BytesMut::zeroed(needed);
                from.read_raw_chunk_into(&info.chunk_offset, &mut buffer)?
            }
            Err(e) => return Err(e.into()),
        };
        to.write_raw_chunk(&info.chunk_offset, &buffer[..written], mask)?;
    }
    Ok(count)
}

/// Comma-separated dimensions such as `1,4,4`.
#[derive(Debug, Clone)]
struct Dims(Vec<u64>);

impl std::str::FromStr for Dims {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.split(',')
            .map(|p| p.trim().parse::<u64>().map_err(|e| format!("{p:?}: {e}")))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Dims)
    }
}

fn parse_mask(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("{s:?}: {e}"))
}
