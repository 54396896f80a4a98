use std::{
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use clap::{Parser, Subcommand};

use pmheap::{FileRegion, Heap, HeapSettings, StartupError};

/// Address new region files are mapped at unless `--addr` says otherwise.
const DEFAULT_MAP_ADDR: usize = 0x6000_0000_0000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Helper threads used while marking
    #[arg(long, global = true, default_value_t = 0)]
    markers: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a region file and format a fresh heap in it
    Init {
        file: PathBuf,
        /// Region size in bytes
        #[arg(long, default_value_t = 64 << 20)]
        size: usize,
        /// Virtual address the region is mapped at
        #[arg(long, value_parser = parse_addr, default_value_t = DEFAULT_MAP_ADDR)]
        addr: usize,
    },
    /// Undo interrupted work, collect and close the heap cleanly
    Recover { file: PathBuf },
    /// Print heap occupancy
    Stats { file: PathBuf },
}

fn parse_addr(text: &str) -> Result<usize, String> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("bad address '{text}': {err}"))
}

fn open(file: &Path) -> Arc<FileRegion> {
    match FileRegion::open(file) {
        Ok(region) => Arc::new(region),
        Err(err) => {
            eprintln!("Error opening region '{}': {}", file.display(), err);
            process::exit(1);
        }
    }
}

fn finish(heap: Heap, region: &FileRegion) {
    heap.close();
    drop(heap);
    if let Err(err) = region.sync() {
        eprintln!("Error syncing region: {err}");
        process::exit(1);
    }
}

fn fail(err: StartupError) -> ! {
    eprintln!("Error: {err}");
    process::exit(1);
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let settings = HeapSettings {
        parallel_markers: cli.markers,
        ..Default::default()
    };

    match cli.command {
        Command::Init { file, size, addr } => {
            let region = match FileRegion::create(&file, size, addr) {
                Ok(region) => Arc::new(region),
                Err(err) => {
                    eprintln!(
                        "Error creating region '{}': {}",
                        file.display(),
                        err
                    );
                    process::exit(1);
                }
            };
            let heap = Heap::start(region.clone(), settings)
                .unwrap_or_else(|err| fail(err));
            println!("heap base {:#x}", heap.base());
            finish(heap, &region);
        }
        Command::Recover { file } => {
            let region = open(&file);
            // SAFETY: the region is mapped at its recorded address and the
            // heap was started as its first extent
            let heap = unsafe {
                Heap::start_offline(region.heap_base(), region.clone(), settings)
            }
            .unwrap_or_else(|err| fail(err));
            if !heap.collect_offline() {
                eprintln!("Error: offline collection did not run");
                process::exit(1);
            }
            let stats = heap.stats();
            println!(
                "recovered: {} allocated blocks, {} free bytes",
                stats.allocated_blocks, stats.free_bytes
            );
            finish(heap, &region);
        }
        Command::Stats { file } => {
            let region = open(&file);
            // SAFETY: as above
            let heap = unsafe {
                Heap::restart(region.heap_base(), region.clone(), settings)
            }
            .unwrap_or_else(|err| fail(err));
            let stats = heap.stats();
            println!("heap bytes       {}", stats.heap_bytes);
            println!("sections         {}", stats.sections);
            println!("free bytes       {}", stats.free_bytes);
            println!("allocated blocks {}", stats.allocated_blocks);
            println!("header records   {}", stats.header_records);
            println!("object kinds     {}", stats.kinds);
            println!("region used      {} of {}", region.used(), region.len());
            finish(heap, &region);
        }
    }
}
