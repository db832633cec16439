use std::env;
use std::fs;

use anyhow::{bail, Context, Result};
use log::info;

use tagheap::{trace, Heap, HeapConfig};

const USAGE: &str = "usage: tagheap [--check] <trace>...";

fn main() -> Result<()> {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let mut check = false;
    let mut paths = Vec::new();
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--check" => check = true,
            "-h" | "--help" => {
                println!("{}", USAGE);
                return Ok(());
            }
            _ => paths.push(arg),
        }
    }
    if paths.is_empty() {
        bail!(USAGE);
    }

    let config = HeapConfig::from_env();
    info!("chunk size {} bytes, arena limit {} bytes", config.chunk_size, config.max_heap);

    for path in paths {
        let src = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path))?;
        let ops = trace::parse(&src).with_context(|| format!("failed to parse {}", path))?;
        // every trace gets a fresh heap.
        let mut heap = Heap::system(config)?;
        let report = trace::replay(&mut heap, &ops, check).with_context(|| format!("failed to replay {}", path))?;
        let stats = heap.stats();
        println!(
            "{}: {} ops, peak {} bytes live, heap {} bytes after {} growths, utilization {:.1}%, {} free blocks",
            path,
            report.ops,
            report.peak_live_bytes,
            report.heap_size,
            report.growths,
            report.utilization() * 100.0,
            stats.free_blocks,
        );
    }
    Ok(())
}
