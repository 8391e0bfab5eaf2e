#[macro_use]
extern crate log;

mod host;
mod logging;
mod ram;
#[cfg(test)]
mod tests;
mod workload;

use clap::{App, Arg};
use easy_vm::{BlockDevice, File, Vm, BLOCK_SZ, SECTORS_PER_PAGE};
use host::{BlockFile, HostFile};
use ram::RamDisk;
use std::fs::OpenOptions;
use std::io::{Error, ErrorKind};
use std::sync::{Arc, Mutex};
use workload::Workload;

fn main() -> std::io::Result<()> {
    logging::init();
    simulate()
}

fn parse<T: std::str::FromStr>(value: Option<&str>, name: &str) -> std::io::Result<T> {
    value
        .unwrap_or_default()
        .parse()
        .map_err(|_| Error::new(ErrorKind::InvalidInput, format!("bad value for --{}", name)))
}

fn simulate() -> std::io::Result<()> {
    let matches = App::new("EasyVM simulator")
        .arg(
            Arg::with_name("frames")
                .short("f")
                .long("frames")
                .takes_value(true)
                .default_value("32")
                .help("Number of frames in the user pool"),
        )
        .arg(
            Arg::with_name("swap-pages")
                .short("s")
                .long("swap-pages")
                .takes_value(true)
                .default_value("1024")
                .help("Number of pages the swap area can hold"),
        )
        .arg(
            Arg::with_name("swap-image")
                .short("i")
                .long("swap-image")
                .takes_value(true)
                .help("Host file used as swap disk (kept in memory if absent)"),
        )
        .arg(
            Arg::with_name("map")
                .short("m")
                .long("map")
                .takes_value(true)
                .help("Host file mapped read-only into every process"),
        )
        .arg(
            Arg::with_name("processes")
                .short("p")
                .long("processes")
                .takes_value(true)
                .default_value("4")
                .help("Number of processes running at the same time"),
        )
        .arg(
            Arg::with_name("rounds")
                .short("r")
                .long("rounds")
                .takes_value(true)
                .default_value("1000")
                .help("Memory operations per process"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .default_value("0")
                .help("Seed of the random workload"),
        )
        .get_matches();
    let frames: usize = parse(matches.value_of("frames"), "frames")?;
    let swap_blocks = parse::<usize>(matches.value_of("swap-pages"), "swap-pages")? * SECTORS_PER_PAGE;
    let workload = Workload {
        processes: parse(matches.value_of("processes"), "processes")?,
        rounds: parse(matches.value_of("rounds"), "rounds")?,
        seed: parse(matches.value_of("seed"), "seed")?,
    };
    let swap_device: Arc<dyn BlockDevice> = match matches.value_of("swap-image") {
        Some(path) => {
            let image = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?;
            image.set_len((swap_blocks * BLOCK_SZ) as u64)?;
            Arc::new(BlockFile(Mutex::new(image)))
        }
        None => RamDisk::new(swap_blocks),
    };
    let source: Option<Arc<dyn File>> = match matches.value_of("map") {
        Some(path) => Some(HostFile::open(path)?),
        None => None,
    };
    let vm = Vm::new(frames, swap_device, swap_blocks);
    let report = workload::run(&vm, source, &workload).map_err(|e| Error::new(ErrorKind::Other, e))?;
    println!(
        "{} processes: {} reads, {} writes, {} forks, {} evictions",
        workload.processes,
        report.reads,
        report.writes,
        report.forks,
        vm.evictions()
    );
    Ok(())
}
