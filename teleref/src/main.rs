use clap::{Parser as ClapParser, ValueEnum};
use log::{LevelFilter, error, info};
use std::{process, sync::Arc};

use teleref::{
    Address, CollectionKind, CollectorKind, Epoch, HeapRegion, ObjectStatus,
    ProcessChannel, ReferenceScheme, RemoteRef, SimulatedTarget, TeleCreateInfo,
    TeleError,
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Collector {
    Relocating,
    GenSs,
}

impl From<Collector> for CollectorKind {
    fn from(collector: Collector) -> Self {
        match collector {
            Collector::Relocating => CollectorKind::Relocating,
            Collector::GenSs => CollectorKind::GenerationalSemiSpace,
        }
    }
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Collector the simulated target runs
    #[arg(long, value_enum, default_value = "relocating")]
    collector: Collector,

    /// Objects to allocate and take handles on
    #[arg(long, default_value_t = 64)]
    objects: usize,

    /// Collections to run
    #[arg(long, default_value_t = 8)]
    cycles: u64,

    /// Root table capacity
    #[arg(long, help = "Upper bound on root-table slots")]
    max_roots: Option<usize>,

    #[arg(long, default_value = "info", help = "error, warn, info, debug or trace")]
    log_level: LevelFilter,
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .parse_default_env()
        .init();

    if let Err(err) = run(&cli) {
        error!("{err}");
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), TeleError> {
    let target = Arc::new(SimulatedTarget::new(cli.collector.into()));
    let scheme = ReferenceScheme::attach(
        target.clone(),
        &TeleCreateInfo {
            max_roots: cli.max_roots,
            ..Default::default()
        },
    )?;

    // a full root table comes back with the session attached; end it here
    let result = run_cycles(cli, &target, &scheme);
    scheme.detach();
    result
}

fn run_cycles(
    cli: &Cli,
    target: &SimulatedTarget,
    scheme: &ReferenceScheme,
) -> Result<(), TeleError> {
    let region = match scheme.collector() {
        CollectorKind::Relocating => HeapRegion::Dynamic,
        CollectorKind::GenerationalSemiSpace => HeapRegion::Nursery,
    };
    let mut handles = Vec::with_capacity(cli.objects);
    for _ in 0..cli.objects {
        let address = target.allocate(region);
        handles.push(scheme.make_tele_reference(Some(address))?);
    }
    let pinned = target.allocate(HeapRegion::Fixed);
    handles.push(scheme.make_tele_reference(Some(pinned))?);
    info!("{}", scheme.stats());

    let mut epoch = Epoch(0);
    for cycle in 0..cli.cycles {
        match scheme.collector() {
            CollectorKind::Relocating => relocating_cycle(target, &handles, cycle),
            CollectorKind::GenerationalSemiSpace => {
                gen_ss_cycle(target, scheme, &mut handles, cycle)?
            }
        }
        target.finish_collection();
        epoch = epoch.next();
        scheme.update_cache(epoch)?;

        // let go of every handle the target no longer backs
        handles.retain(|handle| handle.status() == ObjectStatus::Live);
        println!("{}", scheme.stats());
    }
    Ok(())
}

fn live_origins(handles: &[RemoteRef]) -> Vec<(usize, Address)> {
    handles
        .iter()
        .enumerate()
        .filter(|(_, handle)| {
            matches!(handle.status(), ObjectStatus::Live | ObjectStatus::Unknown)
        })
        .filter_map(|(i, handle)| handle.origin().map(|origin| (i, origin)))
        .collect()
}

fn relocating_cycle(target: &SimulatedTarget, handles: &[RemoteRef], cycle: u64) {
    for (i, origin) in live_origins(handles) {
        if target.classify(origin) != HeapRegion::Dynamic {
            continue;
        }
        if (i as u64 + cycle) % 5 == 0 {
            target.kill(origin);
        } else if i % 2 == 0 {
            target.relocate(origin, HeapRegion::Dynamic);
        }
    }
}

fn gen_ss_cycle(
    target: &SimulatedTarget,
    scheme: &ReferenceScheme,
    handles: &mut Vec<RemoteRef>,
    cycle: u64,
) -> Result<(), TeleError> {
    // every third collection is full; the nursery is empty by then
    let kind = CollectionKind::from_minor(cycle % 3 != 2);
    if kind.is_minor() {
        for _ in 0..handles.len().min(8) {
            let address = target.allocate(HeapRegion::Nursery);
            handles.push(scheme.make_tele_reference(Some(address))?);
        }
    } else {
        target.flip_old_spaces();
    }

    scheme.analysis_begins(kind)?;
    let from_space = if kind.is_minor() {
        HeapRegion::Nursery
    } else {
        HeapRegion::OldFrom
    };
    for (i, origin) in live_origins(handles) {
        if target.classify(origin) != from_space {
            continue;
        }
        if (i as u64 + cycle) % 4 == 0 {
            target.kill(origin);
        } else {
            let copy = target.relocate(origin, HeapRegion::OldTo);
            scheme.object_relocated(origin, copy, kind)?;
        }
    }
    scheme.analysis_ends(kind)
}
