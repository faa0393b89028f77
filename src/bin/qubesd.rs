// Copyright (C) 2023-2025 Qubesd Core Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The daemon entry point: load the store, serve the three API sockets,
//! run the memory balancer, shut down cleanly on SIGINT/SIGTERM.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use log::{info, warn};
use tokio::net::UnixListener;

use qubesd::app::App;
use qubesd::commons;
use qubesd::hypervisor::{Hypervisor, OfflineHypervisor, Reconnecting};
use qubesd::qdb::InMemoryBus;
use qubesd::qmemman::Balancer;
use qubesd::storage::MemoryPool;
use qubesd::{AppRef, api, store};

#[derive(Parser, Debug)]
#[command(name = "qubesd", about = "Compartmentalization OS management daemon")]
struct Args {
    /// Verbose error logging; also sends tracebacks to Admin API clients
    #[arg(long)]
    debug: bool,

    /// Path to the persistent store
    #[arg(long, default_value = commons::DEFAULT_STORE_PATH)]
    store: PathBuf,

    /// Directory the API sockets are created in
    #[arg(long, default_value = "/var/run")]
    socket_dir: PathBuf,

    /// Create an empty store when none exists instead of failing
    #[arg(long)]
    create_store: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("cannot build the event loop");
    let local = tokio::task::LocalSet::new();
    if let Err(error) = local.block_on(&runtime, run(args)) {
        eprintln!("qubesd: {error}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> qubesd::error::Result<()> {
    // the hypervisor binding is injected by the packaging; the built-in
    // offline implementation keeps the daemon functional without one
    let hypervisor = Rc::new(Reconnecting::new(OfflineHypervisor::new(
        num_cpus(),
        host_memory(),
    )));
    let host = hypervisor
        .host_info()
        .await
        .map_err(qubesd::error::QubesError::external)?;
    let bus = Rc::new(InMemoryBus::new());

    let mut app = App::new(args.store.clone(), hypervisor.clone(), bus.clone(), host);
    app.debug = args.debug;
    app.add_pool(Rc::new(MemoryPool::new("varlibqubes")));

    if args.store.exists() {
        store::load(&mut app)?;
    } else if args.create_store {
        store::save(&mut app)?;
        info!("created empty store at {}", args.store.display());
    } else {
        return Err(qubesd::error::QubesError::Qubes(format!(
            "store {} is missing; run with --create-store",
            args.store.display()
        )));
    }

    let balancer = Balancer::new(hypervisor.clone(), bus.clone());
    app.memman = Some(balancer.clone());

    let app: AppRef = Rc::new(RefCell::new(app));

    let mut sockets = Vec::new();
    for (flavor, filename) in [
        (api::ApiFlavor::Admin, "qubesd.sock"),
        (api::ApiFlavor::Internal, "qubesd.internal.sock"),
        (api::ApiFlavor::Misc, "qubesd.misc.sock"),
    ] {
        let path = args.socket_dir.join(filename);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path)?;
        info!("listening on {}", path.display());
        sockets.push(path);
        tokio::task::spawn_local(api::serve(app.clone(), flavor, listener));
    }

    tokio::task::spawn_local(balancer.run());
    tokio::task::spawn_local(qubesd::vm::lifecycle::monitor_domain_events(app.clone()));

    wait_for_shutdown().await;
    info!("shutting down");
    for path in sockets {
        if let Err(error) = std::fs::remove_file(&path) {
            warn!("socket {} got unlinked sometime before shutdown: {error}", path.display());
        }
    }
    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("cannot install the SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn host_memory() -> u64 {
    // physinfo without a hypervisor: fall back to /proc
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|text| {
            text.lines()
                .find(|line| line.starts_with("MemTotal:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kib| kib.parse::<u64>().ok())
        })
        .map(|kib| kib * 1024)
        .unwrap_or(4 * 1024 * 1024 * 1024)
}
