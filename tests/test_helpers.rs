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
#![allow(dead_code)]

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use qubesd::AppRef;
use qubesd::app::{self, App};
use qubesd::commons::VmClass;
use qubesd::hypervisor::{HostInfo, OfflineHypervisor};
use qubesd::qdb::InMemoryBus;
use qubesd::storage::MemoryPool;
use qubesd::store;

pub const HOST_CPUS: u32 = 4;
pub const HOST_MEMORY: u64 = 16 * 1024 * 1024 * 1024;

pub struct TestEnv {
    pub app: AppRef,
    pub hv: Rc<OfflineHypervisor>,
    pub bus: Rc<InMemoryBus>,
    // dropping the tempdir deletes the store
    pub dir: tempfile::TempDir,
}

/// Build a minimal daemon model around fake adapters, with a saved store.
pub fn test_env() -> TestEnv {
    init_logging();
    let dir = tempfile::tempdir().expect("cannot create a temporary directory");
    let hv = Rc::new(OfflineHypervisor::new(HOST_CPUS, HOST_MEMORY));
    let bus = Rc::new(InMemoryBus::new());
    let host = HostInfo {
        cpus: HOST_CPUS,
        memory_total: HOST_MEMORY,
    };

    let mut app = App::new(dir.path().join("qubes.xml"), hv.clone(), bus.clone(), host);
    app.add_pool(Rc::new(MemoryPool::new("varlibqubes")));
    store::save(&mut app).expect("cannot create the store");

    TestEnv {
        app: Rc::new(RefCell::new(app)),
        hv,
        bus,
        dir,
    }
}

/// Create a template qube; most template-based qubes in tests hang off one.
pub fn add_template(env: &TestEnv, name: &str) -> u32 {
    let mut app = env.app.borrow_mut();
    app::add_new_vm(&mut app, VmClass::TemplateVM, name, "black", None)
        .expect("cannot create template")
}

pub fn add_appvm(env: &TestEnv, name: &str, template: &str) -> u32 {
    let mut app = env.app.borrow_mut();
    app::add_new_vm(&mut app, VmClass::AppVM, name, "red", Some(template))
        .expect("cannot create qube")
}

pub fn add_netvm(env: &TestEnv, name: &str) -> u32 {
    let mut app = env.app.borrow_mut();
    app::add_new_vm(&mut app, VmClass::NetVM, name, "green", None)
        .expect("cannot create network provider")
}

/// Provision a qube's volumes in its pools, like the creation API does.
pub async fn provision(env: &TestEnv, qid: u32) {
    qubesd::vm::lifecycle::create_volumes_on_disk(&env.app, qid)
        .await
        .expect("cannot provision volumes");
}

/// Run a future on a single-threaded loop, the way the daemon itself runs.
pub fn run_local<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("cannot build the test event loop");
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, future)
}

fn init_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = fern::Dispatch::new()
            .level(log::LevelFilter::Debug)
            .chain(std::io::stderr())
            .apply();
    });
}
