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

//! Qube lifecycle: start, shutdown, kill, pause, resume, netvm switching,
//! clone and rename.
//!
//! Every function takes the shared [`AppRef`] and borrows it only between
//! suspension points. At most one lifecycle operation runs per qube at a
//! time; concurrent requests serialize through the qube's `op_lock`.

use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};

use crate::AppRef;
use crate::app::App;
use crate::commons::{self, PowerState, VmClass};
use crate::error::{QubesError, Result};
use crate::events::{self, Emitter, EventArgs};
use crate::features;
use crate::hypervisor::{DomainConfig, DomainState};
use crate::property::{self, PropertyValue};

fn vm_name(app: &App, qid: u32) -> Result<String> {
    app.domains
        .get(qid)
        .map(|vm| vm.name.clone())
        .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))
}

fn op_lock(app: &App, qid: u32) -> Result<Rc<tokio::sync::Mutex<()>>> {
    app.domains
        .get(qid)
        .map(|vm| Rc::clone(&vm.op_lock))
        .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))
}

/// Derive the power state from the hypervisor and refresh the cached copy.
pub async fn get_power_state(app: &AppRef, qid: u32) -> Result<PowerState> {
    let (name, class, qrexec_running) = {
        let app = app.borrow();
        let vm = app
            .domains
            .get(qid)
            .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
        (vm.name.clone(), vm.class, vm.qrexec_running)
    };
    if class == VmClass::AdminVM {
        return Ok(PowerState::Running);
    }

    let hypervisor = app.borrow().hypervisor.clone();
    let state = match hypervisor.domain_state(&name).await {
        Ok(state) => state,
        Err(error) => {
            warn!("cannot read state of {name}: {error}");
            DomainState::Undefined
        }
    };
    let state = match state {
        // a qube that was never started has no defined domain; that is the
        // ordinary halted state, not an error
        DomainState::Undefined | DomainState::Halted => PowerState::Halted,
        DomainState::Running => {
            if qrexec_running {
                PowerState::Running
            } else {
                PowerState::Transient
            }
        }
        DomainState::Paused => PowerState::Paused,
        DomainState::Suspended => PowerState::Suspended,
        DomainState::ShuttingDown => PowerState::Halting,
        DomainState::Crashed => PowerState::Crashed,
        DomainState::Dying => PowerState::Dying,
    };

    let mut app = app.borrow_mut();
    if let Some(vm) = app.domains.get_mut(qid) {
        vm.power_state = state;
        if state == PowerState::Halted {
            vm.xid = -1;
            vm.qrexec_running = false;
        }
    }
    Ok(state)
}

fn render_domain_config(app: &App, qid: u32) -> Result<DomainConfig> {
    let vm = app
        .domains
        .get(qid)
        .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
    let holder = Emitter::Vm(qid);
    let get_int = |name: &str, fallback: u64| {
        property::get(app, holder, name)
            .ok()
            .flatten()
            .and_then(|v| v.as_int())
            .unwrap_or(fallback)
    };
    let memory = get_int("memory", commons::DEFAULT_MEMORY_KIB);
    Ok(DomainConfig {
        name: vm.name.clone(),
        virt_mode: property::get(app, holder, "virt_mode")?
            .and_then(|v| v.as_str().map(str::to_owned))
            .map(|m| commons::VirtMode::parse(&m))
            .transpose()?
            .unwrap_or_default(),
        memory: memory * 1024,
        maxmem: get_int("maxmem", memory * 4) * 1024,
        vcpus: get_int("vcpus", 2) as u32,
        kernel: property::get(app, holder, "kernel")?
            .and_then(|v| v.as_str().map(str::to_owned)),
        kernelopts: property::get(app, holder, "kernelopts")?
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| commons::DEFAULT_KERNELOPTS.to_owned()),
        mac: property::get(app, holder, "mac")?
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "00:16:3e:5e:6c:00".to_owned()),
        netvm: property::get(app, holder, "netvm")?
            .and_then(|v| v.as_vm().map(str::to_owned)),
        ip: vm.ip(),
    })
}

/// Provision every configured volume of a qube through its pool. Creation
/// paths call this once the model entry exists.
pub async fn create_volumes_on_disk(app: &AppRef, qid: u32) -> Result<()> {
    let volumes: Vec<(String, crate::storage::PoolRef, crate::storage::VolumeConfig)> = {
        let app = app.borrow();
        let vm = app
            .domains
            .get(qid)
            .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
        vm.volumes
            .values()
            .map(|volume| Ok((vm.name.clone(), app.get_pool(&volume.pool)?, volume.clone())))
            .collect::<Result<_>>()?
    };
    for (vm_name, pool, config) in volumes {
        pool.create(&vm_name, &config)
            .await
            .map_err(|e| QubesError::Storage(e.to_string()))?;
    }
    Ok(())
}

/// Write identity and network entries to the qube's configuration bus.
pub fn create_qdb_entries(app: &App, qid: u32) -> Result<()> {
    let vm = app
        .domains
        .get(qid)
        .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
    let bus = &app.bus;
    let name = &vm.name;
    bus.write(name, "/name", name);
    bus.write(name, "/qubes-vm-type", vm.class.as_str());
    let debug = property::get(app, Emitter::Vm(qid), "debug")
        .ok()
        .flatten()
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    bus.write(name, "/qubes-debug-mode", if debug { "1" } else { "0" });

    if let Some(ip) = vm.ip() {
        bus.write(name, "/qubes-ip", &ip);
        bus.write(name, "/qubes-netmask", "255.255.255.255");
        let (dns1, dns2) = vm.dns();
        bus.write(name, "/qubes-primary-dns", dns1);
        bus.write(name, "/qubes-secondary-dns", dns2);
        if let Some(netvm_qid) = crate::vm::netvm_of(app, qid) {
            if let Some(gateway) = app
                .domains
                .get(netvm_qid)
                .and_then(|netvm| netvm.gateway(app))
            {
                bus.write(name, "/qubes-gateway", &gateway);
            }
        }
    }
    Ok(())
}

/// Publish a qube's firewall rules into its netvm's configuration bus.
pub fn reload_firewall_for_vm(app: &App, netvm_qid: u32, qid: u32) -> Result<()> {
    let netvm_name = vm_name(app, netvm_qid)?;
    let vm = app
        .domains
        .get(qid)
        .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
    let Some(ip) = vm.ip() else { return Ok(()) };
    app.bus.rm(&netvm_name, &format!("/qubes-firewall/{ip}"));
    for (key, value) in vm.firewall.qdb_entries(&ip) {
        app.bus.write(&netvm_name, &key, &value);
    }
    Ok(())
}

/// Start a qube.
///
/// The netvm is started first when needed. Memory is requested from the
/// balancer before the domain is created and the reservation is released
/// right after unpause, so the balancer can reclaim any surplus. If anything
/// fails after the hypervisor created the domain, the domain is killed to
/// avoid orphaned memory.
pub async fn start(app: &AppRef, qid: u32) -> Result<()> {
    let lock = op_lock(&app.borrow(), qid)?;
    let _guard = lock.lock().await;

    let (name, class) = {
        let app = app.borrow();
        let vm = app
            .domains
            .get(qid)
            .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
        (vm.name.clone(), vm.class)
    };
    if class == VmClass::AdminVM {
        return Err(QubesError::Vm {
            vm: name,
            msg: "the administrative qube is always running".to_owned(),
        });
    }

    // intentionally not is_running(): Paused, Crashed and Halting are not
    // startable either
    if get_power_state(app, qid).await? != PowerState::Halted {
        return Err(QubesError::NotHalted { vm: name });
    }

    {
        let app_ref = app.borrow();
        if features::get_bool(&app_ref, qid, "prohibit-start", false) {
            return Err(QubesError::Vm {
                vm: name,
                msg: "start of this qube is prohibited".to_owned(),
            });
        }
    }

    info!("starting {name}");
    {
        let mut app = app.borrow_mut();
        events::fire_event_pre(&mut app, Emitter::Vm(qid), "domain-pre-start", &EventArgs::new())?;
    }

    // netvm first, recursively
    let netvm_qid = {
        let app = app.borrow();
        crate::vm::netvm_of(&app, qid).filter(|netvm| *netvm != 0)
    };
    if let Some(netvm_qid) = netvm_qid {
        let netvm_running = app
            .borrow()
            .domains
            .get(netvm_qid)
            .is_some_and(|vm| vm.is_running());
        if !netvm_running {
            Box::pin(start(app, netvm_qid)).await?;
        }
    }

    // verify storage volumes
    let volumes: Vec<(String, crate::storage::PoolRef)> = {
        let app = app.borrow();
        let vm = app.domains.get(qid).expect("checked above");
        vm.volumes
            .values()
            .map(|volume| Ok((volume.name.clone(), app.get_pool(&volume.pool)?)))
            .collect::<Result<_>>()?
    };
    for (volume, pool) in &volumes {
        pool.verify(&name, volume)
            .await
            .map_err(|e| QubesError::Storage(e.to_string()))?;
    }

    let config = render_domain_config(&app.borrow(), qid)?;
    let mem_required =
        config.memory + config.vcpus as u64 * commons::VCPU_OVERHEAD + commons::START_OVERHEAD;

    let memman = app.borrow().memman.clone();
    let allocation = match &memman {
        Some(balancer) => Some(balancer.allocate(mem_required).await.map_err(|_| {
            QubesError::OutOfMemory { vm: name.clone() }
        })?),
        None => None,
    };

    let hypervisor = app.borrow().hypervisor.clone();
    hypervisor
        .define_domain(&config)
        .await
        .map_err(QubesError::external)?;
    let xid = hypervisor
        .create_paused(&name)
        .await
        .map_err(QubesError::external)?;

    let started: Result<()> = async {
        {
            let mut app = app.borrow_mut();
            if let Some(vm) = app.domains.get_mut(qid) {
                vm.xid = xid;
                vm.power_state = PowerState::Paused;
            }
            events::fire_event(&mut app, Emitter::Vm(qid), "domain-spawn", &EventArgs::new())?;
            create_qdb_entries(&app, qid)?;
        }

        hypervisor.unpause(&name).await.map_err(QubesError::external)?;
        // release the reservation so the balancer may reclaim surplus
        drop(allocation);

        {
            let mut app = app.borrow_mut();
            let qrexec = features::get_bool(&app, qid, "qrexec", true);
            if let Some(vm) = app.domains.get_mut(qid) {
                vm.qrexec_running = qrexec;
                vm.power_state = PowerState::Running;
            }
            events::fire_event(&mut app, Emitter::Vm(qid), "domain-start", &EventArgs::new())?;

            if let Some(netvm_qid) = crate::vm::netvm_of(&app, qid) {
                reload_firewall_for_vm(&app, netvm_qid, qid)?;
            }
        }
        Ok(())
    }
    .await;

    if let Err(error) = started {
        // do not leak a half-started domain and its memory
        warn!("start of {name} failed, killing the domain: {error}");
        if let Err(kill_error) = hypervisor.destroy(&name).await {
            warn!("cannot kill half-started {name}: {kill_error}");
        }
        let mut app = app.borrow_mut();
        if let Some(vm) = app.domains.get_mut(qid) {
            vm.power_state = PowerState::Halted;
            vm.xid = -1;
            vm.qrexec_running = false;
        }
        return Err(error);
    }

    info!("activated {name}");
    Ok(())
}

/// Gracefully shut a qube down. `force` bypasses the netvm veto; `wait`
/// blocks until the qube reaches Halted.
pub async fn shutdown(app: &AppRef, qid: u32, force: bool, wait: bool) -> Result<()> {
    let lock = op_lock(&app.borrow(), qid)?;
    let _guard = lock.lock().await;

    let name = vm_name(&app.borrow(), qid)?;
    if app.borrow().domains.get(qid).is_some_and(|vm| vm.class == VmClass::AdminVM) {
        return Err(QubesError::Vm {
            vm: name,
            msg: "the administrative qube cannot be shut down".to_owned(),
        });
    }
    if get_power_state(app, qid).await? == PowerState::Halted {
        return Err(QubesError::NotStarted { vm: name });
    }

    {
        let mut app = app.borrow_mut();
        let args = EventArgs::new().arg("force", force);
        events::fire_event_pre(&mut app, Emitter::Vm(qid), "domain-pre-shutdown", &args)?;
    }

    let hypervisor = app.borrow().hypervisor.clone();
    hypervisor.shutdown(&name).await.map_err(QubesError::external)?;

    while wait && get_power_state(app, qid).await? != PowerState::Halted {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let state = get_power_state(app, qid).await?;
    if state == PowerState::Halted {
        let mut app = app.borrow_mut();
        events::fire_event(&mut app, Emitter::Vm(qid), "domain-shutdown", &EventArgs::new())?;
    }
    Ok(())
}

/// Forcefully destroy a qube; bypasses the `domain-pre-shutdown` veto.
pub async fn kill(app: &AppRef, qid: u32) -> Result<()> {
    let lock = op_lock(&app.borrow(), qid)?;
    let _guard = lock.lock().await;

    let name = vm_name(&app.borrow(), qid)?;
    if app.borrow().domains.get(qid).is_some_and(|vm| vm.class == VmClass::AdminVM) {
        return Err(QubesError::Vm {
            vm: name,
            msg: "the administrative qube cannot be killed".to_owned(),
        });
    }
    let state = get_power_state(app, qid).await?;
    if !(state.is_running() || matches!(state, PowerState::Paused | PowerState::Suspended)) {
        return Err(QubesError::NotStarted { vm: name });
    }

    let hypervisor = app.borrow().hypervisor.clone();
    hypervisor.destroy(&name).await.map_err(QubesError::external)?;

    {
        let mut app = app.borrow_mut();
        if let Some(vm) = app.domains.get_mut(qid) {
            vm.power_state = PowerState::Halted;
            vm.xid = -1;
            vm.qrexec_running = false;
        }
        events::fire_event(&mut app, Emitter::Vm(qid), "domain-shutdown", &EventArgs::new())?;
    }
    Ok(())
}

/// Pause a running qube.
pub async fn pause(app: &AppRef, qid: u32) -> Result<()> {
    let name = vm_name(&app.borrow(), qid)?;
    if !get_power_state(app, qid).await?.is_running() {
        return Err(QubesError::NotRunning { vm: name });
    }
    let hypervisor = app.borrow().hypervisor.clone();
    hypervisor.pause(&name).await.map_err(QubesError::external)?;
    app.borrow_mut()
        .domains
        .get_mut(qid)
        .expect("checked above")
        .power_state = PowerState::Paused;
    Ok(())
}

/// Suspend a qube (S3). Qubes with PCI devices attached cannot be suspended.
pub async fn suspend(app: &AppRef, qid: u32) -> Result<()> {
    let name = vm_name(&app.borrow(), qid)?;
    let state = get_power_state(app, qid).await?;
    if !state.is_running() && !matches!(state, PowerState::Paused) {
        return Err(QubesError::NotRunning { vm: name });
    }
    let has_pci = app
        .borrow()
        .domains
        .get(qid)
        .is_some_and(|vm| vm.devices.get("pci").is_some_and(|devs| !devs.is_empty()));
    if has_pci {
        return Err(QubesError::Vm {
            vm: name,
            msg: "cannot suspend a qube with PCI devices attached".to_owned(),
        });
    }
    let hypervisor = app.borrow().hypervisor.clone();
    hypervisor.suspend(&name).await.map_err(QubesError::external)?;
    app.borrow_mut()
        .domains
        .get_mut(qid)
        .expect("checked above")
        .power_state = PowerState::Suspended;
    Ok(())
}

/// Resume (unpause) a paused qube.
pub async fn unpause(app: &AppRef, qid: u32) -> Result<()> {
    let name = vm_name(&app.borrow(), qid)?;
    if !matches!(
        get_power_state(app, qid).await?,
        PowerState::Paused | PowerState::Suspended
    ) {
        return Err(QubesError::NotPaused { vm: name });
    }
    let hypervisor = app.borrow().hypervisor.clone();
    hypervisor.unpause(&name).await.map_err(QubesError::external)?;
    app.borrow_mut()
        .domains
        .get_mut(qid)
        .expect("checked above")
        .power_state = PowerState::Running;
    Ok(())
}

/// Resume a suspended qube.
pub async fn resume(app: &AppRef, qid: u32) -> Result<()> {
    let name = vm_name(&app.borrow(), qid)?;
    match get_power_state(app, qid).await? {
        PowerState::Suspended => {
            let hypervisor = app.borrow().hypervisor.clone();
            hypervisor.resume(&name).await.map_err(QubesError::external)?;
            app.borrow_mut()
                .domains
                .get_mut(qid)
                .expect("checked above")
                .power_state = PowerState::Running;
            Ok(())
        }
        _ => unpause(app, qid).await,
    }
}

/// Change a qube's netvm, detaching from the old provider and attaching to
/// the new one when the qube is running. Static validation (network loops,
/// non-providers, stopped targets) happens in the `property-pre-set:netvm`
/// handler fired by the property system.
pub async fn set_netvm(app: &AppRef, qid: u32, netvm: Option<String>) -> Result<()> {
    let name = vm_name(&app.borrow(), qid)?;
    let (running, old_netvm) = {
        let app = app.borrow();
        let running = app.domains.get(qid).is_some_and(|vm| vm.is_running());
        (running, crate::vm::netvm_of(&app, qid))
    };

    if running && old_netvm.is_some() {
        let hypervisor = app.borrow().hypervisor.clone();
        hypervisor
            .detach_network(&name)
            .await
            .map_err(QubesError::external)?;
    }

    {
        let mut app = app.borrow_mut();
        property::set(&mut app, Emitter::Vm(qid), "netvm", PropertyValue::Vm(netvm.clone()))?;
    }

    if let Some(new_name) = netvm {
        let new_qid = {
            let app = app.borrow();
            app.domains.get_by_name(&new_name).map(|vm| vm.qid)
        };
        let new_running = new_qid.is_some_and(|new_qid| {
            app.borrow()
                .domains
                .get(new_qid)
                .is_some_and(|vm| vm.is_running())
        });
        if running && new_running {
            let hypervisor = app.borrow().hypervisor.clone();
            {
                let app = app.borrow();
                create_qdb_entries(&app, qid)?;
            }
            hypervisor
                .attach_network(&name, &new_name)
                .await
                .map_err(QubesError::external)?;
            let mut app = app.borrow_mut();
            let new_qid = new_qid.expect("resolved above");
            reload_firewall_for_vm(&app, new_qid, qid)?;
            let args = EventArgs::new().arg("vm", name.as_str());
            events::fire_event(&mut app, Emitter::Vm(new_qid), "net-domain-connect", &args)?;
        }
    }
    Ok(())
}

/// Copy all cloneable properties and every volume from `src` to `dst`. The
/// destination must be newly created and halted.
pub async fn clone_vm(app: &AppRef, src_qid: u32, dst_qid: u32) -> Result<()> {
    let (src_name, dst_name) = {
        let app = app.borrow();
        (vm_name(&app, src_qid)?, vm_name(&app, dst_qid)?)
    };
    if get_power_state(app, dst_qid).await? != PowerState::Halted {
        return Err(QubesError::NotHalted { vm: dst_name });
    }

    {
        let mut app = app.borrow_mut();
        let src_class = app.domains.get(src_qid).expect("exists").class;
        let defs: Vec<&'static crate::property::PropertyDef> =
            crate::vm::properties_for_class(src_class)
                .iter()
                .copied()
                .filter(|def| def.clone)
                .collect();
        for def in defs {
            let stored = app
                .domains
                .get(src_qid)
                .and_then(|vm| vm.properties.get(def.name))
                .cloned();
            if let Some(value) = stored {
                property::set(&mut app, Emitter::Vm(dst_qid), def.name, value)?;
            }
        }
        let (features, tags, firewall) = {
            let src = app.domains.get(src_qid).expect("exists");
            (src.features.clone(), src.tags.clone(), src.firewall.clone())
        };
        if let Some(dst) = app.domains.get_mut(dst_qid) {
            dst.features = features;
            dst.tags = tags;
            dst.firewall = firewall;
        }
    }

    let volumes: Vec<(String, crate::storage::PoolRef)> = {
        let app = app.borrow();
        let src = app.domains.get(src_qid).expect("exists");
        src.volumes
            .values()
            .filter(|volume| volume.save_on_stop)
            .map(|volume| Ok((volume.name.clone(), app.get_pool(&volume.pool)?)))
            .collect::<Result<_>>()?
    };
    for (volume, pool) in volumes {
        pool.clone_volume(&src_name, &dst_name, &volume)
            .await
            .map_err(|e| QubesError::Storage(e.to_string()))?;
    }

    {
        let mut app = app.borrow_mut();
        let args = EventArgs::new().arg("src", src_name.as_str());
        events::fire_event(&mut app, Emitter::Vm(dst_qid), "domain-clone-files", &args)?;
    }
    Ok(())
}

/// Follow the hypervisor's lifecycle event stream and keep the cached power
/// states in sync; out-of-band halts (crashes, in-guest shutdowns) fire
/// `domain-shutdown` just like daemon-initiated ones.
pub async fn monitor_domain_events(app: AppRef) {
    let mut events = app.borrow().hypervisor.lifecycle_events();
    while let Some(event) = events.recv().await {
        let mut app = app.borrow_mut();
        let Some(qid) = app.domains.get_by_name(&event.domain).map(|vm| vm.qid) else {
            continue;
        };
        let new_state = match event.state {
            DomainState::Running => PowerState::Running,
            DomainState::Paused => PowerState::Paused,
            DomainState::Suspended => PowerState::Suspended,
            DomainState::ShuttingDown => PowerState::Halting,
            DomainState::Crashed => PowerState::Crashed,
            DomainState::Dying => PowerState::Dying,
            DomainState::Undefined | DomainState::Halted => PowerState::Halted,
        };
        let old_state = app.domains.get(qid).map(|vm| vm.power_state);
        if let Some(vm) = app.domains.get_mut(qid) {
            vm.power_state = new_state;
            if new_state == PowerState::Halted {
                vm.xid = -1;
                vm.qrexec_running = false;
            }
        }
        if new_state == PowerState::Halted && old_state != Some(PowerState::Halted) {
            if let Err(error) =
                events::fire_event(&mut app, Emitter::Vm(qid), "domain-shutdown", &EventArgs::new())
            {
                warn!("domain-shutdown handler failed for {}: {error}", event.domain);
            }
        }
    }
}

/// Rename a halted qube. Qubes installed from a system package cannot be
/// renamed.
pub async fn rename(app: &AppRef, qid: u32, new_name: &str) -> Result<()> {
    commons::validate_name(new_name)?;
    let old_name = vm_name(&app.borrow(), qid)?;
    {
        let app_ref = app.borrow();
        if app_ref.domains.contains_name(new_name) {
            return Err(QubesError::value(format!("VM {new_name} already exists")));
        }
        if app_ref.domains.get(qid).is_some_and(|vm| vm.class == VmClass::AdminVM) {
            return Err(QubesError::Vm {
                vm: old_name.clone(),
                msg: "the administrative qube cannot be renamed".to_owned(),
            });
        }
        if features::get_bool(&app_ref, qid, "installed-by-rpm", false)
            || property::get(&app_ref, Emitter::Vm(qid), "installed_by_rpm")
                .ok()
                .flatten()
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        {
            return Err(QubesError::Vm {
                vm: old_name.clone(),
                msg: "cannot rename a qube installed from a system package".to_owned(),
            });
        }
    }
    if get_power_state(app, qid).await? != PowerState::Halted {
        return Err(QubesError::NotHalted { vm: old_name });
    }

    // drop the stale defined domain; it is re-rendered at next start
    let hypervisor = app.borrow().hypervisor.clone();
    if let Err(error) = hypervisor.undefine_domain(&old_name).await {
        warn!("cannot undefine {old_name} while renaming: {error}");
    }

    let mut app = app.borrow_mut();
    app.bus.rm_vm(&old_name);
    if let Some(vm) = app.domains.get_mut(qid) {
        vm.name = new_name.to_owned();
    }
    info!("renamed {old_name} to {new_name}");
    Ok(())
}
