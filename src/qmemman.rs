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

//! The memory balancer.
//!
//! Running qubes report `/proc/meminfo`-shaped blobs through their
//! configuration bus; the balancer derives each qube's preferred allotment
//! and either satisfies a start-time allocation request (shrinking donors
//! until enough host memory is free) or, between requests, redistributes
//! surplus proportionally to preference.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{QubesError, Result};
use crate::hypervisor::HypervisorRef;
use crate::qdb::ConfigBusRef;

/// Ratio of preferred allotment to measured usage; the headroom feeds the
/// page cache. Downstream arithmetic relies on this exact formula.
pub const CACHE_FACTOR: f64 = 1.3;
/// Extra preference for the administrative qube, which caches block devices
/// for everyone.
pub const DOM0_MEM_BOOST: u64 = 350 * 1024 * 1024;
/// Donors are squeezed slightly harder than strictly needed so rounding
/// losses cannot wedge an allocation; surplus returns on the next balance.
pub const REQ_SAFETY_NET_FACTOR: f64 = 1.05;
pub const BALLOON_DELAY: Duration = Duration::from_millis(100);
pub const MAX_BALLOON_ITERATIONS: u32 = 20;
/// Adjustments below this size are not worth the churn.
pub const MIN_BALANCE_DELTA: u64 = 100 * 1024 * 1024;
/// Donors already within this distance of their preference are left alone.
pub const MIN_DONOR_YIELD: u64 = 10 * 1024 * 1024;

/// Key each running qube writes its memory report under.
pub const MEMINFO_KEY: &str = "/meminfo";

/// Parsed memory report, all values in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub buffers: u64,
    pub cached: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

/// Parse a `/proc/meminfo`-shaped report (values in KiB). Returns `None`
/// for anything malformed or with swap accounting inside out.
pub fn parse_meminfo(raw: &str) -> Option<MemInfo> {
    let mut fields: HashMap<&str, u64> = HashMap::new();
    for line in raw.lines() {
        let mut words = line.split_whitespace();
        let (Some(key), Some(value)) = (words.next(), words.next()) else {
            continue;
        };
        if let Ok(value) = value.parse::<u64>() {
            fields.insert(key.trim_end_matches(':'), value * 1024);
        }
    }
    let info = MemInfo {
        mem_total: *fields.get("MemTotal")?,
        mem_free: *fields.get("MemFree")?,
        buffers: *fields.get("Buffers")?,
        cached: *fields.get("Cached")?,
        swap_total: *fields.get("SwapTotal")?,
        swap_free: *fields.get("SwapFree")?,
    };
    if info.swap_total < info.swap_free {
        return None;
    }
    Some(info)
}

/// A report lying about its totals marks the whole qube as unknown.
pub fn is_suspicious(info: &MemInfo) -> bool {
    info.swap_total < info.swap_free
        || info.mem_total < info.mem_free + info.cached + info.buffers
}

fn mem_used(info: &MemInfo) -> u64 {
    info.mem_total - info.mem_free - info.cached - info.buffers
        + (info.swap_total - info.swap_free)
}

/// Per-qube balancer record.
#[derive(Debug, Clone, Default)]
pub struct DomainRecord {
    /// `None` when the last report was missing or suspicious
    pub mem_used: Option<u64>,
    pub memory_actual: u64,
    /// Latched when a shrink request produced no movement; the flag is reset
    /// only at the start of each allocation request, never between its
    /// iterations. The latch is deliberate.
    pub no_progress: bool,
}

/// Preferred allotment of a qube, in bytes.
pub fn prefmem(name: &str, record: &DomainRecord) -> f64 {
    let used = record.mem_used.unwrap_or(0) as f64;
    // dom0 is special: it must have a large cache, for block devices
    if name == "dom0" {
        used * CACHE_FACTOR + DOM0_MEM_BOOST as f64
    } else {
        used * CACHE_FACTOR
    }
}

/// How much more (positive) or less (negative) than its preference a qube
/// currently holds. `balance` distributes proportionally to `prefmem`, which
/// relies on this exact formula; do not change it.
pub fn memneeded(name: &str, record: &DomainRecord) -> f64 {
    prefmem(name, record) - record.memory_actual as f64
}

/// Compute shrink requests freeing `memsize` bytes. Returns an empty list
/// when the donors cannot cover the request; the caller must fail, not
/// retry forever.
pub fn balloon(memsize: u64, domains: &HashMap<String, DomainRecord>) -> Vec<(String, u64)> {
    let mut donors: Vec<(&String, f64)> = Vec::new();
    let mut available = 0.0;
    for (name, record) in domains {
        if record.mem_used.is_none() || record.no_progress {
            continue;
        }
        let need = memneeded(name, record);
        if need < 0.0 {
            donors.push((name, -need));
            available -= need;
        }
    }
    debug!("balloon: req={memsize} avail={available} donors={}", donors.len());
    if available < memsize as f64 {
        return Vec::new();
    }
    let scale = memsize as f64 / available;
    donors
        .into_iter()
        .map(|(name, mem)| {
            let borrowed = mem * scale * REQ_SAFETY_NET_FACTOR;
            debug!("borrow {borrowed} from {name}");
            let target = (domains[name].memory_actual as f64 - borrowed).max(0.0);
            (name.clone(), target as u64)
        })
        .collect()
}

fn balance_when_enough_memory(
    domains: &HashMap<String, DomainRecord>,
    total_mem_pref: f64,
    totalsum: f64,
) -> Vec<(String, u64)> {
    let mut donors_rq = Vec::new();
    let mut acceptors_rq = Vec::new();
    for (name, record) in domains {
        if record.mem_used.is_none() {
            continue;
        }
        // distribute the surplus proportionally to preference, truncated a
        // whisker low to absorb rounding
        let pref = prefmem(name, record);
        let scale = pref / total_mem_pref;
        let target_nonint = pref + scale * totalsum;
        let target = (0.999 * target_nonint) as u64;
        if target < record.memory_actual {
            donors_rq.push((name.clone(), target));
        } else {
            acceptors_rq.push((name.clone(), target));
        }
    }
    donors_rq.into_iter().chain(acceptors_rq).collect()
}

fn balance_when_low_on_memory(
    domains: &HashMap<String, DomainRecord>,
    xenfree: u64,
    total_mem_pref_acceptors: f64,
    donors: &[String],
    acceptors: &[String],
) -> Vec<(String, u64)> {
    let mut donors_rq = Vec::new();
    let mut acceptors_rq = Vec::new();
    let mut squeezed_mem = xenfree as f64;
    for name in donors {
        let record = &domains[name];
        let avail = -memneeded(name, record);
        if avail < MIN_DONOR_YIELD as f64 {
            // probably already squeezed to its preference; give up on it
            continue;
        }
        squeezed_mem -= avail;
        donors_rq.push((name.clone(), prefmem(name, record) as u64));
    }
    // can happen when host free memory starts out very low
    if squeezed_mem < 0.0 {
        return donors_rq;
    }
    for name in acceptors {
        let record = &domains[name];
        let scale = prefmem(name, record) / total_mem_pref_acceptors;
        let target = record.memory_actual as f64 + scale * squeezed_mem;
        acceptors_rq.push((name.clone(), target as u64));
    }
    donors_rq.into_iter().chain(acceptors_rq).collect()
}

/// Compute rebalance targets for the idle loop.
pub fn balance(xenfree: u64, domains: &HashMap<String, DomainRecord>) -> Vec<(String, u64)> {
    let mut total_memneeded = 0.0;
    let mut total_mem_pref = 0.0;
    let mut total_mem_pref_acceptors = 0.0;
    let mut donors = Vec::new();
    let mut acceptors = Vec::new();

    for (name, record) in domains {
        if record.mem_used.is_none() {
            continue;
        }
        let need = memneeded(name, record);
        if need < 0.0 {
            donors.push(name.clone());
        } else {
            acceptors.push(name.clone());
            total_mem_pref_acceptors += prefmem(name, record);
        }
        total_memneeded += need;
        total_mem_pref += prefmem(name, record);
    }

    let totalsum = xenfree as f64 - total_memneeded;
    if totalsum > 0.0 {
        balance_when_enough_memory(domains, total_mem_pref, totalsum)
    } else {
        balance_when_low_on_memory(
            domains,
            xenfree,
            total_mem_pref_acceptors,
            &donors,
            &acceptors,
        )
    }
}

/// Reservation handed to a start sequence. Balancing stays paused until it
/// is dropped, which the starter does right after unpausing the new domain.
pub struct MemoryAllocation {
    _guard: OwnedMutexGuard<()>,
}

pub struct Balancer {
    hypervisor: HypervisorRef,
    bus: ConfigBusRef,
    domains: RefCell<HashMap<String, DomainRecord>>,
    /// Held by an in-flight allocation; the idle loop takes it per tick
    lock: Arc<Mutex<()>>,
    /// Presence of this file disables idle balancing
    pub sentinel_path: PathBuf,
}

impl Balancer {
    pub fn new(hypervisor: HypervisorRef, bus: ConfigBusRef) -> Rc<Self> {
        Rc::new(Balancer {
            hypervisor,
            bus,
            domains: RefCell::new(HashMap::new()),
            lock: Arc::new(Mutex::new(())),
            sentinel_path: PathBuf::from(crate::commons::NO_MEMBALANCE_SENTINEL),
        })
    }

    /// Record a fresh memory report for a qube. Suspicious reports reset the
    /// record to unknown, excluding the qube from balancing.
    pub fn refresh_meminfo(&self, name: &str, raw: &str) {
        let mut domains = self.domains.borrow_mut();
        let record = domains.entry(name.to_owned()).or_default();
        match parse_meminfo(raw) {
            Some(info) if !is_suspicious(&info) => {
                record.mem_used = Some(mem_used(&info));
            }
            Some(info) => {
                warn!(
                    "suspicious meminfo for {name} (actual {}): {info:?}",
                    record.memory_actual
                );
                record.mem_used = None;
            }
            None => {
                record.mem_used = None;
            }
        }
    }

    pub fn forget_domain(&self, name: &str) {
        self.domains.borrow_mut().remove(name);
    }

    /// Test and introspection hook.
    pub fn record(&self, name: &str) -> Option<DomainRecord> {
        self.domains.borrow().get(name).cloned()
    }

    async fn refresh_memactual(&self) -> Result<()> {
        let list = self
            .hypervisor
            .domain_list()
            .await
            .map_err(QubesError::external)?;
        let mut domains = self.domains.borrow_mut();
        for info in list {
            let record = domains.entry(info.name).or_default();
            record.memory_actual = info.memory_actual;
        }
        Ok(())
    }

    /// Make at least `memsize` bytes of host memory free, shrinking donors.
    ///
    /// Stuck qubes are detected by comparing actuals between iterations: a
    /// donor that did not move is latched out of the donor set for the rest
    /// of this request.
    pub async fn allocate(self: &Rc<Self>, memsize: u64) -> Result<MemoryAllocation> {
        let guard = Arc::clone(&self.lock).lock_owned().await;

        {
            let mut domains = self.domains.borrow_mut();
            for record in domains.values_mut() {
                record.no_progress = false;
            }
        }

        let mut prev_memory_actual: Option<HashMap<String, u64>> = None;
        let mut niter = 0u32;
        loop {
            let xenfree = self
                .hypervisor
                .free_memory()
                .await
                .map_err(QubesError::external)?;
            if xenfree >= memsize {
                return Ok(MemoryAllocation { _guard: guard });
            }
            self.refresh_memactual().await?;

            let requests = {
                let mut domains = self.domains.borrow_mut();
                if let Some(prev) = &prev_memory_actual {
                    for (name, record) in domains.iter_mut() {
                        if prev.get(name) == Some(&record.memory_actual) {
                            record.no_progress = true;
                            debug!("domain {name} stuck at {}", record.memory_actual);
                        }
                    }
                }
                balloon(memsize - xenfree, &domains)
            };

            if niter > MAX_BALLOON_ITERATIONS || requests.is_empty() {
                return Err(QubesError::Qubes(format!(
                    "cannot free {memsize} bytes of memory"
                )));
            }

            let mut prev = HashMap::new();
            for (name, target) in &requests {
                prev.insert(
                    name.clone(),
                    self.domains
                        .borrow()
                        .get(name)
                        .map(|r| r.memory_actual)
                        .unwrap_or(0),
                );
                self.mem_set(name, *target).await?;
            }
            prev_memory_actual = Some(prev);

            tokio::time::sleep(BALLOON_DELAY).await;
            niter += 1;
        }
    }

    async fn mem_set(&self, name: &str, target: u64) -> Result<()> {
        info!("mem-set domain {name} to {target}");
        self.hypervisor
            .set_memory(name, target)
            .await
            .map_err(QubesError::external)
    }

    /// Fallback that pokes the balloon target straight through the
    /// configuration bus as well as the hypervisor. Fast, but management
    /// tooling then reports stale values, so the control loops never use
    /// it; it exists for recovery situations only.
    #[allow(dead_code)]
    async fn mem_set_alternative(&self, name: &str, target: u64) -> Result<()> {
        self.bus
            .write(name, "/memory/target", &(target / 1024).to_string());
        self.hypervisor
            .set_memory(name, target)
            .await
            .map_err(QubesError::external)
    }

    /// Scale a grow request down to what is actually free right now; an
    /// earlier shrink may not have landed yet.
    fn adjust_inflates_to_xenfree(
        &self,
        requests: &[(String, u64)],
        idx: usize,
        xenfree: u64,
    ) -> u64 {
        let domains = self.domains.borrow();
        let mut memory_needed = 0.0;
        for (name, target) in &requests[idx..] {
            let actual = domains.get(name).map(|r| r.memory_actual).unwrap_or(0);
            memory_needed += *target as f64 - actual as f64;
        }
        let (name, target) = &requests[idx];
        let actual = domains.get(name).map(|r| r.memory_actual).unwrap_or(0) as f64;
        if memory_needed <= 0.0 {
            return *target;
        }
        let scale = xenfree as f64 / memory_needed;
        (actual + scale * (*target as f64 - actual)) as u64
    }

    /// One idle rebalance pass: shrink every donor, wait a tick, then grow
    /// acceptors, re-scaling each grow to the current free memory.
    pub async fn balance_once(&self) -> Result<()> {
        if self.sentinel_path.exists() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;

        self.refresh_memactual().await?;
        let xenfree = self
            .hypervisor
            .free_memory()
            .await
            .map_err(QubesError::external)?;
        let requests = balance(xenfree, &self.domains.borrow());

        let mut wait_before_first_inflate = false;
        for idx in 0..requests.len() {
            let (name, target) = &requests[idx];
            let actual = self
                .domains
                .borrow()
                .get(name)
                .map(|r| r.memory_actual)
                .unwrap_or(0);
            let change = *target as i64 - actual as i64;
            if change.unsigned_abs() < MIN_BALANCE_DELTA {
                continue;
            }
            let mut target = *target;
            if change < 0 {
                wait_before_first_inflate = true;
            } else {
                if wait_before_first_inflate {
                    tokio::time::sleep(BALLOON_DELAY).await;
                    wait_before_first_inflate = false;
                }
                // called before each inflate, to account for a release still
                // in progress
                let xenfree = self
                    .hypervisor
                    .free_memory()
                    .await
                    .map_err(QubesError::external)?;
                target = self.adjust_inflates_to_xenfree(&requests, idx, xenfree);
            }
            self.mem_set(name, target).await?;
        }
        Ok(())
    }

    /// Drive the balancer from configuration-bus updates: every meminfo
    /// write refreshes the report and triggers a rebalance pass.
    pub async fn run(self: Rc<Self>) {
        let mut events = self.bus.watch(MEMINFO_KEY);
        while let Some(event) = events.recv().await {
            if let Some(raw) = self.bus.read(&event.vm, MEMINFO_KEY) {
                self.refresh_meminfo(&event.vm, &raw);
            }
            if let Err(error) = self.balance_once().await {
                warn!("memory balance failed: {error}");
            }
        }
    }
}
