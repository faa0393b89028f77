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

//! Hypervisor adapter.
//!
//! The daemon never talks to a hypervisor binding directly; everything goes
//! through the [`Hypervisor`] trait so tests can inject a fake and production
//! can wire up a libvirt-backed implementation. [`Reconnecting`] wraps any
//! implementation and reissues a failed call exactly once after a connection
//! loss.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::commons::VirtMode;

pub type HvResult<T> = Result<T, HvError>;

#[derive(Error, Debug)]
pub enum HvError {
    #[error("hypervisor connection lost")]
    ConnectionLost,
    #[error("no such domain: {0}")]
    NoSuchDomain(String),
    #[error("hypervisor: {0}")]
    Failed(String),
}

/// Static facts about the host machine.
#[derive(Debug, Clone, Copy)]
pub struct HostInfo {
    pub cpus: u32,
    /// Total physical memory, in bytes
    pub memory_total: u64,
}

/// Runtime state of a defined domain, as the hypervisor reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    /// The domain is not defined at all
    Undefined,
    /// Defined but not active
    Halted,
    Running,
    Paused,
    /// In the process of shutting down
    ShuttingDown,
    Crashed,
    Suspended,
    Dying,
}

/// Per-domain accounting row returned by [`Hypervisor::domain_list`].
#[derive(Debug, Clone)]
pub struct DomainInfo {
    pub name: String,
    pub xid: i64,
    /// Memory currently assigned to the domain, in bytes
    pub memory_actual: u64,
}

/// Everything needed to define a domain; rendered from the qube's properties
/// right before each start.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub name: String,
    pub virt_mode: VirtMode,
    /// Initial memory, bytes
    pub memory: u64,
    /// Balloon ceiling, bytes
    pub maxmem: u64,
    pub vcpus: u32,
    pub kernel: Option<String>,
    pub kernelopts: String,
    pub mac: String,
    /// Name of the network-providing domain the NIC connects to, if any
    pub netvm: Option<String>,
    pub ip: Option<String>,
}

/// Domain lifecycle notification delivered by the hypervisor's event stream.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub domain: String,
    pub state: DomainState,
}

/// The hypervisor seam. All calls are suspension points.
#[async_trait(?Send)]
pub trait Hypervisor {
    async fn host_info(&self) -> HvResult<HostInfo>;

    /// Free host memory in bytes, from physinfo.
    async fn free_memory(&self) -> HvResult<u64>;

    async fn define_domain(&self, config: &DomainConfig) -> HvResult<()>;
    async fn undefine_domain(&self, name: &str) -> HvResult<()>;

    /// Create (start) a defined domain in the paused state; returns its xid.
    async fn create_paused(&self, name: &str) -> HvResult<i64>;

    async fn unpause(&self, name: &str) -> HvResult<()>;
    async fn pause(&self, name: &str) -> HvResult<()>;
    async fn suspend(&self, name: &str) -> HvResult<()>;
    async fn resume(&self, name: &str) -> HvResult<()>;

    /// Graceful shutdown request to the guest.
    async fn shutdown(&self, name: &str) -> HvResult<()>;

    /// Immediate destruction.
    async fn destroy(&self, name: &str) -> HvResult<()>;

    /// Balloon the domain to the given target, in bytes.
    async fn set_memory(&self, name: &str, target: u64) -> HvResult<()>;

    async fn domain_state(&self, name: &str) -> HvResult<DomainState>;
    async fn domain_xid(&self, name: &str) -> HvResult<i64>;
    async fn domain_list(&self) -> HvResult<Vec<DomainInfo>>;

    async fn attach_network(&self, name: &str, netvm: &str) -> HvResult<()>;
    async fn detach_network(&self, name: &str) -> HvResult<()>;

    /// Re-establish the underlying connection after a loss.
    async fn reconnect(&self) -> HvResult<()>;

    /// Subscribe to domain lifecycle changes. Implementations re-register the
    /// callback across reconnects; the receiver survives them.
    fn lifecycle_events(&self) -> mpsc::UnboundedReceiver<LifecycleEvent>;
}

macro_rules! retry_once {
    ($self:expr, $call:expr) => {{
        match $call {
            Err(HvError::ConnectionLost) => {
                warn!("hypervisor connection lost, reconnecting");
                $self.inner.reconnect().await?;
                $call
            }
            other => other,
        }
    }};
}

/// Wrapper that transparently reconnects and reissues a failed call at most
/// once. Event callbacks are re-registered by the inner implementation.
pub struct Reconnecting<H: Hypervisor> {
    inner: H,
}

impl<H: Hypervisor> Reconnecting<H> {
    pub fn new(inner: H) -> Self {
        Reconnecting { inner }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait(?Send)]
impl<H: Hypervisor> Hypervisor for Reconnecting<H> {
    async fn host_info(&self) -> HvResult<HostInfo> {
        retry_once!(self, self.inner.host_info().await)
    }

    async fn free_memory(&self) -> HvResult<u64> {
        retry_once!(self, self.inner.free_memory().await)
    }

    async fn define_domain(&self, config: &DomainConfig) -> HvResult<()> {
        retry_once!(self, self.inner.define_domain(config).await)
    }

    async fn undefine_domain(&self, name: &str) -> HvResult<()> {
        retry_once!(self, self.inner.undefine_domain(name).await)
    }

    async fn create_paused(&self, name: &str) -> HvResult<i64> {
        retry_once!(self, self.inner.create_paused(name).await)
    }

    async fn unpause(&self, name: &str) -> HvResult<()> {
        retry_once!(self, self.inner.unpause(name).await)
    }

    async fn pause(&self, name: &str) -> HvResult<()> {
        retry_once!(self, self.inner.pause(name).await)
    }

    async fn suspend(&self, name: &str) -> HvResult<()> {
        retry_once!(self, self.inner.suspend(name).await)
    }

    async fn resume(&self, name: &str) -> HvResult<()> {
        retry_once!(self, self.inner.resume(name).await)
    }

    async fn shutdown(&self, name: &str) -> HvResult<()> {
        retry_once!(self, self.inner.shutdown(name).await)
    }

    async fn destroy(&self, name: &str) -> HvResult<()> {
        retry_once!(self, self.inner.destroy(name).await)
    }

    async fn set_memory(&self, name: &str, target: u64) -> HvResult<()> {
        retry_once!(self, self.inner.set_memory(name, target).await)
    }

    async fn domain_state(&self, name: &str) -> HvResult<DomainState> {
        retry_once!(self, self.inner.domain_state(name).await)
    }

    async fn domain_xid(&self, name: &str) -> HvResult<i64> {
        retry_once!(self, self.inner.domain_xid(name).await)
    }

    async fn domain_list(&self) -> HvResult<Vec<DomainInfo>> {
        retry_once!(self, self.inner.domain_list().await)
    }

    async fn attach_network(&self, name: &str, netvm: &str) -> HvResult<()> {
        retry_once!(self, self.inner.attach_network(name, netvm).await)
    }

    async fn detach_network(&self, name: &str) -> HvResult<()> {
        retry_once!(self, self.inner.detach_network(name).await)
    }

    async fn reconnect(&self) -> HvResult<()> {
        self.inner.reconnect().await
    }

    fn lifecycle_events(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.inner.lifecycle_events()
    }
}

#[derive(Debug, Default)]
struct OfflineDomain {
    state: DomainState,
    config: Option<DomainConfig>,
    memory_actual: u64,
    xid: i64,
}

impl Default for DomainState {
    fn default() -> Self {
        DomainState::Undefined
    }
}

/// In-memory hypervisor used by the test suite and by `--offline` daemon
/// runs. Domains exist purely as records; state transitions follow the same
/// rules a real binding would enforce.
pub struct OfflineHypervisor {
    host: HostInfo,
    free_memory: RefCell<u64>,
    domains: RefCell<HashMap<String, OfflineDomain>>,
    next_xid: RefCell<i64>,
    /// Ordered log of every mutating call, for assertions in tests
    pub calls: RefCell<Vec<String>>,
    /// When set, the named call fails once with the given error text
    pub fail_next: RefCell<Option<(String, String)>>,
    event_senders: RefCell<Vec<mpsc::UnboundedSender<LifecycleEvent>>>,
}

impl OfflineHypervisor {
    pub fn new(cpus: u32, memory_total: u64) -> Self {
        OfflineHypervisor {
            host: HostInfo { cpus, memory_total },
            free_memory: RefCell::new(memory_total),
            domains: RefCell::new(HashMap::new()),
            next_xid: RefCell::new(1),
            calls: RefCell::new(Vec::new()),
            fail_next: RefCell::new(None),
            event_senders: RefCell::new(Vec::new()),
        }
    }

    pub fn set_free_memory(&self, free: u64) {
        *self.free_memory.borrow_mut() = free;
    }

    pub fn set_memory_actual(&self, name: &str, actual: u64) {
        if let Some(dom) = self.domains.borrow_mut().get_mut(name) {
            dom.memory_actual = actual;
        }
    }

    /// Force a state, bypassing transition rules. Test hook.
    pub fn force_state(&self, name: &str, state: DomainState) {
        self.domains
            .borrow_mut()
            .entry(name.to_owned())
            .or_default()
            .state = state;
        self.emit(name, state);
    }

    fn record(&self, call: String) -> HvResult<()> {
        if let Some((when, msg)) = self.fail_next.borrow_mut().take_if(|(when, _)| {
            call.starts_with(when.as_str())
        }) {
            let _ = when;
            return Err(HvError::Failed(msg));
        }
        self.calls.borrow_mut().push(call);
        Ok(())
    }

    fn emit(&self, domain: &str, state: DomainState) {
        let event = LifecycleEvent {
            domain: domain.to_owned(),
            state,
        };
        self.event_senders
            .borrow_mut()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn with_domain<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut OfflineDomain) -> HvResult<T>,
    ) -> HvResult<T> {
        let mut domains = self.domains.borrow_mut();
        match domains.get_mut(name) {
            Some(dom) if dom.state != DomainState::Undefined || dom.config.is_some() => f(dom),
            _ => Err(HvError::NoSuchDomain(name.to_owned())),
        }
    }
}

#[async_trait(?Send)]
impl Hypervisor for OfflineHypervisor {
    async fn host_info(&self) -> HvResult<HostInfo> {
        Ok(self.host)
    }

    async fn free_memory(&self) -> HvResult<u64> {
        Ok(*self.free_memory.borrow())
    }

    async fn define_domain(&self, config: &DomainConfig) -> HvResult<()> {
        self.record(format!("define {}", config.name))?;
        let mut domains = self.domains.borrow_mut();
        let dom = domains.entry(config.name.clone()).or_default();
        dom.config = Some(config.clone());
        if dom.state == DomainState::Undefined {
            dom.state = DomainState::Halted;
        }
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> HvResult<()> {
        self.record(format!("undefine {name}"))?;
        self.domains.borrow_mut().remove(name);
        Ok(())
    }

    async fn create_paused(&self, name: &str) -> HvResult<i64> {
        self.record(format!("create {name}"))?;
        let xid = {
            let mut next = self.next_xid.borrow_mut();
            let xid = *next;
            *next += 1;
            xid
        };
        self.with_domain(name, |dom| {
            if dom.state != DomainState::Halted {
                return Err(HvError::Failed(format!("domain {name} is already active")));
            }
            dom.state = DomainState::Paused;
            dom.xid = xid;
            dom.memory_actual = dom.config.as_ref().map(|c| c.memory).unwrap_or(0);
            Ok(())
        })?;
        self.emit(name, DomainState::Paused);
        Ok(xid)
    }

    async fn unpause(&self, name: &str) -> HvResult<()> {
        self.record(format!("unpause {name}"))?;
        self.with_domain(name, |dom| {
            if !matches!(dom.state, DomainState::Paused | DomainState::Suspended) {
                return Err(HvError::Failed(format!("domain {name} is not paused")));
            }
            dom.state = DomainState::Running;
            Ok(())
        })?;
        self.emit(name, DomainState::Running);
        Ok(())
    }

    async fn pause(&self, name: &str) -> HvResult<()> {
        self.record(format!("pause {name}"))?;
        self.with_domain(name, |dom| {
            dom.state = DomainState::Paused;
            Ok(())
        })?;
        self.emit(name, DomainState::Paused);
        Ok(())
    }

    async fn suspend(&self, name: &str) -> HvResult<()> {
        self.record(format!("suspend {name}"))?;
        self.with_domain(name, |dom| {
            dom.state = DomainState::Suspended;
            Ok(())
        })?;
        self.emit(name, DomainState::Suspended);
        Ok(())
    }

    async fn resume(&self, name: &str) -> HvResult<()> {
        self.record(format!("resume {name}"))?;
        self.with_domain(name, |dom| {
            dom.state = DomainState::Running;
            Ok(())
        })?;
        self.emit(name, DomainState::Running);
        Ok(())
    }

    async fn shutdown(&self, name: &str) -> HvResult<()> {
        self.record(format!("shutdown {name}"))?;
        // an offline guest obeys immediately
        self.with_domain(name, |dom| {
            dom.state = DomainState::Halted;
            dom.xid = 0;
            Ok(())
        })?;
        self.emit(name, DomainState::Halted);
        Ok(())
    }

    async fn destroy(&self, name: &str) -> HvResult<()> {
        self.record(format!("destroy {name}"))?;
        self.with_domain(name, |dom| {
            dom.state = DomainState::Halted;
            dom.xid = 0;
            Ok(())
        })?;
        self.emit(name, DomainState::Halted);
        Ok(())
    }

    async fn set_memory(&self, name: &str, target: u64) -> HvResult<()> {
        self.record(format!("set_memory {name} {target}"))?;
        let delta = self.with_domain(name, |dom| {
            let old = dom.memory_actual;
            dom.memory_actual = target;
            Ok(old as i64 - target as i64)
        })?;
        // released memory shows up as host free memory, and vice versa
        let mut free = self.free_memory.borrow_mut();
        *free = (*free as i64 + delta).max(0) as u64;
        Ok(())
    }

    async fn domain_state(&self, name: &str) -> HvResult<DomainState> {
        Ok(self
            .domains
            .borrow()
            .get(name)
            .map(|dom| dom.state)
            .unwrap_or(DomainState::Undefined))
    }

    async fn domain_xid(&self, name: &str) -> HvResult<i64> {
        self.with_domain(name, |dom| Ok(dom.xid))
    }

    async fn domain_list(&self) -> HvResult<Vec<DomainInfo>> {
        Ok(self
            .domains
            .borrow()
            .iter()
            .filter(|(_, dom)| dom.state != DomainState::Undefined)
            .map(|(name, dom)| DomainInfo {
                name: name.clone(),
                xid: dom.xid,
                memory_actual: dom.memory_actual,
            })
            .collect())
    }

    async fn attach_network(&self, name: &str, netvm: &str) -> HvResult<()> {
        self.record(format!("attach_network {name} {netvm}"))?;
        Ok(())
    }

    async fn detach_network(&self, name: &str) -> HvResult<()> {
        self.record(format!("detach_network {name}"))?;
        Ok(())
    }

    async fn reconnect(&self) -> HvResult<()> {
        info!("offline hypervisor reconnect (no-op)");
        Ok(())
    }

    fn lifecycle_events(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_senders.borrow_mut().push(tx);
        rx
    }
}

/// Shared handle type used throughout the daemon.
pub type HypervisorRef = Rc<dyn Hypervisor>;
