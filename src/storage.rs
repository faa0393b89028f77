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

//! Storage pool adapter.
//!
//! Block-device provisioning lives outside this daemon. The trait below is
//! the complete surface the daemon relies on; drivers implement it per pool.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::rc::Rc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no such volume: {0}")]
    NoSuchVolume(String),
    #[error("pool is out of space")]
    OutOfSpace,
    #[error("storage: {0}")]
    Failed(String),
}

/// Per-volume configuration, owned by the qube and persisted with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeConfig {
    pub name: String,
    pub pool: String,
    #[serde(default)]
    pub size: u64,
    /// Volume is reset to a snapshot of its source at every start
    #[serde(default)]
    pub snap_on_start: bool,
    /// Changes are committed back on shutdown
    #[serde(default)]
    pub save_on_stop: bool,
    /// Writable by the qube
    #[serde(default)]
    pub rw: bool,
    /// Source volume, `<vm>:<volume>`, for snapshot volumes
    #[serde(default)]
    pub source: Option<String>,
}

/// Point-in-time information about a provisioned volume.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub config: VolumeConfig,
    pub usage: u64,
}

/// A storage pool driver instance.
#[async_trait(?Send)]
pub trait Pool {
    fn name(&self) -> &str;
    fn driver(&self) -> &str;
    /// Driver configuration, as `key=value` pairs for `admin.pool.Info`.
    fn config(&self) -> Vec<(String, String)>;

    async fn create(&self, vm: &str, config: &VolumeConfig) -> StorageResult<()>;
    async fn remove(&self, vm: &str, volume: &str) -> StorageResult<()>;
    async fn clone_volume(&self, src_vm: &str, dst_vm: &str, volume: &str) -> StorageResult<()>;
    async fn resize(&self, vm: &str, volume: &str, size: u64) -> StorageResult<()>;
    async fn info(&self, vm: &str, volume: &str) -> StorageResult<VolumeInfo>;

    /// Expose the volume data at a local path for reading.
    async fn export(&self, vm: &str, volume: &str) -> StorageResult<PathBuf>;
    async fn export_end(&self, vm: &str, volume: &str) -> StorageResult<()>;

    /// First import phase: provide a path the writer streams data into.
    async fn import_begin(&self, vm: &str, volume: &str) -> StorageResult<PathBuf>;
    /// Second import phase: commit or discard the streamed data.
    async fn import_end(&self, vm: &str, volume: &str, success: bool) -> StorageResult<()>;

    async fn list_revisions(&self, vm: &str, volume: &str) -> StorageResult<Vec<String>>;
    async fn revert(&self, vm: &str, volume: &str, revision: &str) -> StorageResult<()>;

    /// Check the volume exists and is consistent; called before start.
    async fn verify(&self, vm: &str, volume: &str) -> StorageResult<()>;
}

pub type PoolRef = Rc<dyn Pool>;

#[derive(Debug, Default)]
struct MemoryVolume {
    config: Option<VolumeConfig>,
    usage: u64,
    revisions: Vec<String>,
    importing: bool,
}

/// Pool backed by nothing, used by the test suite and offline runs.
pub struct MemoryPool {
    name: String,
    volumes: RefCell<HashMap<(String, String), MemoryVolume>>,
    revision_counter: RefCell<u64>,
}

impl MemoryPool {
    pub fn new(name: &str) -> Self {
        MemoryPool {
            name: name.to_owned(),
            volumes: RefCell::new(HashMap::new()),
            revision_counter: RefCell::new(0),
        }
    }

    fn key(vm: &str, volume: &str) -> (String, String) {
        (vm.to_owned(), volume.to_owned())
    }
}

#[async_trait(?Send)]
impl Pool for MemoryPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &str {
        "memory"
    }

    fn config(&self) -> Vec<(String, String)> {
        vec![
            ("name".to_owned(), self.name.clone()),
            ("driver".to_owned(), "memory".to_owned()),
        ]
    }

    async fn create(&self, vm: &str, config: &VolumeConfig) -> StorageResult<()> {
        let mut volumes = self.volumes.borrow_mut();
        let entry = volumes.entry(Self::key(vm, &config.name)).or_default();
        entry.config = Some(config.clone());
        Ok(())
    }

    async fn remove(&self, vm: &str, volume: &str) -> StorageResult<()> {
        self.volumes.borrow_mut().remove(&Self::key(vm, volume));
        Ok(())
    }

    async fn clone_volume(&self, src_vm: &str, dst_vm: &str, volume: &str) -> StorageResult<()> {
        let mut volumes = self.volumes.borrow_mut();
        let src = volumes
            .get(&Self::key(src_vm, volume))
            .and_then(|v| v.config.clone())
            .ok_or_else(|| StorageError::NoSuchVolume(format!("{src_vm}:{volume}")))?;
        let entry = volumes.entry(Self::key(dst_vm, volume)).or_default();
        entry.config = Some(src);
        Ok(())
    }

    async fn resize(&self, vm: &str, volume: &str, size: u64) -> StorageResult<()> {
        let mut volumes = self.volumes.borrow_mut();
        let entry = volumes
            .get_mut(&Self::key(vm, volume))
            .ok_or_else(|| StorageError::NoSuchVolume(format!("{vm}:{volume}")))?;
        if let Some(config) = entry.config.as_mut() {
            if size < config.size {
                return Err(StorageError::Failed(
                    "shrinking volumes is not supported".to_owned(),
                ));
            }
            config.size = size;
        }
        Ok(())
    }

    async fn info(&self, vm: &str, volume: &str) -> StorageResult<VolumeInfo> {
        let volumes = self.volumes.borrow();
        let entry = volumes
            .get(&Self::key(vm, volume))
            .ok_or_else(|| StorageError::NoSuchVolume(format!("{vm}:{volume}")))?;
        Ok(VolumeInfo {
            config: entry
                .config
                .clone()
                .ok_or_else(|| StorageError::NoSuchVolume(format!("{vm}:{volume}")))?,
            usage: entry.usage,
        })
    }

    async fn export(&self, vm: &str, volume: &str) -> StorageResult<PathBuf> {
        self.info(vm, volume).await?;
        Ok(PathBuf::from(format!("/dev/null#{vm}:{volume}")))
    }

    async fn export_end(&self, _vm: &str, _volume: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn import_begin(&self, vm: &str, volume: &str) -> StorageResult<PathBuf> {
        let mut volumes = self.volumes.borrow_mut();
        let entry = volumes
            .get_mut(&Self::key(vm, volume))
            .ok_or_else(|| StorageError::NoSuchVolume(format!("{vm}:{volume}")))?;
        entry.importing = true;
        Ok(PathBuf::from(format!("/dev/null#{vm}:{volume}")))
    }

    async fn import_end(&self, vm: &str, volume: &str, success: bool) -> StorageResult<()> {
        let mut volumes = self.volumes.borrow_mut();
        let entry = volumes
            .get_mut(&Self::key(vm, volume))
            .ok_or_else(|| StorageError::NoSuchVolume(format!("{vm}:{volume}")))?;
        if !entry.importing {
            return Err(StorageError::Failed("no import in progress".to_owned()));
        }
        entry.importing = false;
        if success {
            let mut counter = self.revision_counter.borrow_mut();
            *counter += 1;
            entry.revisions.push(format!("rev-{}", *counter));
        }
        Ok(())
    }

    async fn list_revisions(&self, vm: &str, volume: &str) -> StorageResult<Vec<String>> {
        let volumes = self.volumes.borrow();
        let entry = volumes
            .get(&Self::key(vm, volume))
            .ok_or_else(|| StorageError::NoSuchVolume(format!("{vm}:{volume}")))?;
        Ok(entry.revisions.clone())
    }

    async fn revert(&self, vm: &str, volume: &str, revision: &str) -> StorageResult<()> {
        let volumes = self.volumes.borrow();
        let entry = volumes
            .get(&Self::key(vm, volume))
            .ok_or_else(|| StorageError::NoSuchVolume(format!("{vm}:{volume}")))?;
        if entry.revisions.iter().any(|r| r == revision) {
            Ok(())
        } else {
            Err(StorageError::NoSuchVolume(format!(
                "{vm}:{volume}@{revision}"
            )))
        }
    }

    async fn verify(&self, vm: &str, volume: &str) -> StorageResult<()> {
        self.info(vm, volume).await.map(|_| ())
    }
}

/// Known pool drivers. Real block-device drivers live outside this crate and
/// are registered by the packaging; the built-in `memory` driver backs tests
/// and offline runs.
pub fn drivers() -> &'static [&'static str] {
    &["memory"]
}

/// Reconstruct a pool from its persisted configuration.
pub fn pool_from_config(
    driver: &str,
    name: &str,
    _config: &[(String, String)],
) -> StorageResult<PoolRef> {
    match driver {
        "memory" => Ok(Rc::new(MemoryPool::new(name))),
        other => Err(StorageError::Failed(format!("unknown pool driver: {other:?}"))),
    }
}

/// Default volume shapes per qube class, keyed by volume name.
pub fn default_volume_config(
    class: crate::commons::VmClass,
    pool: &str,
    template: Option<&str>,
) -> BTreeMap<String, VolumeConfig> {
    use crate::commons::VmClass;

    let mut volumes = BTreeMap::new();
    let root_source = template.map(|t| format!("{t}:root"));
    match class {
        VmClass::AdminVM => {}
        VmClass::TemplateVM | VmClass::StandaloneVM => {
            volumes.insert(
                "root".to_owned(),
                VolumeConfig {
                    name: "root".to_owned(),
                    pool: pool.to_owned(),
                    size: 10 * 1024 * 1024 * 1024,
                    snap_on_start: false,
                    save_on_stop: true,
                    rw: true,
                    source: None,
                },
            );
        }
        VmClass::AppVM | VmClass::DispVM | VmClass::NetVM => {
            volumes.insert(
                "root".to_owned(),
                VolumeConfig {
                    name: "root".to_owned(),
                    pool: pool.to_owned(),
                    size: 10 * 1024 * 1024 * 1024,
                    snap_on_start: true,
                    save_on_stop: false,
                    rw: false,
                    source: root_source,
                },
            );
        }
    }
    if class != VmClass::AdminVM {
        let private_save = class != VmClass::DispVM;
        volumes.insert(
            "private".to_owned(),
            VolumeConfig {
                name: "private".to_owned(),
                pool: pool.to_owned(),
                size: 2 * 1024 * 1024 * 1024,
                snap_on_start: class == VmClass::DispVM,
                save_on_stop: private_save,
                rw: true,
                source: if class == VmClass::DispVM {
                    template.map(|t| format!("{t}:private"))
                } else {
                    None
                },
            },
        );
        volumes.insert(
            "volatile".to_owned(),
            VolumeConfig {
                name: "volatile".to_owned(),
                pool: pool.to_owned(),
                size: 12 * 1024 * 1024 * 1024,
                snap_on_start: false,
                save_on_stop: false,
                rw: true,
                source: None,
            },
        );
    }
    volumes
}
