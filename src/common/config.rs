// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! TOML configuration for the sort and spill subsystem.
//!
//! Loaded once per process from `$SPILLSORT_CONFIG` or `./spillsort.toml`;
//! a missing file yields the defaults, since embedding engines often carry
//! their own configuration surface and only override a handful of knobs.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::exec::error::SortResult;
use crate::exec::sort::{SortContainerOptions, SortExpression};
use crate::exec::spill::ipc_serde::SpillCodec;
use crate::exec::spill::{ForceSpillPolicy, QuotaSpillPolicy, SpillIoExecutor, SpillPolicy};

static CONFIG: OnceLock<SpillsortConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static SpillsortConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = SpillsortConfig::load_from_file(path.as_ref())?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> &'static SpillsortConfig {
    CONFIG.get_or_init(|| {
        if let Some(path) = config_path_from_env_or_default() {
            match SpillsortConfig::load_from_file(&path) {
                Ok(cfg) => return cfg,
                Err(err) => {
                    eprintln!(
                        "failed to load config {}: {err:#}, using defaults",
                        path.display()
                    );
                }
            }
        }
        SpillsortConfig::default()
    })
}

fn config_path_from_env_or_default() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("SPILLSORT_CONFIG") {
        if !p.trim().is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    let candidate = PathBuf::from("spillsort.toml");
    if candidate.exists() {
        return Some(candidate);
    }
    None
}

/// What the container does when consumption still exceeds the quota after
/// spilling had its chance to relieve the pressure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum OomAction {
    #[default]
    Log,
    Cancel,
}

#[derive(Clone, Deserialize)]
pub struct SpillsortConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub sort: SortConfig,

    #[serde(default)]
    pub spill: SpillStorageConfig,
}

impl SpillsortConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: SpillsortConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| self.log_level.clone())
    }

    /// Derive per-container options from the configured knobs.
    pub fn container_options(
        &self,
        label: impl Into<String>,
        sort_exprs: Vec<SortExpression>,
    ) -> SortResult<SortContainerOptions> {
        Ok(SortContainerOptions {
            label: label.into(),
            sort_exprs,
            memory_quota_bytes: self.sort.memory_quota_bytes,
            oom_action: self.sort.oom_action,
            max_chunk_rows: self.sort.max_chunk_rows,
            max_resident_bytes: self.sort.max_resident_bytes,
            spill_dir: self.spill.temp_storage_path(),
            codec: SpillCodec::parse(&self.spill.ipc_compression)?,
        })
    }

    /// Spill trigger derived from the configured knobs.
    pub fn spill_policy(&self) -> Arc<dyn SpillPolicy> {
        if self.sort.force_spill_on_append {
            Arc::new(ForceSpillPolicy)
        } else {
            Arc::new(QuotaSpillPolicy::new(
                self.sort.memory_quota_bytes,
                self.sort.alarm_ratio,
            ))
        }
    }

    /// Build the shared spill I/O pool sized by the `[spill]` section.
    pub fn spill_io_pool(&self) -> Arc<SpillIoExecutor> {
        SpillIoExecutor::new(self.spill.io_threads, self.spill.io_queue_size)
    }
}

impl Default for SpillsortConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            sort: SortConfig::default(),
            spill: SpillStorageConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct SortConfig {
    /// Hard memory quota per container in bytes. 0 = unlimited.
    #[serde(default)]
    pub memory_quota_bytes: u64,
    /// Spill proactively once consumption crosses this fraction of the quota.
    #[serde(default = "default_alarm_ratio")]
    pub alarm_ratio: f64,
    #[serde(default)]
    pub oom_action: OomAction,
    #[serde(default = "default_max_chunk_rows")]
    pub max_chunk_rows: usize,
    /// Largest final run kept in memory at seal. 0 derives it from the quota.
    #[serde(default)]
    pub max_resident_bytes: u64,
    /// Test hook: spill after every append regardless of memory pressure.
    #[serde(default)]
    pub force_spill_on_append: bool,
}

fn default_alarm_ratio() -> f64 {
    0.8
}
fn default_max_chunk_rows() -> usize {
    4096
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            memory_quota_bytes: 0,
            alarm_ratio: default_alarm_ratio(),
            oom_action: OomAction::default(),
            max_chunk_rows: default_max_chunk_rows(),
            max_resident_bytes: 0,
            force_spill_on_append: false,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct SpillStorageConfig {
    /// Temporary storage directory for spill files. Empty = a directory
    /// under the system temp dir.
    #[serde(default)]
    pub temp_storage_path: String,
    #[serde(default = "default_ipc_compression")]
    pub ipc_compression: String,
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
    #[serde(default = "default_io_queue_size")]
    pub io_queue_size: usize,
}

fn default_ipc_compression() -> String {
    "lz4".to_string()
}
fn default_io_threads() -> usize {
    4
}
fn default_io_queue_size() -> usize {
    16
}

impl SpillStorageConfig {
    pub fn temp_storage_path(&self) -> PathBuf {
        let trimmed = self.temp_storage_path.trim();
        if trimmed.is_empty() {
            let mut dir = std::env::temp_dir();
            dir.push("spillsort-spill");
            dir
        } else {
            PathBuf::from(trimmed)
        }
    }
}

impl Default for SpillStorageConfig {
    fn default() -> Self {
        Self {
            temp_storage_path: String::new(),
            ipc_compression: default_ipc_compression(),
            io_threads: default_io_threads(),
            io_queue_size: default_io_queue_size(),
        }
    }
}
