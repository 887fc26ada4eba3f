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
use std::path::{Path, PathBuf};

use crate::exec::error::{SortError, SortResult};

/// Owner of the temporary spill directory.
///
/// The directory is shared scratch space across many operators and may be
/// removed externally at any point before first use, so existence is
/// re-ensured lazily before every file creation instead of once at startup.
#[derive(Debug)]
pub struct DirManager {
    dir: PathBuf,
}

impl DirManager {
    pub fn new(dir: PathBuf) -> SortResult<Self> {
        if dir.as_os_str().is_empty() {
            return Err(SortError::internal("spill temp_storage_path is empty"));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if absent. Called before every spill-file
    /// creation so an externally removed directory is recreated on demand.
    pub fn ensure(&self) -> SortResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            SortError::io(
                format!("create spill directory {} failed", self.dir.display()),
                e,
            )
        })
    }
}
