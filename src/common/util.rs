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

/// Human-readable byte count for log lines and tracker debug output.
pub fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = 1024 * 1024;
    const GB: i64 = 1024 * 1024 * 1024;
    if bytes <= 0 {
        return "0 Bytes".to_string();
    }
    if bytes < KB {
        return format!("{bytes} Bytes");
    }
    if bytes < MB {
        return format!("{:.2} KB", bytes as f64 / KB as f64);
    }
    if bytes < GB {
        return format!("{:.2} MB", bytes as f64 / MB as f64);
    }
    format!("{:.2} GB", bytes as f64 / GB as f64)
}
