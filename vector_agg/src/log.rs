//! Logging configuration.
/*
 * Copyright 2022-2025 Crown Copyright
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
use chrono::Local;
use env_logger::{Builder, Env};
use std::{io::Write, sync::Once};

/// Environment variable holding a filter that replaces [`DEFAULT_LOG_FILTER`].
pub const LOG_FILTER_ENV: &str = "VECTOR_AGG_LOG";

/// Aggregation progress at info, other crates at warn.
pub const DEFAULT_LOG_FILTER: &str = "warn,vector_agg=info";

static LOG_CFG: Once = Once::new();

fn builder() -> Builder {
    let mut builder = Builder::from_env(Env::new().filter_or(LOG_FILTER_ENV, DEFAULT_LOG_FILTER));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {}:{} - {}",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            record.level(),
            record.module_path().unwrap_or("??"),
            record.line().unwrap_or(0),
            record.args()
        )
    });
    builder
}

/// Install the crate's logger the first time it is called.
///
/// Later calls, including from other threads, do nothing. A logger
/// installed elsewhere first is left in place.
pub fn maybe_cfg_log() {
    LOG_CFG.call_once(|| {
        if builder().try_init().is_err() {
            log::debug!("Logger already installed, keeping it");
        }
    });
}
