/*
 * Copyright (C) 2024 The Nanochaos Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Clock skew state. The preloaded `clock_gettime` shim inside the target
//! container reads a per-PID offset file; the agent only maintains those
//! files. One file per PID: `<sec> <nsec> <clk_ids_mask>`.

use crate::nanochaos::util::error::with_context;
use crate::nanochaos::Config;

use std::error::Error;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

type DynError = Box<dyn Error + Send + Sync>;

fn offset_path(pid: u32) -> PathBuf {
    Config::TimeOffsets.get_path().join(pid.to_string())
}

/// Installs (or replaces) the skew for a PID.
pub fn set_time_offset(pid: u32, sec: i64, nsec: i64, clk_ids_mask: u64) -> Result<(), DynError> {
    let dir = Config::TimeOffsets.ensure()?;
    let path = dir.join(pid.to_string());
    fs::write(&path, format!("{} {} {}\n", sec, nsec, clk_ids_mask))
        .map_err(|e| with_context(e, format!("Failed to write time offset '{}'", path.display())))
}

/// Removes the skew; recovering an unskewed PID is a no-op.
pub fn recover_time_offset(pid: u32) -> Result<(), DynError> {
    let path = offset_path(pid);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(with_context(
            err,
            format!("Failed to remove time offset '{}'", path.display()),
        )),
    }
}

/// Reads the installed skew, if any.
pub fn read_time_offset(pid: u32) -> Result<Option<(i64, i64, u64)>, DynError> {
    let path = offset_path(pid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(with_context(
                err,
                format!("Failed to read time offset '{}'", path.display()),
            ))
        }
    };

    let mut parts = raw.split_whitespace();
    let sec = parts.next().and_then(|part| part.parse().ok());
    let nsec = parts.next().and_then(|part| part.parse().ok());
    let mask = parts.next().and_then(|part| part.parse().ok());
    match (sec, nsec, mask) {
        (Some(sec), Some(nsec), Some(mask)) => Ok(Some((sec, nsec, mask))),
        _ => Err(crate::nanochaos::util::error::new_error(format!(
            "malformed time offset state in '{}'",
            path.display()
        ))),
    }
}
