// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsers for the OS introspection commands used by the memory and disk
//! probes.

use std::collections::BTreeMap;

use virt_agent_api_types::{DiskUsage, MemoryUsage};

/// Parses the first two lines of `free` output:
///
/// ```text
///                total        used        free      shared  buff/cache   available
/// Mem:        16318252     5216900     6429208      612636     4672144    10152236
/// ```
///
/// Every value is reported in KiB and suffixed accordingly.
pub(crate) fn parse_free(out: &str) -> Result<MemoryUsage, String> {
    let mut lines = out.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or("no output from free")?;
    let mem = lines
        .find(|l| l.trim_start().starts_with("Mem:"))
        .ok_or("free reported no `Mem:` line")?;

    let keys: Vec<&str> = header.split_whitespace().collect();
    let values: Vec<&str> = mem.split_whitespace().skip(1).collect();
    if keys.is_empty() || keys.len() != values.len() {
        return Err(format!(
            "free reported {} columns but {} values",
            keys.len(),
            values.len()
        ));
    }

    let mut usage = BTreeMap::new();
    for (key, value) in keys.into_iter().zip(values) {
        let kib: u64 = value.parse().map_err(|_| {
            format!("free reported non-numeric {key} {value:?}")
        })?;
        usage.insert(key.to_string(), format!("{kib}Ki"));
    }
    Ok(MemoryUsage(usage))
}

/// Finds the filesystem mounted at `mount_point` in `df -hP` output:
///
/// ```text
/// Filesystem      Size  Used Avail Use% Mounted on
/// /dev/nvme0n1p2  468G  221G  224G  50% /
/// ```
pub(crate) fn parse_df(
    out: &str,
    mount_point: &str,
) -> Result<DiskUsage, String> {
    for line in out.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        // The mount point is the remainder of the line and may contain
        // spaces.
        let mounted_on = fields[5..].join(" ");
        if mounted_on == mount_point {
            return Ok(DiskUsage {
                filesystem: fields[0].to_string(),
                size: fields[1].to_string(),
                used: fields[2].to_string(),
                available: fields[3].to_string(),
                use_percentage: fields[4].to_string(),
                mount_point: mounted_on,
            });
        }
    }
    Err(format!("no filesystem is mounted at {mount_point}"))
}
