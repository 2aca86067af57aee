//! `proxmox-time::epoch_i64` is unavailable on this build's registry mirror;
//! this reimplements it identically (seconds since the Unix epoch).

use std::time::{SystemTime, UNIX_EPOCH};

pub fn epoch_i64() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
