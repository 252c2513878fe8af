//! Per-channel and per-device I/O statistics, plus the optional NVMe
//! error counter table.

use merge::Merge;
use serde::Serialize;

use super::io::IoType;

/// How much of a statistics block to clear on a reset request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatReset {
    None,
    MaxMin,
    All,
}

/// Structure representing bdev I/O stats. Latency minimums start at
/// `u64::MAX` so the merge keeps real observations.
#[derive(Debug, Clone, Copy, Merge, Serialize)]
pub struct BdevIoStats {
    #[merge(strategy = merge::num::saturating_add)]
    pub num_read_ops: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub num_write_ops: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub num_unmap_ops: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub num_copy_ops: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub bytes_read: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub bytes_written: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub bytes_unmapped: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub bytes_copied: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub read_latency_ticks: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub write_latency_ticks: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub unmap_latency_ticks: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub copy_latency_ticks: u64,
    #[merge(strategy = merge::ord::max)]
    pub max_read_latency_ticks: u64,
    #[merge(strategy = merge::ord::min)]
    pub min_read_latency_ticks: u64,
    #[merge(strategy = merge::ord::max)]
    pub max_write_latency_ticks: u64,
    #[merge(strategy = merge::ord::min)]
    pub min_write_latency_ticks: u64,
    #[merge(strategy = merge::ord::max)]
    pub max_unmap_latency_ticks: u64,
    #[merge(strategy = merge::ord::min)]
    pub min_unmap_latency_ticks: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub tick_rate: u64,
}

impl Default for BdevIoStats {
    fn default() -> Self {
        Self {
            num_read_ops: 0,
            num_write_ops: 0,
            num_unmap_ops: 0,
            num_copy_ops: 0,
            bytes_read: 0,
            bytes_written: 0,
            bytes_unmapped: 0,
            bytes_copied: 0,
            read_latency_ticks: 0,
            write_latency_ticks: 0,
            unmap_latency_ticks: 0,
            copy_latency_ticks: 0,
            max_read_latency_ticks: 0,
            min_read_latency_ticks: u64::MAX,
            max_write_latency_ticks: 0,
            min_write_latency_ticks: u64::MAX,
            max_unmap_latency_ticks: 0,
            min_unmap_latency_ticks: u64::MAX,
            tick_rate: 0,
        }
    }
}

impl BdevIoStats {
    /// Account one successful completion.
    pub fn account(
        &mut self,
        io_type: IoType,
        bytes: u64,
        latency_ticks: u64,
        zcopy_populate: bool,
        zcopy_start: bool,
    ) {
        match io_type {
            IoType::Read => {
                self.bytes_read += bytes;
                self.num_read_ops += 1;
                self.read_latency_ticks += latency_ticks;
                self.max_read_latency_ticks =
                    self.max_read_latency_ticks.max(latency_ticks);
                self.min_read_latency_ticks =
                    self.min_read_latency_ticks.min(latency_ticks);
            }
            IoType::Write | IoType::ZoneAppend | IoType::CompareAndWrite => {
                self.bytes_written += bytes;
                self.num_write_ops += 1;
                self.write_latency_ticks += latency_ticks;
                self.max_write_latency_ticks =
                    self.max_write_latency_ticks.max(latency_ticks);
                self.min_write_latency_ticks =
                    self.min_write_latency_ticks.min(latency_ticks);
            }
            IoType::Unmap | IoType::WriteZeroes => {
                self.bytes_unmapped += bytes;
                self.num_unmap_ops += 1;
                self.unmap_latency_ticks += latency_ticks;
                self.max_unmap_latency_ticks =
                    self.max_unmap_latency_ticks.max(latency_ticks);
                self.min_unmap_latency_ticks =
                    self.min_unmap_latency_ticks.min(latency_ticks);
            }
            IoType::Zcopy => {
                // Track the data in the start phase only.
                if !zcopy_start {
                    return;
                }
                if zcopy_populate {
                    self.bytes_read += bytes;
                    self.num_read_ops += 1;
                } else {
                    self.bytes_written += bytes;
                    self.num_write_ops += 1;
                }
            }
            IoType::Copy => {
                self.bytes_copied += bytes;
                self.num_copy_ops += 1;
                self.copy_latency_ticks += latency_ticks;
            }
            _ => {}
        }
    }

    /// Apply a reset mode in place.
    pub fn reset(&mut self, mode: StatReset) {
        match mode {
            StatReset::None => {}
            StatReset::MaxMin => {
                self.max_read_latency_ticks = 0;
                self.min_read_latency_ticks = u64::MAX;
                self.max_write_latency_ticks = 0;
                self.min_write_latency_ticks = u64::MAX;
                self.max_unmap_latency_ticks = 0;
                self.min_unmap_latency_ticks = u64::MAX;
            }
            StatReset::All => {
                let rate = self.tick_rate;
                *self = Self::default();
                self.tick_rate = rate;
            }
        }
    }
}

/// Power-of-two latency histogram: bucket n counts completions whose
/// latency in ticks is in [2^n, 2^(n+1)).
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    pub buckets: [u64; 64],
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: [0; 64],
        }
    }
}

impl LatencyHistogram {
    pub fn record(&mut self, latency_ticks: u64) {
        let bucket = (64 - latency_ticks.leading_zeros() as usize)
            .saturating_sub(1)
            .min(63);
        self.buckets[bucket] += 1;
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

/// Error counters indexed by NVMe status code type and status code. Only
/// the four architected types are tracked per code.
#[derive(Debug, Clone)]
pub struct ErrorStat {
    pub status_type: [u64; 8],
    pub status: [[u64; 256]; 4],
}

impl Default for ErrorStat {
    fn default() -> Self {
        Self {
            status_type: [0; 8],
            status: [[0; 256]; 4],
        }
    }
}

impl ErrorStat {
    pub fn count(&mut self, sct: u8, sc: u8) {
        let t = (sct & 0x7) as usize;
        self.status_type[t] += 1;
        if t < 4 {
            self.status[t][sc as usize] += 1;
        }
    }
}
