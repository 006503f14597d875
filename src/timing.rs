use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp in microseconds since the epoch, matching the
/// resolution of the capture-side correlator input.
pub fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

pub fn duration_us(d: Duration) -> u64 {
    d.as_micros() as u64
}

/// One row of the client log, appended exactly once per attempted send.
/// Failed sends are still timed and recorded.
#[derive(Copy, Clone, Debug)]
pub struct PacketLogEntry {
    pub sequence: u32,
    pub send_time_us: u64,
    pub sendto_us: u64,
    pub transmitted: bool,
}

/// The client-side per-packet log for one iteration. Entries arrive in
/// strictly increasing sequence order with no gaps from 0; the offline
/// correlator joins on `packet` and has no tolerance for reordering.
#[derive(Default)]
pub struct PacketLog {
    entries: Vec<PacketLogEntry>,
}

impl PacketLog {
    pub fn with_capacity(n: usize) -> Self {
        PacketLog {
            entries: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, entry: PacketLogEntry) {
        debug_assert_eq!(entry.sequence as usize, self.entries.len());
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PacketLogEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Serialize as the CSV consumed by the offline correlator:
    /// `packet,time,sendto_us`, one row per sent packet.
    pub fn write_csv(&self, path: &Path) -> io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "packet,time,sendto_us")?;
        for e in &self.entries {
            writeln!(w, "{},{},{}", e.sequence, e.send_time_us, e.sendto_us)?;
        }
        w.flush()
    }
}

/// Aggregated send-call timing for one iteration, folded from the per-packet
/// measurements as they happen.
#[derive(Copy, Clone, Debug)]
pub struct SendStats {
    min_us: u64,
    max_us: u64,
    pub good: u64,
    pub fail: u64,
    pub bytes_sent: u64,
}

impl SendStats {
    pub fn new() -> Self {
        SendStats {
            min_us: u64::MAX,
            max_us: 0,
            good: 0,
            fail: 0,
            bytes_sent: 0,
        }
    }

    pub fn record(&mut self, sendto_us: u64, transmitted: bool, bytes: usize) {
        self.min_us = self.min_us.min(sendto_us);
        self.max_us = self.max_us.max(sendto_us);
        if transmitted {
            self.good += 1;
            self.bytes_sent += bytes as u64;
        } else {
            self.fail += 1;
        }
    }

    pub fn min_us(&self) -> u64 {
        if self.min_us == u64::MAX {
            0
        } else {
            self.min_us
        }
    }

    pub fn max_us(&self) -> u64 {
        self.max_us
    }

    pub fn attempts(&self) -> u64 {
        self.good + self.fail
    }

    /// Achieved bandwidth estimate over successfully transmitted bytes.
    pub fn bandwidth_bps(&self, duration: Duration) -> f64 {
        let secs = duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / secs
    }
}

impl Default for SendStats {
    fn default() -> Self {
        SendStats::new()
    }
}
