//! Byte counters for up/download with rate windowing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Per-channel traffic counters.
pub struct Speed {
    upload: AtomicU64,
    download: AtomicU64,
    window: Mutex<Window>,
}

struct Window {
    at: Instant,
    upload: u64,
    download: u64,
}

/// A rate/total snapshot produced by [`Speed::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedInfo {
    /// Bytes per second uploaded since the previous snapshot.
    pub upload_rate: u64,
    /// Bytes per second downloaded since the previous snapshot.
    pub download_rate: u64,
    pub total_upload: u64,
    pub total_download: u64,
}

impl Speed {
    pub fn new() -> Self {
        Self {
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
            window: Mutex::new(Window {
                at: Instant::now(),
                upload: 0,
                download: 0,
            }),
        }
    }

    /// Account `n` bytes written to the wire.
    pub fn upload(&self, n: u64) {
        self.upload.fetch_add(n, Ordering::Relaxed);
    }

    /// Account `n` bytes received from the wire.
    pub fn download(&self, n: u64) {
        self.download.fetch_add(n, Ordering::Relaxed);
    }

    /// Rates since the previous snapshot plus lifetime totals. The window
    /// resets on every call.
    pub fn snapshot(&self) -> SpeedInfo {
        let total_upload = self.upload.load(Ordering::Relaxed);
        let total_download = self.download.load(Ordering::Relaxed);

        let mut window = self.window.lock().expect("speed window poisoned");
        let elapsed = window.at.elapsed().as_secs_f64().max(0.001);
        let info = SpeedInfo {
            upload_rate: ((total_upload - window.upload) as f64 / elapsed) as u64,
            download_rate: ((total_download - window.download) as f64 / elapsed) as u64,
            total_upload,
            total_download,
        };
        *window = Window {
            at: Instant::now(),
            upload: total_upload,
            download: total_download,
        };
        info
    }
}

impl Default for Speed {
    fn default() -> Self {
        Self::new()
    }
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

impl fmt::Display for SpeedInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "up {}/s ({}) down {}/s ({})",
            human_bytes(self.upload_rate),
            human_bytes(self.total_upload),
            human_bytes(self.download_rate),
            human_bytes(self.total_download),
        )
    }
}
