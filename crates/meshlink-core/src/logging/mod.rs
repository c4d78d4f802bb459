//! Per-device JSONL field logs
//!
//! After an incident, logs from several handsets are gathered and merged
//! into one timeline. Each device appends to its own file so nothing ever
//! interleaves mid-line.
//!
//! ```text
//! logs/
//! ├── 2026-10-18_node-a.jsonl
//! ├── 2026-10-18_node-b.jsonl
//! └── 2026-10-18_node-c.jsonl
//! ```
//!
//! ```bash
//! # every dropped loop across the mesh, in order
//! cat logs/*.jsonl | jq -s 'sort_by(.ts) | .[] | select(.msg | test("looped"))'
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::LogEntry;
pub use layer::JsonlLayer;
pub use writer::{read_entries, DeviceLogWriter};

use tracing_subscriber::EnvFilter;

/// Filter for a `-v` count, unless `RUST_LOG` says otherwise
///
/// 0 → warn, 1 → info, 2 → debug, 3+ → trace for the mesh crates.
pub fn filter_for_verbosity(verbose: u8) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::new(format!("warn,meshlink={level},meshlink_core={level}"))
}
