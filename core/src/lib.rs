pub mod config;
pub mod error;
pub mod identity;
pub mod item;
pub mod monitor;
pub mod retention;
pub mod store;
pub mod view;

pub use config::Config;
pub use error::EngineError;
pub use item::{Chip, ClipItem, ClipKind, HistoryFilter, UNGROUPED};
pub use monitor::{
    CaptureMonitor, CaptureSnapshot, ClipboardHandle, EngineEvent, MonitorHandle, MonitorSettings,
    SystemClipboard,
};
pub use retention::{RetentionWindow, clear_expired};
pub use store::{ExportReport, HistoryStore, ImportReport};
pub use view::{ChangeReason, HistoryView, ViewSnapshot};

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
