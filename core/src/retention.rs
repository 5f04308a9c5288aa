use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::store::HistoryStore;

const DAY_SECS: i64 = 86_400;

/// Age threshold beyond which uncategorized items are evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "count", rename_all = "lowercase")]
pub enum RetentionWindow {
    Days(u32),
    Weeks(u32),
    Months(u32),
    Year,
    Forever,
}

impl RetentionWindow {
    /// Oldest allowed timestamp, or `None` when nothing expires.
    pub fn cutoff(&self, now: i64) -> Option<i64> {
        let days = match self {
            RetentionWindow::Days(n) => i64::from(*n),
            RetentionWindow::Weeks(n) => i64::from(*n) * 7,
            RetentionWindow::Months(n) => i64::from(*n) * 30,
            RetentionWindow::Year => 365,
            RetentionWindow::Forever => return None,
        };
        Some(now - days * DAY_SECS)
    }
}

/// Evict rows older than the window, leaving categorized items alone:
/// a non-default group marks intentional retention. Idempotent, safe to
/// call redundantly.
pub fn clear_expired(
    store: &HistoryStore,
    window: RetentionWindow,
    now: i64,
) -> Result<usize, EngineError> {
    let Some(cutoff) = window.cutoff(now) else {
        return Ok(0);
    };
    store.delete_expired(cutoff)
}
