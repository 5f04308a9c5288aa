use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::EngineError;
use crate::identity::content_tag;
use crate::item::{ClipItem, HistoryFilter, preview_bytes, text_projection};
use crate::store::HistoryStore;

const DEBOUNCE_MS: u64 = 250;
const EVENT_BUFFER: usize = 64;

/// Why the view state last changed; presentation uses this to decide
/// whether to reset scroll position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Reset,
    FilterChanged,
    PageAppended,
    Captured,
    ItemRemoved,
    ItemUpdated,
    Refreshed,
}

/// Read-only copy of the current view state handed to presentation.
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub items: Vec<ClipItem>,
    pub total_count: usize,
    pub filtered_count: usize,
    pub has_more: bool,
    pub is_loading: bool,
    pub filter: HistoryFilter,
    pub last_change_reason: ChangeReason,
}

struct ViewState {
    data_list: Vec<ClipItem>,
    total_count: usize,
    filtered_count: usize,
    has_more: bool,
    is_loading: bool,
    filter: HistoryFilter,
    last_change_reason: ChangeReason,
    // a finished load only lands if its generation is still current
    generation: u64,
    // separate epoch so debounced keystrokes do not race page loads
    query_epoch: u64,
}

struct ViewInner {
    store: Arc<HistoryStore>,
    page_size: usize,
    preview_length: usize,
    debounce: Duration,
    state: Mutex<ViewState>,
    events: broadcast::Sender<ChangeReason>,
}

/// Live, paginated, filtered projection of the store. All mutation goes
/// through these methods; store queries run on blocking threads so the
/// owning task never stalls on I/O.
#[derive(Clone)]
pub struct HistoryView {
    inner: Arc<ViewInner>,
}

impl HistoryView {
    pub fn new(store: Arc<HistoryStore>, page_size: usize, preview_length: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(ViewInner {
                store,
                page_size,
                preview_length,
                debounce: Duration::from_millis(DEBOUNCE_MS),
                state: Mutex::new(ViewState {
                    data_list: Vec::new(),
                    total_count: 0,
                    filtered_count: 0,
                    has_more: true,
                    is_loading: false,
                    filter: HistoryFilter::default(),
                    last_change_reason: ChangeReason::Reset,
                    generation: 0,
                    query_epoch: 0,
                }),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeReason> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        let state = self.inner.state.lock();
        ViewSnapshot {
            items: state.data_list.clone(),
            total_count: state.total_count,
            filtered_count: state.filtered_count,
            has_more: state.has_more,
            is_loading: state.is_loading,
            filter: state.filter.clone(),
            last_change_reason: state.last_change_reason,
        }
    }

    async fn run_store<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&HistoryStore) -> Result<T, EngineError> + Send + 'static,
    {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
    }

    /// Drop the active filter and materialize the first page.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.inner.state.lock().filter = HistoryFilter::default();
        self.reload(ChangeReason::Reset).await
    }

    /// Re-materialize page one under the current filter. Used after
    /// ambiguous store effects (import, migration, bulk delete).
    pub async fn refresh(&self) -> Result<(), EngineError> {
        self.reload(ChangeReason::Refreshed).await
    }

    /// Replace the whole facet filter and reload. No-op when unchanged.
    pub async fn set_filter(&self, filter: HistoryFilter) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock();
            if state.filter == filter {
                return Ok(());
            }
            state.filter = filter;
        }
        self.reload(ChangeReason::FilterChanged).await
    }

    /// Debounced free-text filter: rapid keystrokes coalesce into one
    /// query, and the last keystroke always wins.
    pub fn set_search_query(&self, query: String) {
        let epoch = {
            let mut state = self.inner.state.lock();
            state.query_epoch += 1;
            state.query_epoch
        };
        let view = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(view.inner.debounce).await;
            {
                let mut state = view.inner.state.lock();
                if state.query_epoch != epoch {
                    return; // superseded by a newer keystroke
                }
                let trimmed = query.trim();
                state.filter.query = (!trimmed.is_empty()).then(|| trimmed.to_string());
            }
            if let Err(e) = view.reload(ChangeReason::FilterChanged).await {
                warn!("search reload failed: {e}");
            }
        });
    }

    async fn reload(&self, reason: ChangeReason) -> Result<(), EngineError> {
        let (filter, generation) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.is_loading = true;
            (state.filter.clone(), state.generation)
        };

        let page_size = self.inner.page_size;
        let query_filter = filter.clone();
        let result = self
            .run_store(move |store| {
                let rows = store.search_after(&query_filter, None, page_size)?;
                let filtered = store.count(&query_filter)?;
                let total = store.total_count()?;
                Ok((rows, filtered, total))
            })
            .await;

        let mut state = self.inner.state.lock();
        state.is_loading = false;
        let (rows, filtered, total) = result?;
        if state.generation != generation {
            return Ok(()); // a newer load superseded this one
        }
        state.has_more = rows.len() == page_size && rows.len() < filtered;
        state.data_list = rows;
        state.filtered_count = filtered;
        state.total_count = total;
        state.last_change_reason = reason;
        drop(state);
        let _ = self.inner.events.send(reason);
        Ok(())
    }

    /// Append the next page under the active filter. Keyset paging on
    /// `(timestamp, id)` keeps the page duplicate-free even when writes
    /// shift ordering between loads. No-op while a load is in flight or
    /// the result set is exhausted.
    pub async fn load_next_page(&self) -> Result<(), EngineError> {
        let (filter, cursor, generation) = {
            let mut state = self.inner.state.lock();
            if state.is_loading || !state.has_more {
                return Ok(());
            }
            state.is_loading = true;
            let cursor = state
                .data_list
                .last()
                .map(|item| (item.timestamp, item.id.unwrap_or(0)));
            (state.filter.clone(), cursor, state.generation)
        };

        let page_size = self.inner.page_size;
        let query_filter = filter.clone();
        let result = self
            .run_store(move |store| {
                let rows = store.search_after(&query_filter, cursor, page_size)?;
                let filtered = store.count(&query_filter)?;
                let total = store.total_count()?;
                Ok((rows, filtered, total))
            })
            .await;

        let mut state = self.inner.state.lock();
        state.is_loading = false;
        let (rows, filtered, total) = result?;
        if state.generation != generation {
            return Ok(());
        }
        state.has_more = rows.len() == page_size;
        let known: HashSet<i64> = state.data_list.iter().filter_map(|item| item.id).collect();
        state.data_list.extend(
            rows.into_iter()
                .filter(|row| row.id.is_none_or(|id| !known.contains(&id))),
        );
        state.filtered_count = filtered;
        state.total_count = total;
        state.last_change_reason = ChangeReason::PageAppended;
        drop(state);
        let _ = self.inner.events.send(ChangeReason::PageAppended);
        Ok(())
    }

    /// Write-through for a fresh capture. When the effect on the current
    /// page is locally knowable the list is patched in place; otherwise
    /// (a replaced row outside the loaded window) page one reloads.
    pub fn apply_captured(&self, item: ClipItem, replaced: bool) {
        let ambiguous = {
            let mut state = self.inner.state.lock();
            let had = state
                .data_list
                .iter()
                .any(|it| it.unique_id == item.unique_id);
            if replaced && !had {
                true
            } else {
                if had {
                    state.data_list.retain(|it| it.unique_id != item.unique_id);
                    state.filtered_count = state.filtered_count.saturating_sub(1);
                }
                if !replaced {
                    state.total_count += 1;
                }
                if state.filter.matches(&item) {
                    state.data_list.insert(0, item);
                    state.filtered_count += 1;
                }
                state.last_change_reason = ChangeReason::Captured;
                false
            }
        };

        if ambiguous {
            let view = self.clone();
            tokio::spawn(async move {
                if let Err(e) = view.refresh().await {
                    warn!("post-capture refresh failed: {e}");
                }
            });
        } else {
            let _ = self.inner.events.send(ChangeReason::Captured);
        }
    }

    /// Optimistic removal: the row disappears immediately, the store delete
    /// runs behind it, and a failure reconciles the view from the store.
    /// When the visible window runs low the next page is prefetched.
    pub async fn delete(&self, id: i64) -> Result<(), EngineError> {
        let prefetch = {
            let mut state = self.inner.state.lock();
            let before = state.data_list.len();
            state.data_list.retain(|item| item.id != Some(id));
            if state.data_list.len() != before {
                state.filtered_count = state.filtered_count.saturating_sub(1);
            }
            state.total_count = state.total_count.saturating_sub(1);
            state.last_change_reason = ChangeReason::ItemRemoved;
            state.has_more && state.data_list.len() < self.inner.page_size / 2
        };
        let _ = self.inner.events.send(ChangeReason::ItemRemoved);

        if let Err(e) = self.run_store(move |store| store.delete_ids(&[id])).await {
            warn!("delete failed, reconciling view: {e}");
            self.refresh().await?;
            return Ok(());
        }

        if prefetch {
            self.load_next_page().await?;
        }
        Ok(())
    }

    /// Reassign an item's category in place; ordering is untouched, but a
    /// group-filtered view drops rows that no longer belong.
    pub async fn set_group(&self, id: i64, group: i64) -> Result<(), EngineError> {
        self.run_store(move |store| store.update_group(id, group))
            .await?;

        let mut state = self.inner.state.lock();
        if let Some(item) = state.data_list.iter_mut().find(|it| it.id == Some(id)) {
            item.group = group;
        }
        let filter = state.filter.clone();
        if filter.group.is_some() {
            let before = state.data_list.len();
            state.data_list.retain(|it| filter.matches(it));
            let dropped = before - state.data_list.len();
            state.filtered_count = state.filtered_count.saturating_sub(dropped);
        }
        state.last_change_reason = ChangeReason::ItemUpdated;
        drop(state);
        let _ = self.inner.events.send(ChangeReason::ItemUpdated);
        Ok(())
    }

    /// Replace a text item's content. The store refreshes its timestamp, so
    /// the edited row resurfaces at the top of the reloaded page.
    pub async fn edit_content(&self, id: i64, text: String) -> Result<(), EngineError> {
        let preview_length = self.inner.preview_length;
        self.run_store(move |store| {
            let item = store
                .get(id)?
                .ok_or_else(|| EngineError::InvalidData(format!("no item {id}")))?;
            if !item.kind.is_editable() {
                return Err(EngineError::InvalidData(format!(
                    "{} items are not editable",
                    item.kind.as_str()
                )));
            }
            let (search_text, length) = text_projection(&text);
            let show_data = preview_bytes(&text, preview_length);
            let tag = content_tag(item.kind, text.as_bytes());
            store.update_content(
                id,
                text.as_bytes(),
                show_data.as_deref(),
                &search_text,
                length,
                &tag,
            )
        })
        .await?;
        self.reload(ChangeReason::ItemUpdated).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ClipKind, UNGROUPED};

    fn text_item(unique_id: &str, text: &str, timestamp: i64) -> ClipItem {
        let (search_text, length) = text_projection(text);
        ClipItem {
            id: None,
            unique_id: unique_id.to_string(),
            kind: ClipKind::Text,
            data: text.as_bytes().to_vec(),
            show_data: None,
            timestamp,
            app_path: String::new(),
            app_name: "Notes".to_string(),
            search_text,
            length,
            group: UNGROUPED,
            tag: Some(content_tag(ClipKind::Text, text.as_bytes())),
        }
    }

    fn seeded_view(n: usize, page_size: usize) -> (HistoryView, Arc<HistoryStore>) {
        let store = Arc::new(HistoryStore::open_in_memory().unwrap());
        for i in 0..n {
            store
                .insert(&text_item(&format!("u{i}"), &format!("item number {i}"), 100 + i as i64))
                .unwrap();
        }
        (HistoryView::new(store.clone(), page_size, 100), store)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn pagination_reaches_filtered_count_without_duplicates() {
        let (view, _store) = seeded_view(10, 4);
        view.reset().await.unwrap();

        let mut guard = 0;
        loop {
            let snap = view.snapshot();
            if !snap.has_more {
                break;
            }
            view.load_next_page().await.unwrap();
            guard += 1;
            assert!(guard < 10, "pagination failed to terminate");
        }

        let snap = view.snapshot();
        assert_eq!(snap.items.len(), 10);
        assert_eq!(snap.filtered_count, 10);
        assert_eq!(snap.total_count, 10);
        assert!(!snap.is_loading);

        let ids: Vec<i64> = snap.items.iter().map(|i| i.id.unwrap()).collect();
        let unique: HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        for pair in snap.items.windows(2) {
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn concurrent_insert_does_not_duplicate_page_rows() {
        let (view, store) = seeded_view(10, 4);
        view.reset().await.unwrap();

        // a write lands between page loads and shifts every offset
        store.insert(&text_item("fresh", "fresh content", 900)).unwrap();

        view.load_next_page().await.unwrap();
        view.load_next_page().await.unwrap();

        let snap = view.snapshot();
        let ids: Vec<i64> = snap.items.iter().map(|i| i.id.unwrap()).collect();
        let unique: HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        // the old rows are all present exactly once
        assert!(snap.items.iter().filter(|i| i.unique_id != "fresh").count() >= 10);
    }

    #[tokio::test]
    async fn filter_change_resets_page_and_counts() {
        let (view, store) = seeded_view(6, 10);
        store.insert(&text_item("special", "needle in haystack", 500)).unwrap();
        view.reset().await.unwrap();
        assert_eq!(view.snapshot().items.len(), 7);

        view.set_filter(HistoryFilter {
            query: Some("needle".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        let snap = view.snapshot();
        assert_eq!(snap.items.len(), 1);
        assert_eq!(snap.filtered_count, 1);
        assert_eq!(snap.total_count, 7);
        assert_eq!(snap.last_change_reason, ChangeReason::FilterChanged);
    }

    #[tokio::test]
    async fn debounced_search_applies_last_keystroke() {
        let (view, _store) = seeded_view(6, 10);
        view.reset().await.unwrap();

        view.set_search_query("item numb".to_string());
        view.set_search_query("item number 3".to_string());

        wait_until(|| view.snapshot().filter.query.as_deref() == Some("item number 3")).await;
        wait_until(|| view.snapshot().items.len() == 1).await;
        assert_eq!(view.snapshot().items[0].unique_id, "u3");
    }

    #[tokio::test]
    async fn optimistic_delete_prefetches_when_window_runs_low() {
        let (view, store) = seeded_view(10, 4);
        view.reset().await.unwrap();

        let snap = view.snapshot();
        assert_eq!(snap.items.len(), 4);

        for item in snap.items.iter().take(3) {
            view.delete(item.id.unwrap()).await.unwrap();
        }

        let snap = view.snapshot();
        assert_eq!(snap.total_count, 7);
        assert_eq!(store.total_count().unwrap(), 7);
        // low-water prefetch kept the visible window populated
        assert!(snap.items.len() >= 2);
    }

    #[tokio::test]
    async fn captures_prepend_when_they_match_the_filter() {
        let (view, _store) = seeded_view(3, 10);
        view.reset().await.unwrap();

        let mut fresh = text_item("new-top", "brand new", 999);
        fresh.id = Some(42);
        view.apply_captured(fresh, false);

        let snap = view.snapshot();
        assert_eq!(snap.items[0].unique_id, "new-top");
        assert_eq!(snap.total_count, 4);
        assert_eq!(snap.filtered_count, 4);

        // replace of a row already on the page keeps exactly one copy on top
        let mut again = text_item("new-top", "brand new", 1_050);
        again.id = Some(42);
        view.apply_captured(again, true);
        let snap = view.snapshot();
        assert_eq!(snap.items.iter().filter(|i| i.unique_id == "new-top").count(), 1);
        assert_eq!(snap.items[0].timestamp, 1_050);
        assert_eq!(snap.total_count, 4);
    }

    #[tokio::test]
    async fn non_matching_capture_only_bumps_total() {
        let (view, _store) = seeded_view(3, 10);
        view.reset().await.unwrap();
        view.set_filter(HistoryFilter {
            query: Some("number".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        let mut off_topic = text_item("odd", "completely different", 999);
        off_topic.id = Some(77);
        view.apply_captured(off_topic, false);

        let snap = view.snapshot();
        assert_eq!(snap.total_count, 4);
        assert_eq!(snap.filtered_count, 3);
        assert!(!snap.items.iter().any(|i| i.unique_id == "odd"));
    }

    #[tokio::test]
    async fn ambiguous_replace_reconciles_from_store() {
        let (view, store) = seeded_view(10, 4);
        view.reset().await.unwrap();

        // the replaced row lives beyond the loaded window
        let (id, replaced) = store.insert(&text_item("u1", "item number 1", 901)).unwrap();
        assert!(replaced);
        let mut item = text_item("u1", "item number 1", 901);
        item.id = Some(id);
        view.apply_captured(item, true);

        wait_until(|| view.snapshot().last_change_reason == ChangeReason::Refreshed).await;
        let snap = view.snapshot();
        assert_eq!(snap.total_count, 10);
        assert_eq!(snap.items[0].unique_id, "u1");
    }

    #[tokio::test]
    async fn edit_resurfaces_item_at_the_top() {
        let (view, _store) = seeded_view(5, 10);
        view.reset().await.unwrap();

        let bottom = view.snapshot().items.last().unwrap().clone();
        view.edit_content(bottom.id.unwrap(), "rewritten".to_string())
            .await
            .unwrap();

        let snap = view.snapshot();
        assert_eq!(snap.items[0].id, bottom.id);
        assert_eq!(snap.items[0].data, b"rewritten");
        assert_eq!(snap.last_change_reason, ChangeReason::ItemUpdated);
    }

    #[tokio::test]
    async fn regroup_drops_rows_from_group_filtered_views() {
        let (view, store) = seeded_view(4, 10);
        let chip = store.create_chip("Work", "#123456").unwrap();
        let rows = store.search(&Default::default(), 10, 0).unwrap();
        let grouped_id = rows[0].id.unwrap();
        let other_id = rows[1].id.unwrap();
        store.update_group(grouped_id, chip.id).unwrap();

        view.set_filter(HistoryFilter {
            group: Some(chip.id),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(view.snapshot().items.len(), 1);

        // pulling a row into the group while viewing it: surgical update
        view.set_group(other_id, chip.id).await.unwrap();
        // the other row was not on the page, so only membership of loaded
        // rows is patched; the grouped row remains
        assert!(view.snapshot().items.iter().all(|i| i.group == chip.id));

        // moving the visible row out drops it from the filtered page
        view.set_group(grouped_id, UNGROUPED).await.unwrap();
        assert!(!view
            .snapshot()
            .items
            .iter()
            .any(|i| i.id == Some(grouped_id)));
    }
}
