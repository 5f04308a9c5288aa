use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arboard::ImageData;
use log::{debug, warn};
use lru::LruCache;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

use crate::config::Config;
use crate::identity;
use crate::item::{ClipItem, ClipKind, UNGROUPED, preview_bytes, text_projection};
use crate::now_epoch;
use crate::store::HistoryStore;

const RECENT_CACHE_SIZE: usize = 64;
const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 64;

/// One raw clipboard read: declared kind, payload bytes, best-effort source
/// app identity, and the OS transient/sensitive marker when available.
#[derive(Debug, Clone)]
pub struct CaptureSnapshot {
    pub kind: ClipKind,
    pub bytes: Vec<u8>,
    pub app_name: String,
    pub app_path: String,
    pub transient: bool,
}

/// Opaque OS clipboard capability. A successful `write` advances the change
/// counter by exactly one.
pub trait ClipboardHandle: Send {
    fn change_count(&mut self) -> u64;
    fn read_best(&mut self, preferred: &[ClipKind]) -> Result<Option<CaptureSnapshot>>;
    fn write(&mut self, kind: ClipKind, bytes: &[u8]) -> Result<()>;
}

/// arboard-backed clipboard. The platform exposes no change counter, so one
/// is derived from a content fingerprint.
pub struct SystemClipboard {
    inner: arboard::Clipboard,
    count: u64,
    fingerprint: Option<blake3::Hash>,
}

impl SystemClipboard {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: arboard::Clipboard::new().context("Failed to initialize clipboard")?,
            count: 0,
            fingerprint: None,
        })
    }

    fn current_fingerprint(&mut self) -> Option<blake3::Hash> {
        if let Ok(text) = self.inner.get_text() {
            Some(blake3::hash(text.as_bytes()))
        } else if let Ok(img) = self.inner.get_image() {
            Some(image_fingerprint(img.width, img.height, &img.bytes))
        } else {
            None
        }
    }
}

fn image_fingerprint(width: usize, height: usize, rgba: &[u8]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(width as u64).to_le_bytes());
    hasher.update(&(height as u64).to_le_bytes());
    hasher.update(rgba);
    hasher.finalize()
}

fn image_to_png(img: &ImageData) -> Result<Vec<u8>> {
    use image::{ImageBuffer, Rgba};

    let width = img.width as u32;
    let height = img.height as u32;

    let buffer = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(width, height, img.bytes.to_vec())
        .context("Failed to create image buffer")?;

    let mut png_data = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_data);
    image::ImageEncoder::write_image(
        encoder,
        &buffer,
        width,
        height,
        image::ExtendedColorType::Rgba8,
    )?;

    Ok(png_data)
}

impl ClipboardHandle for SystemClipboard {
    fn change_count(&mut self) -> u64 {
        let fingerprint = self.current_fingerprint();
        if fingerprint != self.fingerprint {
            self.fingerprint = fingerprint;
            self.count += 1;
        }
        self.count
    }

    fn read_best(&mut self, preferred: &[ClipKind]) -> Result<Option<CaptureSnapshot>> {
        for kind in preferred {
            match kind {
                ClipKind::Text => {
                    if let Ok(text) = self.inner.get_text() {
                        return Ok(Some(CaptureSnapshot {
                            kind: ClipKind::Text,
                            bytes: text.into_bytes(),
                            app_name: String::new(),
                            app_path: String::new(),
                            transient: false,
                        }));
                    }
                }
                ClipKind::Image => {
                    if let Ok(img) = self.inner.get_image() {
                        let bytes = image_to_png(&img)?;
                        return Ok(Some(CaptureSnapshot {
                            kind: ClipKind::Image,
                            bytes,
                            app_name: String::new(),
                            app_path: String::new(),
                            transient: false,
                        }));
                    }
                }
                // arboard exposes no richer representations
                _ => {}
            }
        }
        Ok(None)
    }

    fn write(&mut self, kind: ClipKind, bytes: &[u8]) -> Result<()> {
        match kind {
            ClipKind::Image => {
                let img = image::load_from_memory(bytes)?;
                let rgba = img.to_rgba8();
                let (width, height) = (rgba.width() as usize, rgba.height() as usize);
                let raw = rgba.into_raw();
                let fingerprint = image_fingerprint(width, height, &raw);
                self.inner.set_image(ImageData {
                    width,
                    height,
                    bytes: raw.into(),
                })?;
                self.fingerprint = Some(fingerprint);
            }
            _ => {
                let text =
                    std::str::from_utf8(bytes).context("clipboard text payload is not UTF-8")?;
                self.inner.set_text(text.to_string())?;
                self.fingerprint = Some(blake3::hash(bytes));
            }
        }
        self.count += 1;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub max_capture_size: usize,
    pub preview_length: usize,
    pub ignore_apps: Vec<String>,
    pub skip_transient: bool,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_capture_size: config.max_capture_size,
            preview_length: config.preview_length,
            ignore_apps: config.ignore_apps.clone(),
            skip_transient: config.skip_transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Idle,
    Polling,
    Paused { until: Option<Instant> },
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Captured { item: ClipItem, replaced: bool },
}

#[derive(Debug)]
enum MonitorCommand {
    Pause(Option<Duration>),
    Resume,
    Write { kind: ClipKind, bytes: Vec<u8> },
    Shutdown,
}

/// Cheap clonable front for a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<MonitorCommand>,
}

impl MonitorHandle {
    pub async fn pause(&self, duration: Option<Duration>) -> Result<()> {
        self.tx
            .send(MonitorCommand::Pause(duration))
            .await
            .context("monitor is gone")
    }

    pub async fn resume(&self) -> Result<()> {
        self.tx
            .send(MonitorCommand::Resume)
            .await
            .context("monitor is gone")
    }

    pub async fn write_clipboard(&self, kind: ClipKind, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(MonitorCommand::Write { kind, bytes })
            .await
            .context("monitor is gone")
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(MonitorCommand::Shutdown).await;
    }
}

/// Polls the clipboard capability and writes captures through to the store.
/// Failures inside a tick are logged and skipped, never fatal to the loop.
pub struct CaptureMonitor<C: ClipboardHandle> {
    store: Arc<HistoryStore>,
    clipboard: C,
    settings: MonitorSettings,
    state: MonitorState,
    baseline: u64,
    recent: LruCache<String, i64>,
    events: broadcast::Sender<EngineEvent>,
    commands: mpsc::Receiver<MonitorCommand>,
}

impl<C: ClipboardHandle> CaptureMonitor<C> {
    pub fn new(
        store: Arc<HistoryStore>,
        clipboard: C,
        settings: MonitorSettings,
    ) -> (Self, MonitorHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let monitor = Self {
            store,
            clipboard,
            settings,
            state: MonitorState::Idle,
            baseline: 0,
            recent: LruCache::new(NonZeroUsize::new(RECENT_CACHE_SIZE).unwrap()),
            events,
            commands: rx,
        };
        (monitor, MonitorHandle { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        self.start_listening();
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = interval.tick() => {
                    if let Err(e) = self.poll_clipboard().await {
                        warn!("poll error: {e:#}");
                    }
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(MonitorCommand::Pause(duration)) => self.pause(duration),
                        Some(MonitorCommand::Resume) => self.resume(),
                        Some(MonitorCommand::Write { kind, bytes }) => {
                            if let Err(e) = self.write_clipboard(kind, bytes) {
                                warn!("clipboard write error: {e:#}");
                            }
                        }
                        Some(MonitorCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        self.state = MonitorState::Idle;
        Ok(())
    }

    /// Baseline against the current clipboard so whatever already sits there
    /// is not captured as a fresh item. No-op while already polling.
    pub fn start_listening(&mut self) {
        if self.state == MonitorState::Polling {
            return;
        }
        self.baseline = self.clipboard.change_count();
        self.state = MonitorState::Polling;
    }

    /// Suspend capture, indefinitely unless a duration is given. Changes
    /// observed while paused still advance the baseline, so nothing copied
    /// during the pause is retroactively captured.
    pub fn pause(&mut self, duration: Option<Duration>) {
        let until = duration.map(|d| Instant::now() + d);
        self.state = MonitorState::Paused { until };
        debug!("capture paused ({duration:?})");
    }

    pub fn resume(&mut self) {
        self.baseline = self.clipboard.change_count();
        self.state = MonitorState::Polling;
    }

    /// Engine-initiated clipboard write (paste replay). The baseline is
    /// advanced to the expected post-write counter before the write lands,
    /// so the engine's own write never feeds back into history.
    pub fn write_clipboard(&mut self, kind: ClipKind, mut bytes: Vec<u8>) -> Result<()> {
        self.baseline = self.clipboard.change_count() + 1;
        let result = self.clipboard.write(kind, &bytes);
        if result.is_err() {
            self.baseline = self.clipboard.change_count();
        }
        bytes.zeroize();
        result
    }

    pub async fn poll_clipboard(&mut self) -> Result<()> {
        if let MonitorState::Paused { until } = self.state {
            match until {
                Some(deadline) if Instant::now() >= deadline => self.resume(),
                _ => {
                    self.baseline = self.clipboard.change_count();
                    return Ok(());
                }
            }
        }
        if self.state != MonitorState::Polling {
            return Ok(());
        }

        let count = self.clipboard.change_count();
        if count == self.baseline {
            return Ok(());
        }
        self.baseline = count;

        let snapshot = match self.clipboard.read_best(&ClipKind::CAPTURE_PRIORITY) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(()),
            Err(e) => {
                // skip the tick; the next one re-evaluates from current state
                warn!("clipboard extraction failed: {e:#}");
                return Ok(());
            }
        };

        self.capture_snapshot(snapshot, now_epoch()).await
    }

    async fn capture_snapshot(&mut self, snapshot: CaptureSnapshot, now: i64) -> Result<()> {
        if snapshot.transient && self.settings.skip_transient {
            debug!("skipping transient clipboard content");
            return Ok(());
        }
        if !snapshot.app_name.is_empty()
            && self
                .settings
                .ignore_apps
                .iter()
                .any(|app| snapshot.app_name.contains(app))
        {
            debug!("skipping capture from ignored app {}", snapshot.app_name);
            return Ok(());
        }
        if snapshot.bytes.is_empty() || snapshot.bytes.len() > self.settings.max_capture_size {
            return Ok(());
        }

        let Some(item) = self.build_item(snapshot, now) else {
            return Ok(());
        };

        if let Some(&id) = self.recent.get(&item.unique_id) {
            // same logical capture seen moments ago: resurface, skip the write
            let store = self.store.clone();
            match tokio::task::spawn_blocking(move || store.touch(id, now)).await {
                Ok(Ok(())) => {
                    let mut refreshed = item;
                    refreshed.id = Some(id);
                    let _ = self.events.send(EngineEvent::Captured {
                        item: refreshed,
                        replaced: true,
                    });
                }
                Ok(Err(e)) => warn!("history touch failed: {e}"),
                Err(e) => warn!("history touch task failed: {e}"),
            }
            return Ok(());
        }

        let store = self.store.clone();
        let for_store = item.clone();
        match tokio::task::spawn_blocking(move || store.insert(&for_store)).await {
            Ok(Ok((id, replaced))) => {
                self.recent.put(item.unique_id.clone(), id);
                let mut stored = item;
                stored.id = Some(id);
                let _ = self.events.send(EngineEvent::Captured {
                    item: stored,
                    replaced,
                });
            }
            Ok(Err(e)) => warn!("history insert failed: {e}"),
            Err(e) => warn!("history insert task failed: {e}"),
        }
        Ok(())
    }

    fn build_item(&self, snapshot: CaptureSnapshot, now: i64) -> Option<ClipItem> {
        let kind = if snapshot.kind == ClipKind::Text {
            classify_text(&String::from_utf8_lossy(&snapshot.bytes))
        } else {
            snapshot.kind
        };

        let (search_text, length, show_data) = if kind.is_text_like() {
            let text = String::from_utf8_lossy(&snapshot.bytes).into_owned();
            if text.trim().is_empty() {
                return None;
            }
            let (search_text, length) = text_projection(&text);
            let show_data = preview_bytes(&text, self.settings.preview_length);
            (search_text, length, show_data)
        } else {
            (String::new(), -1, None)
        };

        let unique_id = identity::unique_id(kind, &snapshot.bytes, &snapshot.app_path, now);
        let tag = identity::content_tag(kind, &snapshot.bytes);

        Some(ClipItem {
            id: None,
            unique_id,
            kind,
            data: snapshot.bytes,
            show_data,
            timestamp: now,
            app_path: snapshot.app_path,
            app_name: snapshot.app_name,
            search_text,
            length,
            group: UNGROUPED,
            tag: Some(tag),
        })
    }
}

fn classify_text(text: &str) -> ClipKind {
    let trimmed = text.trim();
    if (trimmed.starts_with("http://") || trimmed.starts_with("https://"))
        && !trimmed.contains(char::is_whitespace)
    {
        ClipKind::Link
    } else if is_color_literal(trimmed) {
        ClipKind::Color
    } else {
        ClipKind::Text
    }
}

fn is_color_literal(text: &str) -> bool {
    text.starts_with('#')
        && matches!(text.len(), 4 | 7 | 9)
        && text[1..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockState {
        count: u64,
        content: Option<(ClipKind, Vec<u8>)>,
        app_name: String,
        app_path: String,
        transient: bool,
        fail_reads: bool,
    }

    #[derive(Clone, Default)]
    struct MockClipboard {
        state: Arc<Mutex<MockState>>,
    }

    impl MockClipboard {
        fn put(&self, kind: ClipKind, bytes: &[u8]) {
            self.put_from(kind, bytes, "", "");
        }

        fn put_from(&self, kind: ClipKind, bytes: &[u8], app_name: &str, app_path: &str) {
            let mut state = self.state.lock();
            state.content = Some((kind, bytes.to_vec()));
            state.app_name = app_name.to_string();
            state.app_path = app_path.to_string();
            state.count += 1;
        }

        fn set_transient(&self, transient: bool) {
            self.state.lock().transient = transient;
        }

        fn set_fail_reads(&self, fail: bool) {
            self.state.lock().fail_reads = fail;
        }

        fn text(&self) -> Option<String> {
            self.state
                .lock()
                .content
                .as_ref()
                .map(|(_, bytes)| String::from_utf8(bytes.clone()).unwrap())
        }
    }

    impl ClipboardHandle for MockClipboard {
        fn change_count(&mut self) -> u64 {
            self.state.lock().count
        }

        fn read_best(&mut self, preferred: &[ClipKind]) -> Result<Option<CaptureSnapshot>> {
            let state = self.state.lock();
            if state.fail_reads {
                anyhow::bail!("scripted read failure");
            }
            Ok(state.content.as_ref().and_then(|(kind, bytes)| {
                preferred.contains(kind).then(|| CaptureSnapshot {
                    kind: *kind,
                    bytes: bytes.clone(),
                    app_name: state.app_name.clone(),
                    app_path: state.app_path.clone(),
                    transient: state.transient,
                })
            }))
        }

        fn write(&mut self, kind: ClipKind, bytes: &[u8]) -> Result<()> {
            let mut state = self.state.lock();
            state.content = Some((kind, bytes.to_vec()));
            state.count += 1;
            Ok(())
        }
    }

    fn test_monitor() -> (
        CaptureMonitor<MockClipboard>,
        MonitorHandle,
        MockClipboard,
        Arc<HistoryStore>,
    ) {
        let store = Arc::new(HistoryStore::open_in_memory().unwrap());
        let clipboard = MockClipboard::default();
        let settings = MonitorSettings {
            poll_interval: Duration::from_millis(10),
            max_capture_size: 1024 * 1024,
            preview_length: 100,
            ignore_apps: vec!["Vault".to_string()],
            skip_transient: true,
        };
        let (monitor, handle) = CaptureMonitor::new(store.clone(), clipboard.clone(), settings);
        (monitor, handle, clipboard, store)
    }

    fn snap(text: &str) -> CaptureSnapshot {
        CaptureSnapshot {
            kind: ClipKind::Text,
            bytes: text.as_bytes().to_vec(),
            app_name: String::new(),
            app_path: String::new(),
            transient: false,
        }
    }

    #[tokio::test]
    async fn captures_new_clipboard_content() {
        let (mut monitor, _handle, clipboard, store) = test_monitor();
        monitor.start_listening();

        clipboard.put(ClipKind::Text, b"hello world");
        monitor.poll_clipboard().await.unwrap();

        let rows = store.search(&Default::default(), 10, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, ClipKind::Text);
        assert_eq!(rows[0].search_text, "hello world");

        // counter unchanged: further polls are no-ops
        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn preexisting_content_is_not_captured_on_start() {
        let (mut monitor, _handle, clipboard, store) = test_monitor();
        clipboard.put(ClipKind::Text, b"stale");
        monitor.start_listening();

        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn pause_swallows_copies_until_resume() {
        let (mut monitor, _handle, clipboard, store) = test_monitor();
        monitor.start_listening();

        clipboard.put(ClipKind::Text, b"before");
        monitor.poll_clipboard().await.unwrap();

        monitor.pause(None);
        clipboard.put(ClipKind::Text, b"secret one");
        monitor.poll_clipboard().await.unwrap();
        clipboard.put(ClipKind::Text, b"secret two");
        monitor.poll_clipboard().await.unwrap();
        monitor.poll_clipboard().await.unwrap();

        monitor.resume();
        // resuming must not capture what is already on the clipboard
        monitor.poll_clipboard().await.unwrap();

        clipboard.put(ClipKind::Text, b"after");
        monitor.poll_clipboard().await.unwrap();

        let texts: Vec<String> = store
            .search(&Default::default(), 10, 0)
            .unwrap()
            .into_iter()
            .map(|r| r.search_text)
            .collect();
        assert!(texts.contains(&"before".to_string()));
        assert!(texts.contains(&"after".to_string()));
        assert!(!texts.iter().any(|t| t.starts_with("secret")));
    }

    #[tokio::test]
    async fn timed_pause_expires_on_its_own() {
        let (mut monitor, _handle, clipboard, store) = test_monitor();
        monitor.start_listening();

        monitor.pause(Some(Duration::ZERO));
        clipboard.put(ClipKind::Text, b"during pause");

        // first tick past the deadline resumes and re-baselines
        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 0);

        clipboard.put(ClipKind::Text, b"afterwards");
        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn ignored_apps_and_transient_content_are_skipped() {
        let (mut monitor, _handle, clipboard, store) = test_monitor();
        monitor.start_listening();

        clipboard.put_from(ClipKind::Text, b"password123", "Vault", "/apps/Vault");
        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 0);

        clipboard.set_transient(true);
        clipboard.put(ClipKind::Text, b"one-time code");
        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 0);

        clipboard.set_transient(false);
        clipboard.put(ClipKind::Text, b"plain");
        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn own_writes_never_feed_back() {
        let (mut monitor, _handle, clipboard, store) = test_monitor();
        monitor.start_listening();

        monitor
            .write_clipboard(ClipKind::Text, b"replayed paste".to_vec())
            .unwrap();
        assert_eq!(clipboard.text().as_deref(), Some("replayed paste"));

        monitor.poll_clipboard().await.unwrap();
        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 0);

        // a genuine copy afterwards is still seen
        clipboard.put(ClipKind::Text, b"user copy");
        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn extraction_failure_skips_tick_without_killing_loop() {
        let (mut monitor, _handle, clipboard, store) = test_monitor();
        monitor.start_listening();

        clipboard.put(ClipKind::Text, b"unreadable");
        clipboard.set_fail_reads(true);
        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 0);

        clipboard.set_fail_reads(false);
        clipboard.put(ClipKind::Text, b"readable");
        monitor.poll_clipboard().await.unwrap();
        assert_eq!(store.total_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn same_bucket_recapture_touches_instead_of_duplicating() {
        let (mut monitor, _handle, _clipboard, store) = test_monitor();
        let mut events = monitor.subscribe();
        monitor.start_listening();

        monitor.capture_snapshot(snap("dup"), 1_000).await.unwrap();
        assert_eq!(store.total_count().unwrap(), 1);

        // same minute bucket: row is resurfaced, not duplicated
        monitor.capture_snapshot(snap("dup"), 1_010).await.unwrap();
        assert_eq!(store.total_count().unwrap(), 1);
        let rows = store.search(&Default::default(), 10, 0).unwrap();
        assert_eq!(rows[0].timestamp, 1_010);

        // next bucket: intentionally distinct history
        monitor.capture_snapshot(snap("dup"), 1_070).await.unwrap();
        assert_eq!(store.total_count().unwrap(), 2);

        let mut replaced_flags = Vec::new();
        while let Ok(EngineEvent::Captured { replaced, .. }) = events.try_recv() {
            replaced_flags.push(replaced);
        }
        assert_eq!(replaced_flags, vec![false, true, false]);
    }

    #[tokio::test]
    async fn text_is_classified_into_links_and_colors() {
        let (mut monitor, _handle, _clipboard, store) = test_monitor();
        monitor.start_listening();

        monitor
            .capture_snapshot(snap("https://example.com/a"), 1_000)
            .await
            .unwrap();
        monitor.capture_snapshot(snap("#a1b2c3"), 1_001).await.unwrap();
        monitor
            .capture_snapshot(snap("just words"), 1_002)
            .await
            .unwrap();

        let rows = store.search(&Default::default(), 10, 0).unwrap();
        let kinds: Vec<ClipKind> = rows.iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&ClipKind::Link));
        assert!(kinds.contains(&ClipKind::Color));
        assert!(kinds.contains(&ClipKind::Text));
    }

    #[tokio::test]
    async fn run_loop_drives_capture_and_honors_handle_commands() {
        let (mut monitor, handle, clipboard, store) = test_monitor();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move { monitor.run(cancel).await });

        // let the loop baseline against the empty clipboard first
        tokio::time::sleep(Duration::from_millis(50)).await;
        clipboard.put(ClipKind::Text, b"copied while running");
        wait_for_count(&store, 1).await;

        handle.pause(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        clipboard.put(ClipKind::Text, b"hidden during pause");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.total_count().unwrap(), 1);

        handle.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        clipboard.put(ClipKind::Text, b"visible again");
        wait_for_count(&store, 2).await;

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    async fn wait_for_count(store: &HistoryStore, n: usize) {
        for _ in 0..100 {
            if store.total_count().unwrap() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("store never reached {n} items");
    }

    #[tokio::test]
    async fn oversized_and_blank_captures_are_dropped() {
        let (mut monitor, _handle, _clipboard, store) = test_monitor();
        monitor.start_listening();

        monitor.capture_snapshot(snap("   \n\t "), 1_000).await.unwrap();

        let mut huge = snap("x");
        huge.bytes = vec![b'x'; 2 * 1024 * 1024];
        monitor.capture_snapshot(huge, 1_001).await.unwrap();

        assert_eq!(store.total_count().unwrap(), 0);
    }
}
