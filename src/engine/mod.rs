//! Engine composition: the consumer-facing query surface, observer events,
//! and the background refresh lifecycle.

mod refresh;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use image::RgbaImage;
use log::{error, info, warn};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{PromoError, PromoResult};
use crate::feed::DecodedAd;
use crate::net::Fetcher;
use crate::platform::{EventSink, InstalledAppsSource};
use crate::prefs::PrefsStore;
use crate::rotation;
use crate::store::{AdCandidate, MergeOutcome, SlotStore, TextureState};
use crate::texture::TextureCache;

/// Prefs key the persisted slot snapshot lives under.
const SNAPSHOT_KEY: &str = "promo_snapshot";

/// Notifications pushed to observers, in the order the transitions happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A slot's current ad finished downloading and decoding its image.
    ImageReady { feed: usize, slot: u32 },
    /// A consumer asked for an on-screen swap of this slot right away.
    ForceChange { feed: usize, slot: u32 },
}

/// The surface both the live engine and the disabled stub implement, so
/// hosts compose against one type regardless of the runtime toggle.
/// Unknown feeds and slots answer with sentinels, never errors.
#[async_trait]
pub trait AdProvider: Send + Sync {
    /// Is the current ad for this slot displayable (texture decoded)?
    async fn is_ready(&self, feed: usize, slot: u32) -> bool;
    /// Click-through URL of the current ad, or empty.
    async fn ad_url(&self, feed: usize, slot: u32) -> String;
    /// Package name of the current ad, or empty.
    async fn package_name(&self, feed: usize, slot: u32) -> String;
    /// Decoded image of the current ad, if ready.
    async fn texture(&self, feed: usize, slot: u32) -> Option<Arc<RgbaImage>>;
    /// Rotate the slot to its next candidate and start fetching its image.
    /// `force_change` additionally tells observers to swap what is on
    /// screen right now.
    async fn refresh(&self, feed: usize, slot: u32, force_change: bool);
    fn on_impression(&self, package_name: &str);
    fn on_click(&self, package_name: &str);
}

/// No-op provider handed out when the subsystem is switched off.
pub struct DisabledProvider;

#[async_trait]
impl AdProvider for DisabledProvider {
    async fn is_ready(&self, _feed: usize, _slot: u32) -> bool {
        false
    }

    async fn ad_url(&self, _feed: usize, _slot: u32) -> String {
        String::new()
    }

    async fn package_name(&self, _feed: usize, _slot: u32) -> String {
        String::new()
    }

    async fn texture(&self, _feed: usize, _slot: u32) -> Option<Arc<RgbaImage>> {
        None
    }

    async fn refresh(&self, _feed: usize, _slot: u32, _force_change: bool) {}

    fn on_impression(&self, _package_name: &str) {}

    fn on_click(&self, _package_name: &str) {}
}

/// Build the provider a host should hold: the live engine with its refresh
/// loop running when enabled, the no-op stub otherwise. Must be called
/// from within a tokio runtime.
pub async fn build_provider(
    config: EngineConfig,
    fetcher: Arc<dyn Fetcher>,
    installed_apps: &dyn InstalledAppsSource,
    events: Arc<dyn EventSink>,
) -> Result<Arc<dyn AdProvider>> {
    if !config.enabled {
        info!("Cross-promo ads disabled by config; using no-op provider");
        return Ok(Arc::new(DisabledProvider));
    }

    let engine = PromoEngine::new(config, fetcher, installed_apps, events)?;
    engine.start().await;
    Ok(Arc::new(engine))
}

struct EngineState {
    store: SlotStore,
    textures: TextureCache,
    /// Lowercased package ids installed on the device, read once per
    /// session.
    installed: Vec<String>,
}

/// The live engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct PromoEngine {
    config: Arc<EngineConfig>,
    fetcher: Arc<dyn Fetcher>,
    events: Arc<dyn EventSink>,
    state: Arc<Mutex<EngineState>>,
    observers: Arc<Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>>,
    prefs: Arc<PrefsStore>,
    /// True once the slot table is backed by a persisted or freshly merged
    /// snapshot whose slots have been rotated at least once.
    warm: Arc<AtomicBool>,
    refresh_task: Arc<Mutex<Option<(CancellationToken, JoinHandle<()>)>>>,
}

impl PromoEngine {
    /// Construct the engine and load any persisted snapshot. The refresh
    /// loop is not started until [`PromoEngine::start`].
    pub fn new(
        config: EngineConfig,
        fetcher: Arc<dyn Fetcher>,
        installed_apps: &dyn InstalledAppsSource,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let prefs = PrefsStore::new(config.prefs_path.clone())?;

        let installed: Vec<String> = installed_apps
            .installed_packages()
            .iter()
            .map(|pkg| pkg.trim().to_lowercase())
            .filter(|pkg| !pkg.is_empty())
            .collect();
        info!("Cross-promo engine starting with {} installed packages", installed.len());

        let mut store = SlotStore::new();
        let mut warm = false;
        if let Some(blob) = prefs.get(SNAPSHOT_KEY) {
            match SlotStore::load(blob.as_bytes()) {
                Ok(loaded) => {
                    store = loaded;
                    warm = true;
                }
                Err(err) => {
                    warn!("Ignoring persisted ad snapshot: {err}");
                    events.error("snapshot", &err.to_string());
                }
            }
        }

        let textures = TextureCache::new(config.cache_dir.clone());

        Ok(Self {
            config: Arc::new(config),
            fetcher,
            events,
            state: Arc::new(Mutex::new(EngineState {
                store,
                textures,
                installed,
            })),
            observers: Arc::new(Mutex::new(Vec::new())),
            prefs: Arc::new(prefs),
            warm: Arc::new(AtomicBool::new(warm)),
            refresh_task: Arc::new(Mutex::new(None)),
        })
    }

    /// Spawn the background refresh loop. Idempotent.
    pub async fn start(&self) {
        let mut guard = self.refresh_task.lock().await;
        if guard.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            refresh::refresh_loop(engine, child).await;
        });
        *guard = Some((token, handle));
    }

    /// Stop the refresh loop and write a final snapshot checkpoint.
    pub async fn shutdown(&self) {
        let task = self.refresh_task.lock().await.take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(err) = handle.await {
                error!("Ad refresh task did not shut down cleanly: {err}");
            }
        }

        if let Err(err) = self.persist_now().await {
            warn!("Final ad snapshot write failed: {err}");
        }
    }

    /// Run one refresh cycle right now, outside the fixed schedule.
    pub async fn refresh_now(&self) -> PromoResult<()> {
        refresh::run_cycle(self, &CancellationToken::new()).await
    }

    /// Write the current slot table to the prefs store. The refresh loop
    /// calls this after every clean cycle; hosts should also call it on
    /// quit, pause, and focus loss.
    pub async fn persist_now(&self) -> PromoResult<()> {
        let bytes = {
            let state = self.state.lock().await;
            state.store.serialize()?
        };
        let blob = String::from_utf8(bytes)
            .map_err(|err| PromoError::Storage(format!("snapshot utf8: {err}")))?;
        self.prefs
            .set(SNAPSHOT_KEY, blob)
            .map_err(|err| PromoError::Storage(format!("snapshot write: {err}")))
    }

    /// Register an observer. Events arrive in transition order over an
    /// unbounded channel; drop the receiver to unsubscribe.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().await.push(tx);
        rx
    }

    async fn emit(&self, event: EngineEvent) {
        let mut observers = self.observers.lock().await;
        observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn fetcher(&self) -> &dyn Fetcher {
        &*self.fetcher
    }

    pub(crate) fn event_sink(&self) -> &dyn EventSink {
        &*self.events
    }

    pub(crate) fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_warm(&self) {
        self.warm.store(true, Ordering::Relaxed);
    }

    /// Merge one decoded feed into the slot store, deriving self/installed
    /// flags against this session's package list.
    pub(crate) async fn merge_feed(&self, feed: usize, entries: &[DecodedAd]) -> MergeOutcome {
        let mut state = self.state.lock().await;
        let EngineState {
            store, installed, ..
        } = &mut *state;

        store.merge(feed, entries, &self.config.bundle_id, |pkg| {
            let pkg = pkg.to_lowercase();
            installed.iter().any(|app| pkg.contains(app.as_str()))
        })
    }

    /// Re-randomize rotation cursors for one feed.
    pub(crate) async fn randomize_feed(&self, feed: usize) {
        let mut state = self.state.lock().await;
        if let Some(snapshot) = state.store.feed_mut(feed) {
            rotation::randomize_cursors(snapshot, &mut rand::thread_rng());
        }
    }

    /// Advance one slot to its next eligible candidate and kick off its
    /// texture. Failures leave the slot without a displayable ad until the
    /// next attempt; they never propagate to the host.
    pub(crate) async fn rotate_slot(&self, feed: usize, slot_id: u32) {
        let selected = {
            let mut state = self.state.lock().await;
            match state.store.slot_mut(feed, slot_id) {
                Some(slot) => rotation::select_next(slot),
                None => None,
            }
        };

        if selected.is_some() {
            if let Err(err) = self.ensure_texture(feed, slot_id).await {
                warn!("Texture for feed {feed} slot {slot_id} not ready: {err}");
                self.events.error("texture", &err.to_string());
            }
        }
    }

    /// Rotate every slot of one feed.
    pub(crate) async fn rotate_feed(&self, feed: usize) {
        let slot_ids: Vec<u32> = {
            let state = self.state.lock().await;
            state
                .store
                .feed(feed)
                .map(|snapshot| snapshot.slots.iter().map(|slot| slot.id).collect())
                .unwrap_or_default()
        };

        for slot_id in slot_ids {
            self.rotate_slot(feed, slot_id).await;
        }
    }

    /// Rotate every slot of every feed (warm-start path).
    pub(crate) async fn rotate_all(&self) {
        let feed_count = {
            let state = self.state.lock().await;
            state.store.feed_count()
        };
        for feed in 0..feed_count {
            self.rotate_feed(feed).await;
        }
    }

    /// Make sure the slot's current candidate has a decoded texture: serve
    /// it from the session list, restore it from the disk cache, or fetch
    /// it from the network. The Downloading state set under the lock is the
    /// idempotency gate against overlapping calls.
    async fn ensure_texture(&self, feed: usize, slot_id: u32) -> PromoResult<()> {
        struct FetchPlan {
            candidate: char,
            img_url: String,
            file_name: String,
            from_disk: bool,
        }

        let plan = {
            let mut state = self.state.lock().await;
            let slot = state
                .store
                .slot_mut(feed, slot_id)
                .ok_or_else(|| PromoError::State(format!("feed {feed} slot {slot_id}")))?;
            let cursor = slot.cursor;
            let Some(candidate) = slot.candidates.get_mut(cursor) else {
                return Err(PromoError::State(format!(
                    "feed {feed} slot {slot_id} has no candidate at cursor"
                )));
            };

            // Self and inactive creatives are never downloaded
            if !candidate.eligible() {
                return Ok(());
            }
            if candidate.texture_fresh() {
                return Ok(());
            }
            if candidate.texture == TextureState::Downloading {
                return Ok(());
            }

            candidate.texture = TextureState::Downloading;
            FetchPlan {
                candidate: candidate.id,
                img_url: candidate.img_url.clone(),
                file_name: candidate.file_name.clone(),
                from_disk: candidate.disk_cached,
            }
        };

        let result = if plan.from_disk {
            self.restore_from_disk(feed, slot_id, plan.candidate, &plan.file_name)
                .await
        } else {
            self.fetch_from_network(feed, slot_id, plan.candidate, &plan.img_url, &plan.file_name)
                .await
        };

        if result.is_ok() {
            self.emit(EngineEvent::ImageReady {
                feed,
                slot: slot_id,
            })
            .await;
        }
        result
    }

    /// Disk-cache path of `ensure_texture`. A missing or unreadable file
    /// clears the cached flag so the next attempt falls back to the
    /// network.
    async fn restore_from_disk(
        &self,
        feed: usize,
        slot_id: u32,
        candidate_id: char,
        file_name: &str,
    ) -> PromoResult<()> {
        let mut state = self.state.lock().await;

        match state.textures.load_cached(feed, file_name).await {
            Ok(handle) => {
                if let Some(candidate) = candidate_mut(&mut state.store, feed, slot_id, candidate_id)
                {
                    candidate.texture = TextureState::Ready(handle);
                    candidate.ready_update_time = candidate.latest_update_time;
                }
                Ok(())
            }
            Err(err) => {
                if let Some(candidate) = candidate_mut(&mut state.store, feed, slot_id, candidate_id)
                {
                    candidate.disk_cached = false;
                    candidate.texture = TextureState::NotReady;
                }
                Err(err)
            }
        }
    }

    /// Network path of `ensure_texture`. The download runs outside the
    /// state lock so consumer queries keep answering meanwhile.
    async fn fetch_from_network(
        &self,
        feed: usize,
        slot_id: u32,
        candidate_id: char,
        img_url: &str,
        file_name: &str,
    ) -> PromoResult<()> {
        let fetched = self.fetcher.fetch_bytes(img_url).await;

        let mut state = self.state.lock().await;
        let stored = match fetched {
            Ok(bytes) => state.textures.store_fetched(bytes, feed, file_name).await,
            Err(err) => Err(err),
        };

        match stored {
            Ok((handle, disk_cached)) => {
                if let Some(candidate) = candidate_mut(&mut state.store, feed, slot_id, candidate_id)
                {
                    candidate.texture = TextureState::Ready(handle);
                    candidate.disk_cached = disk_cached;
                    candidate.ready_update_time = candidate.latest_update_time;
                }
                Ok(())
            }
            Err(err) => {
                if let Some(candidate) = candidate_mut(&mut state.store, feed, slot_id, candidate_id)
                {
                    candidate.texture = TextureState::NotReady;
                }
                Err(err)
            }
        }
    }
}

fn candidate_mut<'a>(
    store: &'a mut SlotStore,
    feed: usize,
    slot_id: u32,
    candidate_id: char,
) -> Option<&'a mut AdCandidate> {
    store.slot_mut(feed, slot_id)?.candidate_mut(candidate_id)
}

#[async_trait]
impl AdProvider for PromoEngine {
    async fn is_ready(&self, feed: usize, slot: u32) -> bool {
        let state = self.state.lock().await;
        state
            .store
            .slot(feed, slot)
            .and_then(|s| s.current())
            .map(|c| c.texture.is_ready())
            .unwrap_or(false)
    }

    async fn ad_url(&self, feed: usize, slot: u32) -> String {
        let state = self.state.lock().await;
        state
            .store
            .slot(feed, slot)
            .and_then(|s| s.current())
            .map(|c| c.ad_url.clone())
            .unwrap_or_default()
    }

    async fn package_name(&self, feed: usize, slot: u32) -> String {
        let state = self.state.lock().await;
        state
            .store
            .slot(feed, slot)
            .and_then(|s| s.current())
            .map(|c| c.package_name.clone())
            .unwrap_or_default()
    }

    async fn texture(&self, feed: usize, slot: u32) -> Option<Arc<RgbaImage>> {
        let state = self.state.lock().await;
        let handle = state
            .store
            .slot(feed, slot)
            .and_then(|s| s.current())
            .and_then(|c| c.texture.handle())?;
        state.textures.get(handle)
    }

    async fn refresh(&self, feed: usize, slot: u32, force_change: bool) {
        self.rotate_slot(feed, slot).await;
        if force_change {
            self.emit(EngineEvent::ForceChange { feed, slot }).await;
        }
    }

    fn on_impression(&self, package_name: &str) {
        if self.config.log_impressions {
            self.events.impression(package_name);
        }
    }

    fn on_click(&self, package_name: &str) {
        if self.config.log_clicks {
            self.events.click(package_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageIdRule;
    use crate::platform::StaticInstalledApps;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const FEED_URL: &str = "http://ads.example.com/1.json";
    const HOST_BUNDLE: &str = "com.pickle.host";

    /// Holds every image fetch until released, and signals when one is in
    /// flight.
    #[derive(Default)]
    struct ImageGate {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    struct ScriptedFetcher {
        reachable: AtomicBool,
        texts: StdMutex<HashMap<String, String>>,
        images: StdMutex<HashMap<String, Vec<u8>>>,
        image_gate: StdMutex<Option<Arc<ImageGate>>>,
    }

    impl ScriptedFetcher {
        fn new() -> Self {
            Self {
                reachable: AtomicBool::new(true),
                texts: StdMutex::new(HashMap::new()),
                images: StdMutex::new(HashMap::new()),
                image_gate: StdMutex::new(None),
            }
        }

        fn set_text(&self, url: &str, body: &str) {
            self.texts.lock().unwrap().insert(url.to_string(), body.to_string());
        }

        fn set_image(&self, url: &str, bytes: Vec<u8>) {
            self.images.lock().unwrap().insert(url.to_string(), bytes);
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn reachable(&self) -> bool {
            self.reachable.load(Ordering::Relaxed)
        }

        async fn fetch_text(&self, url: &str) -> PromoResult<String> {
            self.texts
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| PromoError::Transport(format!("no scripted body for {url}")))
        }

        async fn fetch_bytes(&self, url: &str) -> PromoResult<Vec<u8>> {
            let gate = self.image_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            self.images
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| PromoError::Transport(format!("no scripted bytes for {url}")))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        impressions: StdMutex<Vec<String>>,
        clicks: StdMutex<Vec<String>>,
        errors: StdMutex<Vec<String>>,
    }

    impl EventSink for RecordingSink {
        fn impression(&self, package_name: &str) {
            self.impressions.lock().unwrap().push(package_name.to_string());
        }

        fn click(&self, package_name: &str) {
            self.clicks.lock().unwrap().push(package_name.to_string());
        }

        fn error(&self, scope: &str, message: &str) {
            self.errors.lock().unwrap().push(format!("{scope}: {message}"));
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([10, 200, 10, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn slot_json(slotid: &str, updatetime: i64, active: bool, package: &str) -> String {
        format!(
            r#"{{"slotid":"{slotid}","updatetime":{updatetime},"active":{active},"adurl":"https://store.example.com/app?id={package}","imgurl":"http://cdn.example.com/uploads/adverts/{slotid}.png"}}"#
        )
    }

    fn feed_json(slots: &[String]) -> String {
        format!(r#"{{"slots":[{}],"containers":[]}}"#, slots.join(","))
    }

    fn img_url(slotid: &str) -> String {
        format!("http://cdn.example.com/uploads/adverts/{slotid}.png")
    }

    struct Fixture {
        engine: PromoEngine,
        fetcher: Arc<ScriptedFetcher>,
        sink: Arc<RecordingSink>,
        config: EngineConfig,
        _dir: TempDir,
    }

    impl Fixture {
        fn new(installed: Vec<String>) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let dir = TempDir::new().unwrap();
            let config = EngineConfig {
                feed_urls: vec![FEED_URL.to_string()],
                bundle_id: HOST_BUNDLE.to_string(),
                package_rule: PackageIdRule::QueryParam("id".to_string()),
                cache_dir: dir.path().join("cache"),
                prefs_path: dir.path().join("prefs.json"),
                refresh_interval: Duration::from_secs(600),
                retry_backoff: Duration::from_millis(10),
                connectivity_poll: Duration::from_millis(10),
                ..EngineConfig::default()
            };

            let fetcher = Arc::new(ScriptedFetcher::new());
            let sink = Arc::new(RecordingSink::default());
            let engine = PromoEngine::new(
                config.clone(),
                fetcher.clone(),
                &StaticInstalledApps(installed),
                sink.clone(),
            )
            .unwrap();

            Self {
                engine,
                fetcher,
                sink,
                config,
                _dir: dir,
            }
        }

        /// Standard two-candidate slot 1: alpha and beta, both with images.
        fn script_standard_feed(&self) {
            self.fetcher.set_text(
                FEED_URL,
                &feed_json(&[
                    slot_json("1a", 5, true, "com.pickle.alpha"),
                    slot_json("1b", 5, true, "com.pickle.beta"),
                ]),
            );
            self.fetcher.set_image(&img_url("1a"), png_bytes());
            self.fetcher.set_image(&img_url("1b"), png_bytes());
        }
    }

    #[tokio::test]
    async fn cold_cycle_selects_an_ad_and_downloads_its_texture() {
        let fx = Fixture::new(Vec::new());
        fx.script_standard_feed();

        fx.engine.refresh_now().await.unwrap();

        assert!(fx.engine.is_ready(0, 1).await);
        let url = fx.engine.ad_url(0, 1).await;
        assert!(url.contains("com.pickle.alpha") || url.contains("com.pickle.beta"));
        let texture = fx.engine.texture(0, 1).await.unwrap();
        assert_eq!(texture.dimensions(), (2, 2));
        assert!(fx.engine.is_warm());
    }

    #[tokio::test]
    async fn unknown_feed_and_slot_answer_with_sentinels() {
        let fx = Fixture::new(Vec::new());
        fx.script_standard_feed();
        fx.engine.refresh_now().await.unwrap();

        assert!(!fx.engine.is_ready(0, 9).await);
        assert_eq!(fx.engine.ad_url(0, 9).await, "");
        assert_eq!(fx.engine.package_name(5, 1).await, "");
        assert!(fx.engine.texture(5, 1).await.is_none());
        // A bad lookup is not an error the sink hears about
        assert!(fx.sink.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_ads_are_never_surfaced() {
        let fx = Fixture::new(Vec::new());
        fx.fetcher.set_text(
            FEED_URL,
            &feed_json(&[
                slot_json("1a", 5, true, "com.pickle.alpha"),
                slot_json("1b", 5, true, HOST_BUNDLE),
                slot_json("2a", 5, true, HOST_BUNDLE),
            ]),
        );
        fx.fetcher.set_image(&img_url("1a"), png_bytes());

        fx.engine.refresh_now().await.unwrap();

        for _ in 0..6 {
            fx.engine.refresh(0, 1, false).await;
            assert_eq!(fx.engine.package_name(0, 1).await, "com.pickle.alpha");
        }

        // Slot 2 only has the self ad: nothing to show at all
        assert!(!fx.engine.is_ready(0, 2).await);
        assert_eq!(fx.engine.ad_url(0, 2).await, "");
    }

    #[tokio::test]
    async fn installed_apps_lose_to_fresh_ones() {
        let fx = Fixture::new(vec!["com.pickle.alpha".to_string()]);
        fx.script_standard_feed();

        fx.engine.refresh_now().await.unwrap();

        for _ in 0..6 {
            assert_eq!(fx.engine.package_name(0, 1).await, "com.pickle.beta");
            fx.engine.refresh(0, 1, false).await;
        }
    }

    #[tokio::test]
    async fn failed_image_fetch_recovers_on_a_later_refresh() {
        let fx = Fixture::new(Vec::new());
        fx.fetcher.set_text(
            FEED_URL,
            &feed_json(&[slot_json("3a", 5, true, "com.pickle.gamma")]),
        );
        // No image scripted yet: the fetch fails, the cycle still completes

        fx.engine.refresh_now().await.unwrap();
        assert!(!fx.engine.is_ready(0, 3).await);
        assert!(!fx.sink.errors.lock().unwrap().is_empty());

        fx.fetcher.set_image(&img_url("3a"), png_bytes());
        fx.engine.refresh(0, 3, false).await;
        assert!(fx.engine.is_ready(0, 3).await);
    }

    #[tokio::test]
    async fn feed_failure_aborts_the_rest_of_the_cycle() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            feed_urls: vec![FEED_URL.to_string(), "http://ads.example.com/2.json".to_string()],
            bundle_id: HOST_BUNDLE.to_string(),
            package_rule: PackageIdRule::QueryParam("id".to_string()),
            cache_dir: dir.path().join("cache"),
            prefs_path: dir.path().join("prefs.json"),
            ..EngineConfig::default()
        };
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.set_text(
            FEED_URL,
            &feed_json(&[slot_json("1a", 5, true, "com.pickle.alpha")]),
        );
        fetcher.set_image(&img_url("1a"), png_bytes());
        // Second feed URL is not scripted and fails

        let engine = PromoEngine::new(
            config,
            fetcher.clone(),
            &StaticInstalledApps(Vec::new()),
            Arc::new(RecordingSink::default()),
        )
        .unwrap();

        let result = engine.refresh_now().await;
        assert!(matches!(result, Err(PromoError::Transport(_))));
        // First feed merged and rotated before the abort; nothing persisted
        assert!(engine.is_ready(0, 1).await);
        assert!(!engine.is_warm());
    }

    #[tokio::test]
    async fn observers_hear_image_ready_and_force_change_in_order() {
        let fx = Fixture::new(Vec::new());
        fx.script_standard_feed();

        let mut rx = fx.engine.subscribe().await;
        fx.engine.refresh_now().await.unwrap();
        fx.engine.refresh(0, 1, true).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::ImageReady { feed: 0, slot: 1 })));
        assert_eq!(
            events.last(),
            Some(&EngineEvent::ForceChange { feed: 0, slot: 1 })
        );
    }

    #[tokio::test]
    async fn impression_and_click_toggles_gate_the_sink() {
        let mut fx = Fixture::new(Vec::new());
        fx.config.log_impressions = false;
        let fetcher = fx.fetcher.clone();
        let sink = Arc::new(RecordingSink::default());
        let engine = PromoEngine::new(
            fx.config.clone(),
            fetcher,
            &StaticInstalledApps(Vec::new()),
            sink.clone(),
        )
        .unwrap();
        fx.engine = engine;

        fx.engine.on_impression("com.pickle.alpha");
        fx.engine.on_click("com.pickle.alpha");

        assert!(sink.impressions.lock().unwrap().is_empty());
        let clicks = sink.clicks.lock().unwrap();
        assert_eq!(clicks.len(), 1);
        assert_eq!(clicks[0], "com.pickle.alpha");
    }

    #[tokio::test]
    async fn restart_restores_ads_from_the_disk_cache() {
        let fx = Fixture::new(Vec::new());
        // A single candidate, so the second-session rotation lands on the
        // same (disk-cached) creative
        fx.fetcher.set_text(
            FEED_URL,
            &feed_json(&[slot_json("1a", 5, true, "com.pickle.alpha")]),
        );
        fx.fetcher.set_image(&img_url("1a"), png_bytes());
        fx.engine.refresh_now().await.unwrap();
        let shown_before = fx.engine.package_name(0, 1).await;

        // Second session: same prefs and cache dir, network gone
        let offline = Arc::new(ScriptedFetcher::new());
        offline.reachable.store(false, Ordering::Relaxed);
        let engine2 = PromoEngine::new(
            fx.config.clone(),
            offline,
            &StaticInstalledApps(Vec::new()),
            Arc::new(RecordingSink::default()),
        )
        .unwrap();

        assert!(engine2.is_warm());
        // Nothing ready until the warm-start rotation re-validates the cache
        assert!(!engine2.is_ready(0, 1).await);

        engine2.rotate_all().await;
        assert!(engine2.is_ready(0, 1).await);
        assert!(!shown_before.is_empty());
    }

    #[tokio::test]
    async fn corrupt_persisted_snapshot_degrades_to_cold_start() {
        let fx = Fixture::new(Vec::new());
        fx.script_standard_feed();

        let prefs = PrefsStore::new(fx.config.prefs_path.clone()).unwrap();
        prefs.set(SNAPSHOT_KEY, "{garbage".to_string()).unwrap();

        let engine = PromoEngine::new(
            fx.config.clone(),
            fx.fetcher.clone(),
            &StaticInstalledApps(Vec::new()),
            Arc::new(RecordingSink::default()),
        )
        .unwrap();

        assert!(!engine.is_warm());
        engine.refresh_now().await.unwrap();
        assert!(engine.is_ready(0, 1).await);
    }

    #[tokio::test]
    async fn disabled_config_composes_the_noop_provider() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            enabled: false,
            cache_dir: dir.path().join("cache"),
            prefs_path: dir.path().join("prefs.json"),
            ..EngineConfig::default()
        };

        let provider = build_provider(
            config,
            Arc::new(ScriptedFetcher::new()),
            &StaticInstalledApps(Vec::new()),
            Arc::new(RecordingSink::default()),
        )
        .await
        .unwrap();

        assert!(!provider.is_ready(0, 1).await);
        assert_eq!(provider.ad_url(0, 1).await, "");
        assert!(provider.texture(0, 1).await.is_none());
        provider.refresh(0, 1, true).await;
        provider.on_impression("com.pickle.alpha");
    }

    #[tokio::test]
    async fn shutdown_mid_download_does_not_strand_the_slot() {
        let fx = Fixture::new(Vec::new());
        fx.fetcher.set_text(
            FEED_URL,
            &feed_json(&[slot_json("1a", 5, true, "com.pickle.alpha")]),
        );
        fx.fetcher.set_image(&img_url("1a"), png_bytes());

        let gate = Arc::new(ImageGate::default());
        *fx.fetcher.image_gate.lock().unwrap() = Some(gate.clone());

        fx.engine.start().await;
        // Wait until the image download is actually in flight
        gate.entered.notified().await;

        let engine = fx.engine.clone();
        let stop = tokio::spawn(async move { engine.shutdown().await });
        gate.release.notify_one();
        stop.await.unwrap();

        // The interrupted cycle ran to completion, so the candidate is
        // ready rather than parked in the downloading state
        assert!(fx.engine.is_ready(0, 1).await);

        // And later rotations keep answering, never blocked by a stale
        // in-flight marker
        *fx.fetcher.image_gate.lock().unwrap() = None;
        for _ in 0..3 {
            fx.engine.refresh(0, 1, false).await;
            assert!(fx.engine.is_ready(0, 1).await);
        }
    }

    #[tokio::test]
    async fn background_loop_runs_a_cycle_and_shuts_down() {
        let fx = Fixture::new(Vec::new());
        fx.script_standard_feed();

        fx.engine.start().await;
        for _ in 0..50 {
            if fx.engine.is_ready(0, 1).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fx.engine.is_ready(0, 1).await);

        fx.engine.shutdown().await;

        // The final checkpoint makes the next session warm
        let engine2 = PromoEngine::new(
            fx.config.clone(),
            fx.fetcher.clone(),
            &StaticInstalledApps(Vec::new()),
            Arc::new(RecordingSink::default()),
        )
        .unwrap();
        assert!(engine2.is_warm());
    }
}
