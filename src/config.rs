use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How an advertised app's package/bundle id is pulled out of its ad URL.
/// Store pages differ per platform, so this is configuration rather than
/// fixed logic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PackageIdRule {
    /// Take the value of a query parameter, e.g. `id` on Play Store URLs.
    QueryParam(String),
    /// Take everything after the `#` fragment marker (App Store style).
    Fragment,
    /// Use the whole URL as the comparison key.
    FullUrl,
}

impl PackageIdRule {
    pub fn extract(&self, ad_url: &str) -> String {
        match self {
            PackageIdRule::QueryParam(key) => {
                let Some((_, query)) = ad_url.split_once('?') else {
                    return String::new();
                };
                for pair in query.split('&') {
                    if let Some((name, value)) = pair.split_once('=') {
                        if name == key {
                            // Fragments are not part of the parameter value
                            return value.split('#').next().unwrap_or(value).to_string();
                        }
                    }
                }
                String::new()
            }
            PackageIdRule::Fragment => ad_url
                .split_once('#')
                .map(|(_, fragment)| fragment.to_string())
                .unwrap_or_default(),
            PackageIdRule::FullUrl => ad_url.to_string(),
        }
    }
}

impl Default for PackageIdRule {
    fn default() -> Self {
        PackageIdRule::QueryParam("id".to_string())
    }
}

/// Static configuration for the engine. Hosts build one of these at
/// composition time; nothing here changes after start.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Feed endpoints, one snapshot per URL. List order is the feed id
    /// consumers pass to the query surface.
    pub feed_urls: Vec<String>,
    /// Bundle id of the host app; candidates advertising it are self ads.
    pub bundle_id: String,
    pub package_rule: PackageIdRule,
    /// Directory cached ad images are written to.
    pub cache_dir: PathBuf,
    /// Path of the key-value prefs file holding the persisted snapshot.
    pub prefs_path: PathBuf,
    /// Spacing between successful refresh cycles.
    pub refresh_interval: Duration,
    /// Delay before restarting a refresh cycle that failed part-way.
    pub retry_backoff: Duration,
    /// Poll spacing while waiting for the network to come up.
    pub connectivity_poll: Duration,
    /// Master switch; when false the composition root hands out a no-op
    /// provider instead of a live engine.
    pub enabled: bool,
    pub log_impressions: bool,
    pub log_clicks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feed_urls: Vec::new(),
            bundle_id: String::new(),
            package_rule: PackageIdRule::default(),
            cache_dir: PathBuf::from("promo_cache"),
            prefs_path: PathBuf::from("promo_prefs.json"),
            refresh_interval: Duration::from_secs(10 * 60),
            retry_backoff: Duration::from_secs(2),
            connectivity_poll: Duration::from_secs(1),
            enabled: true,
            log_impressions: true,
            log_clicks: true,
        }
    }
}
