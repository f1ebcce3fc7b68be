//! In-app cross-promotion ad engine.
//!
//! A remote JSON feed describes advertising slots, each rotating through
//! candidate ads for other titles in the catalog. The engine downloads the
//! feeds on a fixed interval, merges them into a slot table that survives
//! restarts, rotates each slot fairly (never the host's own ad, never an
//! inactive one, installed apps only as a last resort), and keeps the
//! current ad's image decoded in memory with the raw bytes cached on disk.
//!
//! Hosts construct one engine via [`engine::build_provider`], hand it the
//! platform collaborators (network fetch, installed-app query, analytics
//! sink), and query it through the [`engine::AdProvider`] surface.

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod net;
pub mod platform;
pub mod prefs;
pub mod rotation;
pub mod store;
pub mod texture;

pub use config::{EngineConfig, PackageIdRule};
pub use engine::{build_provider, AdProvider, DisabledProvider, EngineEvent, PromoEngine};
pub use error::{PromoError, PromoResult};
pub use net::{Fetcher, HttpFetcher};
pub use platform::{
    EventSink, InstalledAppsSource, NoInstalledApps, NullEventSink, StaticInstalledApps,
};
