//! Host-side collaborators: installed-app queries and the analytics sink.
//! The engine only sees these traits; each host platform brings its own
//! implementation.

/// Query for apps already installed on the device. Android hosts back this
/// with a package-manager lookup; platforms without one return nothing.
pub trait InstalledAppsSource: Send + Sync {
    /// Bundle ids installed on the device, pre-filtered however the host
    /// likes. Read once per engine start.
    fn installed_packages(&self) -> Vec<String>;
}

/// A fixed list, for hosts that snapshot the package list up front and for
/// tests.
pub struct StaticInstalledApps(pub Vec<String>);

impl InstalledAppsSource for StaticInstalledApps {
    fn installed_packages(&self) -> Vec<String> {
        self.0.clone()
    }
}

/// No installed-app detection at all.
pub struct NoInstalledApps;

impl InstalledAppsSource for NoInstalledApps {
    fn installed_packages(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Sink for ad impressions, clicks, and engine errors. Hosts wire this to
/// their analytics backend.
pub trait EventSink: Send + Sync {
    fn impression(&self, package_name: &str);
    fn click(&self, package_name: &str);
    fn error(&self, scope: &str, message: &str);
}

/// Drops impressions and clicks; errors still reach the log.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn impression(&self, _package_name: &str) {}

    fn click(&self, _package_name: &str) {}

    fn error(&self, scope: &str, message: &str) {
        log::error!("[{scope}] {message}");
    }
}
