//! Platform context shared across the SDK.
//!
//! Native wrappers populate this record once at startup (and again when
//! connectivity changes); `collect` snapshots it for attachment to
//! outbound events.

use causality_protocol::{DeviceContext, NetworkType, Platform};
use std::sync::{Mutex, PoisonError};

pub struct PlatformContextStore {
    inner: Mutex<DeviceContext>,
}

impl PlatformContextStore {
    pub fn new(sdk_version: &str) -> Self {
        Self {
            inner: Mutex::new(DeviceContext {
                sdk_version: sdk_version.to_owned(),
                ..DeviceContext::default()
            }),
        }
    }

    /// Populate the static platform fields (called by the native wrapper).
    #[allow(clippy::too_many_arguments)]
    pub fn set_platform_context(
        &self,
        platform: &str,
        os_version: &str,
        model: &str,
        manufacturer: &str,
        app_version: &str,
        build_number: &str,
        screen_width: u32,
        screen_height: u32,
        locale: &str,
        timezone: &str,
    ) {
        let mut ctx = self.lock();
        ctx.platform = parse_platform(platform);
        ctx.os_version = os_version.to_owned();
        ctx.model = model.to_owned();
        ctx.manufacturer = manufacturer.to_owned();
        ctx.app_version = app_version.to_owned();
        ctx.build_number = build_number.to_owned();
        ctx.screen_width = screen_width;
        ctx.screen_height = screen_height;
        ctx.locale = locale.to_owned();
        ctx.timezone = timezone.to_owned();
    }

    /// Update the connectivity fields (called on network changes).
    pub fn set_network_info(&self, carrier: &str, network_type: &str) {
        let mut ctx = self.lock();
        ctx.carrier = carrier.to_owned();
        ctx.network_type = parse_network_type(network_type);
    }

    pub fn set_environment_flags(&self, is_jailbroken: bool, is_emulator: bool) {
        let mut ctx = self.lock();
        ctx.is_jailbroken = is_jailbroken;
        ctx.is_emulator = is_emulator;
    }

    /// Snapshot for attachment to an outbound event.
    pub fn collect(&self) -> DeviceContext {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceContext> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_platform(raw: &str) -> Platform {
    match raw.to_ascii_lowercase().as_str() {
        "ios" => Platform::Ios,
        "android" => Platform::Android,
        "web" => Platform::Web,
        _ => Platform::Unknown,
    }
}

fn parse_network_type(raw: &str) -> NetworkType {
    match raw.to_ascii_lowercase().as_str() {
        "wifi" => NetworkType::Wifi,
        "cellular" => NetworkType::Cellular,
        "ethernet" => NetworkType::Ethernet,
        "offline" | "none" => NetworkType::Offline,
        _ => NetworkType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_reflects_platform_and_network_updates() {
        let store = PlatformContextStore::new("1.4.0");
        store.set_platform_context(
            "iOS", "17.2", "iPhone15,2", "Apple", "3.1.0", "4711", 1179, 2556, "en_US",
            "America/New_York",
        );
        store.set_network_info("T-Mobile", "cellular");

        let ctx = store.collect();
        assert_eq!(ctx.platform, Platform::Ios);
        assert_eq!(ctx.network_type, NetworkType::Cellular);
        assert_eq!(ctx.carrier, "T-Mobile");
        assert_eq!(ctx.screen_width, 1179);
        assert_eq!(ctx.sdk_version, "1.4.0");
    }

    #[test]
    fn unknown_strings_fall_back_to_unknown_variants() {
        let store = PlatformContextStore::new("1.4.0");
        store.set_platform_context("tvos", "", "", "", "", "", 0, 0, "", "");
        store.set_network_info("", "5g");
        let ctx = store.collect();
        assert_eq!(ctx.platform, Platform::Unknown);
        assert_eq!(ctx.network_type, NetworkType::Unknown);
    }
}
