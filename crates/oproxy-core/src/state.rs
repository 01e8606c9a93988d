use crate::config::ConfigProvider;
use crate::events::ActionLog;
use crate::settings::Settings;
use crate::upstream::CapsCache;

/// Process-wide shared state. Clients are built once at bootstrap and shared
/// by every in-flight request; per-request resources live in the forwarder.
pub struct AppState {
    pub settings: Settings,
    pub config: ConfigProvider,
    pub caps: CapsCache,
    /// Client used for forwarded requests.
    pub client: wreq::Client,
    /// Client used for capability discovery and health probes.
    pub caps_client: wreq::Client,
    pub log: ActionLog,
}
