pub mod bootstrap;
pub mod config;
pub mod events;
pub mod forward;
pub mod realtime;
pub mod settings;
pub mod sniff;
pub mod state;
pub mod upstream;

pub use config::{ConfigError, ConfigProvider, ConfigSnapshot, Upstream};
pub use events::{ActionLog, ActionLogWorker, LogEvent};
pub use settings::Settings;
pub use state::AppState;
