//! Logging setup
//!
//! Wraps `tracing-subscriber` initialization and owns the process-wide
//! one-time log lines.

use crate::config::ChannelConfig;
use std::sync::Once;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT_LOGGING: Once = Once::new();
static CHANNEL_LIMITS: Once = Once::new();

/// Install a global fmt subscriber. `RUST_LOG` overrides the default level.
///
/// Only the first call has an effect; a subscriber installed elsewhere is
/// left in place.
pub fn init_logging(verbose: bool) {
    INIT_LOGGING.call_once(|| {
        let default_level = if verbose { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("rivven_sync={}", default_level)));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_names(true))
            .try_init();
    });
}

/// Log the configured channel rate ceilings, once per process
pub fn log_channel_limits_once(config: &ChannelConfig) {
    CHANNEL_LIMITS.call_once(|| {
        info!(
            "Channel set byte_speed_limit to {}{}",
            config.byte_speed,
            if config.byte_speed <= 0 {
                ", No bps activated."
            } else {
                "."
            }
        );
        info!(
            "Channel set record_speed_limit to {}{}",
            config.record_speed,
            if config.record_speed <= 0 {
                ", No tps activated."
            } else {
                "."
            }
        );
    });
}

/// Returns true once the channel limits have been logged
pub fn channel_limits_logged() -> bool {
    CHANNEL_LIMITS.is_completed()
}
