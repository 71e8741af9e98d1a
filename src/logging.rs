//! Tracing subscriber setup for hosts that do not install their own
//!
//! Alerts are emitted on the `rasp::alarm` target and policy script output
//! on `rasp::plugin`, so both can be routed with ordinary `RUST_LOG`
//! directives, e.g. `RUST_LOG=a3s_rasp=info,rasp::alarm=warn`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directive used when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVE: &str = "a3s_rasp=info,rasp=info";

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub default_directive: String,
    /// One JSON object per line instead of the human-readable format
    pub json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            default_directive: DEFAULT_DIRECTIVE.to_string(),
            json: false,
        }
    }
}

/// Install a global subscriber
///
/// Returns false when one is already installed, which is left untouched.
pub fn init(options: &LogOptions) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_directive));
    let json = options.json.then(|| fmt::layer().json());
    let text = (!options.json).then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .is_ok()
}
