//! Tracing setup for the binaries

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::SharedError;

/// Used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,crm_billing=debug";

fn json_requested(log_format: Option<&str>) -> bool {
    log_format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. `RUST_LOG` overrides `default_filter`;
/// `LOG_FORMAT=json` switches to one JSON object per line.
pub fn init_tracing(default_filter: &str) -> Result<(), SharedError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let format = std::env::var("LOG_FORMAT").ok();
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json_requested(format.as_deref()) {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.map_err(|e| SharedError::Tracing(e.to_string()))
}
