//! Tracing setup for processes embedding the multilang driver.

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Filter directives used when `RUST_LOG` is not set.
///
/// `MULTILANG_LOG` picks the base level (`debug`, `warn`/`warning`, `error`,
/// anything else means `info`). Child stderr (`multilang::child`) stays at
/// info or above unless the base level is stricter.
pub fn default_filter(multilang_log: Option<&str>) -> String {
    let level = match multilang_log {
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    let child_level = if level == "debug" { "info" } else { level };
    format!("multilang={level},multilang::child={child_level}")
}

/// Output format for the stderr subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// `json` (any case) selects JSON; anything else is plain text.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }

    fn layer(self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer().with_writer(std::io::stderr);
        match self {
            Self::Text => layer.boxed(),
            Self::Json => layer.json().boxed(),
        }
    }
}

fn filter_from_env() -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(default_filter(
            std::env::var("MULTILANG_LOG").ok().as_deref(),
        )),
    }
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` overrides the filter entirely; `LOG_FORMAT=json` switches to
/// JSON output. Returns false if a global subscriber was already set, in
/// which case nothing changes.
pub fn init_tracing() -> bool {
    let format = LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref());
    tracing_subscriber::registry()
        .with(format.layer())
        .with(filter_from_env())
        .try_init()
        .is_ok()
}
