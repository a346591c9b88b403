//! Process-wide tracing subscriber.

use tracing_subscriber::{fmt, EnvFilter};

/// Used when `RUST_LOG` is unset, blank or unparsable.
const DEFAULT_FILTER: &str = "warn,sqlpilot=info,tower_http=info";

fn filter_from(raw: Option<String>) -> EnvFilter {
    raw.filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| match EnvFilter::try_new(&directives) {
            Ok(filter) => Some(filter),
            Err(e) => {
                eprintln!("Ignoring invalid RUST_LOG '{}': {}", directives, e);
                None
            }
        })
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global fmt subscriber; later calls are ignored.
pub fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter_from(std::env::var("RUST_LOG").ok()))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_when_unset_or_blank() {
        assert_eq!(filter_from(None).to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
        assert_eq!(filter_from(Some("  ".into())).to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
    }

    #[test]
    fn test_explicit_filter_is_used() {
        let filter = filter_from(Some("sqlpilot=debug".into())).to_string();
        assert!(filter.contains("sqlpilot=debug"));
        assert_ne!(filter, EnvFilter::new(DEFAULT_FILTER).to_string());
    }

    #[test]
    fn test_invalid_filter_falls_back() {
        let filter = filter_from(Some("sqlpilot=notalevel".into()));
        assert_eq!(filter.to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
    }
}
