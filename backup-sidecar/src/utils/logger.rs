//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const NOISY_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "tungstenite", "tokio_tungstenite"];

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `level` applies to the sidecar while
/// the HTTP, TLS and websocket stacks stay at `warn`.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives(level)).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}

fn directives(level: &str) -> String {
    let mut out = level.trim().to_string();
    for target in NOISY_TARGETS {
        out.push_str(&format!(",{}=warn", target));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_quiet_transport_crates() {
        let d = directives(" debug ");
        assert!(d.starts_with("debug,"));
        assert!(d.contains("reqwest=warn"));
        assert!(d.contains("tokio_tungstenite=warn"));
        assert!(EnvFilter::try_new(&d).is_ok());
    }
}
