//! Process-wide `tracing` subscriber installation.

/// Install a default `tracing` subscriber if none is already set. Safe to
/// call multiple times — subsequent calls are no-ops. Controlled by
/// `RUST_LOG` (e.g. `RUST_LOG=vpn_secproto=debug`).
pub fn init() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if tracing::dispatcher::has_been_set() {
            tracing::debug!("vpn data-plane toolkit: tracing subscriber already set");
            return;
        }
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_target(true)
            .compact()
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_ok() {
            tracing::debug!("vpn data-plane toolkit: tracing initialized");
        }
    });
}
