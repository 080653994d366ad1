use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize stderr logging for a corral binary.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies to the corral
/// crates only, so ssh chatter from dependencies stays quiet.
pub fn init_tracing(service_name: &str, default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,corral={lvl},corral_common={lvl},corral_exec={lvl},corral_setup={lvl},corral_bench={lvl}",
            lvl = default_level
        ))
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::debug!(service_name, "tracing initialized");
}
