use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for the server.
///
/// When used as an MCP server, stdout carries JSON-RPC frames, so all log
/// output goes to stderr with ANSI codes disabled to keep the channel clean.
pub fn init_logging(ansi_colors: bool) {
    let result = if !ansi_colors {
        fmt::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(false)
            .try_init()
    } else {
        fmt::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .try_init()
    };

    // A failed init means a subscriber is already installed; not fatal.
    if let Err(e) = result {
        eprintln!(
            "Warning: Could not initialize logger: {}. Continuing anyway.",
            e
        );
    }

    // Panics must not leak ANSI sequences onto the wire either.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: {}", panic_info);
    }));

    tracing::info!("Initializing toolhost v{}", crate::version());
}
