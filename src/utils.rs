/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, logging at
/// `info` and above by default.
///
/// Fails when a global subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), crate::TasukiError> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .finish()
        .try_init()?;

    Ok(())
}
