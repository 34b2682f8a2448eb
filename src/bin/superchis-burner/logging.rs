pub fn init_tracing() {
    // Off unless asked for: stdout carries JSON with --json, stderr carries
    // the human progress line.
    let filter = std::env::var("RUST_LOG").ok();
    let enable = filter.as_deref().is_some_and(|s| !s.trim().is_empty())
        || std::env::var_os("SUPERCHIS_BURNER_LOG").is_some();

    if !enable {
        return;
    }

    let filter = filter.unwrap_or_else(|| "superchis_burner=info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
