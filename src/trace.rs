use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Logs go to stderr, stdout carries records.
///
/// `levels` is an `EnvFilter` directive, e.g. `harvestd=debug,harvest=info`.
pub fn init(color: bool, json: bool, levels: &str) {
    let filter = EnvFilter::try_new(levels).unwrap_or_else(|err| {
        eprintln!("invalid log filter {levels:?}, {err}, fallback to info");
        EnvFilter::new("info")
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.with_ansi(color).try_init()
    };

    // tests might install their own subscriber first
    if let Err(err) = result {
        eprintln!("install tracing subscriber failed, {err}");
    }
}
