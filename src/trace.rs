use tracing_subscriber::EnvFilter;

/// Environment variable which overrides `--log-level`, it takes full
/// `EnvFilter` directives, e.g. `kwatch=debug,kubernetes=trace`.
pub const LOG_ENV: &str = "KWATCH_LOG";

/// Turn a plain level into directives for the crates of this workspace, so
/// dependencies like hyper stay quiet.
pub fn directives(level: &str) -> String {
    match level {
        "off" => "off".to_string(),
        level => [
            format!("kwatch={level}"),
            format!("kubernetes={level}"),
            format!("backoff={level}"),
        ]
        .join(","),
    }
}

/// Install the global subscriber, logs go to stderr.
pub fn init(color: bool, json: bool, levels: &str) {
    let filter = match EnvFilter::try_new(levels) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("invalid log directives {levels:?}, {err}, fallback to info");
            EnvFilter::new(directives("info"))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(color)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };

    if let Err(err) = result {
        eprintln!("init tracing subscriber failed, {err}");
    }
}
