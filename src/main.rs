//! flowbridge demo
//!
//! Upper-cases a few words on their way from a source to a printing sink.
//! An optional config file (JSON, or TOML by extension) can be given as the
//! first argument.

use flowbridge::{
    config::FlowConfig,
    pipeline::{duplex_with, readable_with, writable_with, Input, Role, StageOptions},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,flowbridge=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => FlowConfig::load_or_default(path),
        None => FlowConfig::default(),
    };
    tracing::info!(
        "Running demo pipeline (high-water mark {})",
        config.high_water_mark
    );

    let source = readable_with(
        StageOptions::from_config(Role::Source, &config).name("words"),
        || ["hello", "world", "a", "b"],
    );
    let upper = duplex_with(
        StageOptions::from_config(Role::Duplex, &config).name("uppercase"),
        |input: Input<&'static str>| input.map(|word| word.to_uppercase()),
    );
    let print = writable_with(
        StageOptions::from_config(Role::Sink, &config).name("print"),
        |input: Input<String>| {
            for word in input {
                println!("{}", word);
            }
        },
    );

    source.with_config(config).pipe(upper).to(print).run()?;

    tracing::info!("Demo finished");
    Ok(())
}
