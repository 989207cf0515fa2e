//! octo-sw - offline cache proxy and service worker toolkit.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::env;

#[tokio::main]
async fn main() -> octo_sw::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    if let Err(e) = octo_sw::cli::run(args).await {
        log::error!("{e}");
        if matches!(e, octo_sw::Error::Config(_)) {
            eprintln!();
            octo_sw::cli::print_usage();
        }
        return Err(e);
    }
    Ok(())
}
