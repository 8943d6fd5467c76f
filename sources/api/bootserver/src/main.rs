//! Startup: parse the command line, initialise logging, run the server.

use bootserver::config::{Args, Config};
use log::{error, LevelFilter};
use simplelog::{Config as LogConfig, SimpleLogger};
use std::process;

#[actix_web::main]
async fn main() {
    let args: Args = argh::from_env();

    let level = args
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    if let Err(e) = SimpleLogger::init(level, LogConfig::default()) {
        eprintln!("logger setup failed: {}", e);
        process::exit(1);
    }

    let config = Config::new(&args);
    if let Err(e) = bootserver::server::serve(config, &args.listen, args.threads).await {
        error!("server failed: {}", e);
        process::exit(1);
    }
}
