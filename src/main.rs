mod cli;
mod core;
mod interfaces;
mod logging;

use crate::core::terminal;

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(e) = cli::run_main().await {
        terminal::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}
