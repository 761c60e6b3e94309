mod cli;
mod core;
mod logging;
mod platform;

use crate::core::terminal;

#[tokio::main]
async fn main() {
    let daemon = std::env::args().nth(1).as_deref() == Some("daemon");
    match cli::run_main().await {
        Ok(()) => {
            if daemon {
                terminal::print_goodbye();
            }
        }
        Err(e) => {
            terminal::print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}
