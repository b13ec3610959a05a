use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use runar_graph::cli::{self, Args};

const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    args.init_logging();

    info!("Starting {} {}", runar_graph::NAME, runar_graph::VERSION);
    match cli::run(args).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}
