//! comprobar CLI
//!
//! Thin shell over `comprobar::cli`: parse, run, print, and exit non-zero on
//! any failed comparison.
//!
//! ```bash
//! comprobar list
//! RUST_LOG=comprobar=debug comprobar run --filter fp16
//! comprobar run --scenarios matrix.json --seed 7 --json
//! comprobar grad
//! ```

use clap::Parser;
use comprobar::cli::{run, Args};

fn main() {
    init_tracing();

    let args = Args::parse();
    match run(&args) {
        Ok(result) => {
            println!("{}", result.message);
            if !result.success {
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        },
    }
}

fn init_tracing() {
    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
