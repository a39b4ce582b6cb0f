//! Binary entrypoint for the credential tooling
//!
//! Reads the same `FIREBASE_*` variables the services use and never prints
//! key material.

use medbill_backend::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
