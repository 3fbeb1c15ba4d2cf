#![forbid(unsafe_code)]

//! `shepherd-wrapper` — the process a wrapped submission script launches in
//! place of the workload. Thin entry point over
//! [`shepherd::wrapper::run_wrapper`]; all behavior lives in the library so
//! it stays unit-testable.

use clap::Parser;

use shepherd::wrapper::{run_wrapper, WrapperArgs};

fn main() {
    let args = WrapperArgs::parse();
    std::process::exit(run_wrapper(args));
}
