#![allow(dead_code)]
#![allow(clippy::too_many_arguments, clippy::many_single_char_names)]

pub mod api;
mod error;
pub mod executor;
pub mod kernels;
pub mod naming;
pub mod planner;
mod prelude;
pub mod types;

pub use crate::api::{ArrayPlan, Reduction};
pub use crate::error::{ErrorKind, PlanError};

pub fn initialize_logger() {
    use std::time::Instant;

    lazy_static::lazy_static! {
        static ref START_TIMING: Instant = Instant::now();
    }

    let _ = *START_TIMING;

    env_logger::Builder::from_default_env()
        .format(|formatter, record| {
            use std::io::Write;
            let duration = START_TIMING.elapsed();

            writeln!(
                formatter,
                "[{} {:.6}] {}: {}",
                record.module_path().unwrap_or("?"),
                duration.as_secs_f64(),
                record.level(),
                record.args(),
            )
        })
        .init();
}
