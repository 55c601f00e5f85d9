use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Wall-clock span of one named step.
#[derive(Clone, Copy, Debug)]
pub struct Stopwatch {
    started_at: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn report(&self, logger: &Logger, context: Option<&str>, step: &str) {
        let elapsed = self.elapsed();
        logger.log(
            LogLevel::Debug,
            context,
            &format!("{step} took {}", render_duration(elapsed)),
            Some(json!({
                "step": step,
                "elapsed_us": u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            })),
        );
    }
}

/// Runs `step` and logs its duration at debug level, whatever it returns.
pub fn measure_execution<T>(
    step_name: &str,
    context: Option<&str>,
    logger: &Logger,
    step: impl FnOnce() -> T,
) -> T {
    let stopwatch = Stopwatch::start();
    let outcome = step();
    stopwatch.report(logger, context, step_name);
    outcome
}

fn render_duration(duration: Duration) -> String {
    let micros = duration.as_micros();
    match micros {
        0..=999 => format!("{micros}us"),
        1_000..=999_999 => format!("{:.1}ms", micros as f64 / 1_000.0),
        _ => format!("{:.2}s", duration.as_secs_f64()),
    }
}
