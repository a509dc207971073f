//! Error handling helpers for driver hooks and worker jobs.
//!
//! Driver hooks run on blocking worker threads and talk to unreliable remote
//! backends, so the retry helper here is synchronous.

use anyhow::Result;
use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retry a blocking operation with exponential backoff
pub fn retry_blocking<F, T>(
    mut operation: F,
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f32,
    operation_name: &str,
) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match operation(attempt) {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        "Operation '{}' succeeded after {} attempts",
                        operation_name, attempt
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                warn!(
                    "Operation '{}' failed on attempt {}/{}: {}",
                    operation_name, attempt, max_attempts, err
                );

                last_error = Some(err);

                if attempt < max_attempts {
                    debug!("Retrying '{}' in {:?}", operation_name, delay);
                    std::thread::sleep(delay);
                    delay = Duration::from_secs_f32(delay.as_secs_f32() * backoff_multiplier);
                }
            }
        }
    }

    error!(
        "Operation '{}' failed after {} attempts",
        operation_name, max_attempts
    );

    let err = last_error.unwrap_or_else(|| anyhow::anyhow!("no attempt was made"));
    Err(err.context(format!("Failed after {} attempts", max_attempts)))
}

/// Render a caught panic payload
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Lock a std mutex, recovering the data if a holder panicked
pub fn lock_unpoisoned<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
