use std::{
    fmt::Write,
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Awaits the future in `slot` if there is one, otherwise never completes.
///
/// The slot is left holding the completed future, so callers must clear it once this returns.
pub async fn await_if_some<F: Future + ?Sized>(slot: &mut Option<Pin<Box<F>>>) -> F::Output {
    match slot {
        Some(future) => future.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Locks a mutex, ignoring poisoning. The data these mutexes guard is always left consistent.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The time elapsed since the unix epoch, or zero if the system clock is set before it.
pub fn since_epoch() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Formats bytes as lines of up to 16 hex bytes, each prefixed by its eight-digit hex offset.
pub fn hexdump(data: &[u8]) -> String {
    let mut output = String::with_capacity(data.len() * 3 + (data.len() / 16 + 1) * 11);

    for (i, line) in data.chunks(16).enumerate() {
        if i != 0 {
            output.push('\n');
        }

        let _ = write!(output, "{:08x}:", i * 16);
        for byte in line {
            let _ = write!(output, " {byte:02x}");
        }
    }

    output
}
