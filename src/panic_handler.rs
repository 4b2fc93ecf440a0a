//! Panic hook that reports panics through `tracing`
//!
//! Panics inside processors are caught by the pipeline and treated as stage
//! failures, but the hook still runs first, so every panic is logged with its
//! location and counted here.

use parking_lot::{const_mutex, Mutex};
use std::panic::{self, PanicInfo};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{error, warn};

static PANIC_HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);
static LAST_PANIC: Mutex<Option<(String, String)>> = const_mutex(None);

#[derive(Debug, Clone)]
pub struct PanicStats {
    pub total_panics: u64,
    pub last_panic_location: Option<String>,
    pub last_panic_message: Option<String>,
}

/// Install the hook once; later calls are no-ops
pub fn install_panic_hook() {
    if PANIC_HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        warn!("Panic hook already installed, skipping");
        return;
    }

    panic::set_hook(Box::new(|panic_info| {
        handle_panic(panic_info);
    }));

    tracing::info!("Panic hook installed");
}

fn handle_panic(panic_info: &PanicInfo) {
    let location = panic_info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "unknown location".to_string());

    let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic message".to_string()
    };

    PANIC_COUNT.fetch_add(1, Ordering::SeqCst);

    error!(
        location = %location,
        thread = std::thread::current().name().unwrap_or("unnamed"),
        "Panic occurred: {}",
        message
    );

    *LAST_PANIC.lock() = Some((location, message));
}

pub fn is_panic_hook_installed() -> bool {
    PANIC_HOOK_INSTALLED.load(Ordering::SeqCst)
}

pub fn panic_stats() -> PanicStats {
    let last = LAST_PANIC.lock().clone();
    PanicStats {
        total_panics: PANIC_COUNT.load(Ordering::SeqCst),
        last_panic_location: last.as_ref().map(|(location, _)| location.clone()),
        last_panic_message: last.map(|(_, message)| message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_hook_installation_is_idempotent() {
        install_panic_hook();
        assert!(is_panic_hook_installed());

        install_panic_hook();
        assert!(is_panic_hook_installed());
    }

    #[test]
    fn test_caught_panic_is_counted() {
        install_panic_hook();
        let before = panic_stats().total_panics;

        let result = std::panic::catch_unwind(|| panic!("counted panic"));
        assert!(result.is_err());

        let stats = panic_stats();
        assert!(stats.total_panics > before);
        assert!(stats.last_panic_location.is_some());
    }
}
