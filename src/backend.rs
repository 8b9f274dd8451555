//! Process-wide llama.cpp backend.
//!
//! llama.cpp must be initialized once per process before any model is loaded,
//! and freed only after the last model is gone. [`backend`] hands out a shared
//! handle: the first caller initializes the backend, later callers get the same
//! one for as long as any handle is alive. Every [`crate::Model`] holds a handle,
//! and sessions borrow their model, so the backend is released after the last
//! session and model have been dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};

use lazy_static::lazy_static;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::{LogOptions, send_logs_to_tracing};
use tracing::debug;

use crate::error::{Error, Result};

static ENGINE_LOGS: AtomicBool = AtomicBool::new(false);
static INSTALL_LOGGER: Once = Once::new();

lazy_static! {
    static ref LLAMA_BACKEND: Mutex<Weak<LlamaBackend>> = Mutex::new(Weak::new());
}

/// Forward llama.cpp's own log output to `tracing`.
///
/// Only takes effect when called before the backend is first used.
pub fn enable_engine_logs(enabled: bool) {
    ENGINE_LOGS.store(enabled, Ordering::Relaxed);
}

/// The shared backend, initialized if no handle is currently alive.
pub fn backend() -> Result<Arc<LlamaBackend>> {
    let mut slot = LLAMA_BACKEND
        .lock()
        .map_err(|_| Error::BackendInit("backend lock poisoned".into()))?;
    if let Some(backend) = slot.upgrade() {
        return Ok(backend);
    }

    INSTALL_LOGGER.call_once(|| {
        let logs = ENGINE_LOGS.load(Ordering::Relaxed);
        send_logs_to_tracing(LogOptions::default().with_logs_enabled(logs));
    });
    debug!("initializing llama.cpp backend");
    let backend = Arc::new(
        LlamaBackend::init().map_err(|e| Error::BackendInit(e.to_string()))?,
    );
    *slot = Arc::downgrade(&backend);
    Ok(backend)
}
