//! Process-wide device context
//!
//! Hosting processes that want a single context call [`initialize`] from
//! their startup sequence and [`shutdown`] from their teardown; code in
//! between reaches the context through [`context`].

use crate::config::DeviceConfig;
use crate::context::DeviceContext;
use crate::error::{Error, Result};
use devcache_backends::ComputeApi;
use parking_lot::Mutex;

static GLOBAL: Mutex<Option<DeviceContext>> = parking_lot::const_mutex(None);

/// Open the process-wide context from `config`
///
/// Returns [`Error::InvalidState`] if one is already installed.
pub fn initialize(config: &DeviceConfig) -> Result<DeviceContext> {
    install(|| DeviceContext::from_config(config))
}

/// Open the process-wide context on an explicit backend
pub fn initialize_with(api: Box<dyn ComputeApi + Send>) -> Result<DeviceContext> {
    install(|| DeviceContext::initialize(api))
}

fn install(open: impl FnOnce() -> Result<DeviceContext>) -> Result<DeviceContext> {
    let mut slot = GLOBAL.lock();
    if slot.is_some() {
        return Err(Error::invalid_state("global device context is already initialized"));
    }
    let ctx = open()?;
    *slot = Some(ctx.clone());
    Ok(ctx)
}

/// The installed context
pub fn context() -> Result<DeviceContext> {
    GLOBAL
        .lock()
        .clone()
        .ok_or_else(|| Error::invalid_state("global device context is not initialized"))
}

pub fn is_initialized() -> bool {
    GLOBAL.lock().is_some()
}

/// Shut down and uninstall the process-wide context
///
/// If the device refuses to free the context it stays installed so that
/// shutdown can be retried.
pub fn shutdown() -> Result<()> {
    let mut slot = GLOBAL.lock();
    let ctx = slot
        .take()
        .ok_or_else(|| Error::invalid_state("global device context is not initialized"))?;
    if let Err(err) = ctx.shutdown() {
        *slot = Some(ctx);
        return Err(err);
    }
    Ok(())
}
