#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use webcl_lifetime::{
    CompletionQueue, LifetimeConfig, NativeHandle, NativeRelease, ResourceContext, ResourceKind,
    Status,
};

/// Installs a fmt subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Driver double that records every native release.
#[derive(Default)]
pub struct RecordingDriver {
    released: Mutex<Vec<(ResourceKind, NativeHandle)>>,
    failing: Mutex<HashMap<NativeHandle, Status>>,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make releases of `native` report `status` (the release is still recorded).
    pub fn fail_with(&self, native: NativeHandle, status: Status) {
        self.failing.lock().unwrap().insert(native, status);
    }

    pub fn releases_of(&self, native: NativeHandle) -> usize {
        self.released
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, n)| *n == native)
            .count()
    }

    pub fn released(&self) -> Vec<(ResourceKind, NativeHandle)> {
        self.released.lock().unwrap().clone()
    }

    pub fn total(&self) -> usize {
        self.released.lock().unwrap().len()
    }
}

impl NativeRelease for RecordingDriver {
    fn release(&self, kind: ResourceKind, native: NativeHandle) -> Result<(), Status> {
        self.released.lock().unwrap().push((kind, native));

        match self.failing.lock().unwrap().get(&native) {
            Some(status) => Err(*status),
            None => Ok(()),
        }
    }
}

/// Fresh context over a recording driver.
pub fn context(config: LifetimeConfig) -> (ResourceContext, CompletionQueue, Arc<RecordingDriver>) {
    init_tracing();

    let driver = RecordingDriver::new();
    let (ctx, queue) = ResourceContext::with_config(driver.clone(), config);

    (ctx, queue, driver)
}

pub fn native(raw: usize) -> NativeHandle {
    NativeHandle::new(raw)
}
