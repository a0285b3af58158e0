//! Lock wrappers used throughout the runtime.
//!
//! A thin layer over `parking_lot` so call sites look the same however the
//! underlying lock crate is chosen, mirroring the shape of RustPython's own
//! `rustpython_common::lock` module.

pub use parking_lot::{Condvar, MutexGuard, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
pub struct PyMutex<T>(parking_lot::Mutex<T>);

impl<T> PyMutex<T> {
    pub const fn new(value: T) -> Self {
        Self(parking_lot::Mutex::new(value))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PyMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PyMutex").field(&self.0).finish()
    }
}

#[derive(Default)]
pub struct PyRwLock<T>(parking_lot::RwLock<T>);

impl<T> PyRwLock<T> {
    pub const fn new(value: T) -> Self {
        Self(parking_lot::RwLock::new(value))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PyRwLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PyRwLock").field(&self.0).finish()
    }
}
