pub mod bluetooth;
pub mod codec;
pub mod logging;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod persistence;
