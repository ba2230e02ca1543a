//! Card encoding: on-card layout, reader commands, and drivers.

pub mod apdu;
pub mod driver;
pub mod layout;
#[cfg(feature = "pcsc")]
pub mod pcsc;
pub mod reader;
pub mod simulated;

pub use driver::{
    CardDriver, DeviceInfo, DeviceStatus, DriverSelectError, EncodeResult, select_driver,
};
pub use layout::{CardLayout, CardPayload};
pub use reader::{ReaderConfig, ReaderDriver};
pub use simulated::SimulatedDriver;
