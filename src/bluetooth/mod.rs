pub mod frame;
pub mod link;
pub mod relay;

pub use link::{BleRelay, RelayTarget};
pub use relay::DutyCycleController;
