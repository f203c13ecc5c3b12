pub mod parser;
pub mod reader;

pub use reader::{find_serial_port, run_serial_reader, SerialDevice, SerialSettings};
