//! In-memory port and virtual-interface doubles for tests
//!
//! [`MockPorts`] records every stop/configure/start call and keeps the
//! buffers it accepted until the test takes them. [`MockVif`] lets a test
//! play the kernel side of a virtual interface.

mod ports;
mod vif;

pub use ports::{MockPorts, PortCall};
pub use vif::{MockVif, MockVifBackend, VifRequest, mock_vif};
