//! BACnet Fieldbus Seam
//!
//! The engine talks to the field network only through [`FieldbusClient`]. A
//! concrete stack (encoding, transport, address cache) lives behind that
//! trait; [`SimulatedNetwork`] is the in-memory implementation used by the
//! tests and the binary's simulate mode.

mod properties;
mod protocol;
mod sim;
mod value;

pub use properties::{
    DEVICE_PROPERTIES, OBJECT_PROPERTIES, PERIODIC_PROPERTIES, READ_MULTIPLE_SERVICE_BIT,
    SUBSCRIBABLE_TYPES, is_subscribable,
};
pub use protocol::{
    Announce, CovNotification, CovRequest, FieldbusClient, ProtocolError, ReadAccessResult,
    ReadAccessSpec, ReadResult,
};
pub use sim::{RecordedWrite, SimDevice, SimulatedNetwork};
pub use value::{RawValue, round_real, sanitize};
