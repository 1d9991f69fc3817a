pub use byteorder::{BE, LE};
pub use byteorder::NativeEndian as NE;

pub mod endian;
pub use endian::Endian;

pub mod order;
pub use order::Order;
