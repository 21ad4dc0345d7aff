//! Capture files and trajectory output.

pub mod packet;
pub mod trajectory;

pub use packet::{Packet, PacketHeader, PacketReader, PacketWriter};
pub use trajectory::TrajectoryWriter;
