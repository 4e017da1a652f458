//! Messages exchanged between mbatchd, sbatchd and local clients.

pub mod codec;
pub mod commit;
pub mod message;

pub use codec::{Packet, PacketCodec};
pub use commit::{AckVerdict, PipelineStage};
pub use message::{Message, Opcode, ReplyCode};
