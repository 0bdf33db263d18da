//! Wire protocol: sequence numbers, fragment codec, reassembly.

pub mod assembler;
pub mod fragment;
pub mod sequence;

pub use assembler::{Reassembler, Reassembly};
pub use fragment::{AckToken, Fragment, FragmentKind, Message};
pub use sequence::{MessageId, SeqNumber, SequenceNumber};
