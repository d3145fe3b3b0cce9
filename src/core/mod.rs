//! Identity atoms and the op message model.

mod identity;
mod message;
mod partition;

pub use identity::ClientId;
pub use message::{
    CodecError, MAX_OP_MESSAGE_BYTES, OP_FLUSH_NOTIFICATION, OP_FLUSH_REQUEST, OP_PUT,
    OP_REMOVE_ANY, OpMessage,
};
pub use partition::TopicPartition;
