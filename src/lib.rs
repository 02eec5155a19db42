#[macro_use]
extern crate log;

mod channel;
mod codec;
mod conn;
mod error;
mod keylog;
mod keymat;
pub mod crypto;
pub mod kex;
pub mod msg;
pub mod negotiate;
pub mod reassembly;
pub mod wire;

pub use self::channel::{Channel, ChannelHandler, ChannelMux};
pub use self::codec::{DecryptStatus, DecryptedRecord, TransportCodec};
pub use self::conn::{
    Annotation, Direction, FeedOutcome, FlowDissector, Phase, ProtocolVersion, Record, SshEvent,
};
pub use self::error::Error;
pub use self::keylog::{KeylogSource, MatchedPeer, Secret};
pub use self::keymat::{KeyMaterial, MAX_KEY_MATERIAL};
pub use self::reassembly::{ChannelConsumer, Consume, StreamReassembler};
