pub mod channel;
pub mod dictionary;
pub mod event;

pub use channel::VmChannel;
pub use dictionary::ChannelDictionary;
pub use event::{ChangeType, PodChangeKind, VmEvent};
