#![doc = include_str!("../README.md")]

pub mod codec;
pub mod consumer;
pub mod dispatch;
pub mod envelope;
pub mod publish;
pub mod transport;

#[doc(inline)]
pub use envelope::{Envelope, MqHeader, PublishTarget};

#[doc(inline)]
pub use codec::{Codec, CodecError, JsonCodec};

#[doc(inline)]
pub use publish::{Publisher, PublishError, PublishErrorKind, RoutedMessage};

#[doc(inline)]
pub use transport::{ChannelError, IncomingDelivery, MessageProperties, MqChannel};

#[doc(inline)]
pub use consumer::{
    BatchConsumer, BatchDisposition, BatchLogic, ConsumerLogic, ConsumerRegistry, LogicError,
    LogicScope, QueueDescriptor, RegistryError, SingleConsumer,
};

#[doc(inline)]
pub use dispatch::{
    AckDecision, ConsumerHook, ConsumerHost, DefaultConsumerHook, DispatchOutcome, HostRunError,
};
