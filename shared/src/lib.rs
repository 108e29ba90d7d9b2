// ============================================================================
// Courier Shared - notification pipeline
// ============================================================================
//
// persisted message -> fanout -> NotifyPublisher -> broker queue `notify`
//                   -> ConsumerLoop -> NotifyHandler -> Aggregator
//                   -> delivery worker pops a recipient's batch
//
// Modules:
// - broker:     transport seam (AMQP via lapin, in-process memory broker)
// - channel:    resilient connection/channel with bounded-retry connect
// - publisher:  persistent, confirmed publishes of batch sets
// - consumer:   manual-ack consumer loop, cooperative or on its own thread
// - aggregator: pending notifications per recipient
// - fanout:     builds batch sets from stored messages
//
// ============================================================================

pub mod aggregator;
pub mod broker;
pub mod channel;
pub mod consumer;
pub mod error;
pub mod fanout;
pub mod publisher;

pub use aggregator::{Aggregator, NotifyHandler};
pub use broker::{AmqpBroker, Broker, BrokerChannel, BrokerError, Delivery, MemoryBroker};
pub use channel::{ChannelSettings, ChannelState, ResilientChannel};
pub use consumer::{ConsumerLoop, ConsumerThread, DeliveryHandler, StopHandle};
pub use error::{ChannelError, ConsumerError, HandlerError, PublishError};
pub use fanout::{MessageNotifier, PersistedMessage, RecipientDirectory, build_batch_set};
pub use publisher::{NotifyPublisher, Payload};
