// ============================================================================
// Notification Pipeline Integration Tests
// ============================================================================
//
// Stored message -> MessageNotifier -> notify queue -> ConsumerLoop ->
// Aggregator -> pop for delivery, all on the in-process broker.
//
// ============================================================================

mod test_utils;

use anyhow::Result;
use async_trait::async_trait;
use courier_config::ConnectStrategy;
use courier_shared::{
    Aggregator, ConsumerLoop, MemoryBroker, MessageNotifier, NotifyHandler, NotifyPublisher,
    PersistedMessage, RecipientDirectory, ResilientChannel,
};
use courier_types::{BotId, ChatId, MessageSource, UserId};
use std::time::Duration;
use test_utils::{QUEUE, consumer_config, eventually, message, settings};

struct TwoChats;

#[async_trait]
impl RecipientDirectory for TwoChats {
    async fn recipients_for_chat(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        Ok(match chat_id {
            10 => vec![1, 2],
            20 => vec![2, 3],
            _ => Vec::new(),
        })
    }

    async fn bot_for_chat(&self, chat_id: ChatId) -> Result<Option<BotId>> {
        Ok(match chat_id {
            10 => Some(100),
            20 => Some(200),
            _ => None,
        })
    }
}

#[tokio::test]
async fn test_stored_messages_reach_recipients() {
    let broker = MemoryBroker::new();
    let publisher = NotifyPublisher::open(broker.clone(), settings(ConnectStrategy::Eager, 3))
        .await
        .unwrap();
    let notifier = MessageNotifier::new(TwoChats, publisher);

    let aggregator = Aggregator::new();
    let consumer = ConsumerLoop::new(
        ResilientChannel::new(broker.clone(), settings(ConnectStrategy::Eager, 3)),
        NotifyHandler::new(aggregator.clone()),
        &consumer_config(),
    );
    let stop = consumer.stop_handle();
    let running = tokio::spawn(consumer.run());

    let published = [
        PersistedMessage::new(10, MessageSource::Messenger { bot_id: 100 }, message(1)),
        PersistedMessage::new(20, MessageSource::Web { operator_id: 3 }, message(2)),
        PersistedMessage::new(10, MessageSource::Web { operator_id: 1 }, message(3)),
    ];
    for persisted in published {
        assert!(notifier.on_message_added(persisted).await.unwrap());
    }

    // a chat nobody follows produces no publish at all
    let orphan = PersistedMessage::new(30, MessageSource::Messenger { bot_id: 300 }, message(4));
    assert!(!notifier.on_message_added(orphan).await.unwrap());

    assert!(eventually(Duration::from_secs(2), || broker.acked(QUEUE) == 3).await);
    stop.stop();
    running.await.unwrap().unwrap();

    // user 1: bot 100 chat 10, messages 1 and 3 (3 was written by them)
    let first = aggregator.pop_for(1).await.unwrap();
    assert_eq!(first.message_count(), 2);

    // user 2: bot 100 chat 10 (messages 1, 3) and bot 200 chat 20 (message 2)
    let second = aggregator.pop_for(2).await.unwrap();
    assert_eq!(second.updates.keys().collect::<Vec<_>>(), vec![100, 200]);
    let chat = second.get_for(100).unwrap().get_for(10).unwrap();
    assert_eq!(chat.messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 3]);

    // user 3 wrote message 2 and still gets it
    let third = aggregator.pop_for(3).await.unwrap();
    let chat = third.get_for(200).unwrap().get_for(20).unwrap();
    assert_eq!(chat.messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);
    assert!(aggregator.drain().await.is_empty());
}
