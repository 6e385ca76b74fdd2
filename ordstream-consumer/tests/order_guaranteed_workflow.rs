use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use ordstream_broker::broker::{KeyHashRangeProvider, StaticKeyHashRangeProvider};
use ordstream_broker::error::{BrokerError, BrokerResult};
use ordstream_broker::key_hash::{KeyHashRange, KeyHashRanges, key_hash};
use ordstream_broker::memory::{InMemoryBroker, InMemoryBrokerConfig};
use ordstream_consumer::clock::{Clock, ManualClock};
use ordstream_consumer::ordered::BatchPhase;
use ordstream_consumer::{
    ConsumerError, DeadLetterPolicy, DeliverySource, MessageContext, OrderGuaranteedConsumer,
    SubscriptionConfig, TopicBatchConsumer,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "orders";

fn broker() -> InMemoryBroker {
    InMemoryBroker::new(
        InMemoryBrokerConfig::builder()
            .nack_redelivery_delay(Duration::from_millis(20))
            .build(),
    )
}

fn config(consumer_name: &str) -> SubscriptionConfig {
    SubscriptionConfig::builder()
        .topics(vec![TOPIC.to_string()])
        .subscription_name("ledger")
        .consumer_name(consumer_name)
        .receive_timeout(Duration::from_millis(20))
        .no_batch_delay(Duration::from_millis(5))
        .assignment_settle_delay(Duration::ZERO)
        .replay_read_timeout(Duration::from_millis(20))
        .retry_backoff_policy(vec![Duration::from_secs(5)])
        .build()
}

fn consumer(
    broker: &InMemoryBroker,
    config: SubscriptionConfig,
    clock: &ManualClock,
    provider: Option<Arc<dyn KeyHashRangeProvider>>,
) -> anyhow::Result<OrderGuaranteedConsumer> {
    let provider = provider.unwrap_or_else(|| Arc::new(broker.clone()));
    Ok(OrderGuaranteedConsumer::builder()
        .config(config)
        .client(Arc::new(broker.clone()))
        .admin(Arc::new(broker.clone()))
        .key_hash_provider(provider)
        .clock(Arc::new(clock.clone()))
        .build()?)
}

async fn next_non_empty(
    consumer: &OrderGuaranteedConsumer,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<MessageContext>> {
    for _ in 0..50 {
        let batch = consumer.next_batch(cancel).await?;
        if !batch.is_empty() {
            return Ok(batch);
        }
        consumer.finalize_batch(&[], &[]).await?;
    }
    anyhow::bail!("no batch after 50 attempts")
}

fn seqs(batch: &[MessageContext]) -> Vec<i64> {
    batch.iter().map(|m| m.sequence_id()).collect()
}

fn split<F>(batch: &[MessageContext], nack: F) -> (Vec<MessageContext>, Vec<MessageContext>)
where
    F: Fn(&MessageContext) -> bool,
{
    batch.iter().cloned().partition(|m| !nack(m))
}

#[tokio::test]
async fn failed_key_is_held_back_then_replayed_in_order() -> anyhow::Result<()> {
    let broker = broker();
    let clock = ManualClock::new(Utc::now());
    let consumer = consumer(&broker, config("c1"), &clock, None)?;
    let cancel = CancellationToken::new();

    broker.publish(TOPIC, "acct-1", json!({"n": 1})).await;
    broker.publish(TOPIC, "acct-2", json!({"n": 2})).await;

    // 首批：acct-1 失败
    let batch = next_non_empty(&consumer, &cancel).await?;
    assert_eq!(seqs(&batch), vec![1, 2]);
    assert_eq!(consumer.phase().await, BatchPhase::Normal);
    let (acks, nacks) = split(&batch, |m| m.stream_id() == "acct-1");
    consumer.finalize_batch(&acks, &nacks).await?;

    let state = consumer
        .failure_state()
        .tracked(TOPIC, "acct-1")
        .await
        .expect("acct-1 tracked");
    assert_eq!(state.times_retried, 0);
    assert_eq!(state.last_sequence_id, 1);
    assert_eq!(
        state.next_retry,
        Some(batch[0].publish_time() + TimeDelta::seconds(5))
    );
    assert_eq!(consumer.failure_state().tracked_stream_count().await, 1);

    // 退避期间正常阶段不投递 acct-1
    broker.publish(TOPIC, "acct-1", json!({"n": 3})).await;
    broker.publish(TOPIC, "acct-2", json!({"n": 4})).await;
    let batch = next_non_empty(&consumer, &cancel).await?;
    assert_eq!(seqs(&batch), vec![4]);
    consumer.finalize_batch(&batch, &[]).await?;

    // 到期后从失败处重放，追上末尾后解除跟踪
    clock.advance(Duration::from_secs(10));
    let batch = next_non_empty(&consumer, &cancel).await?;
    assert_eq!(consumer.phase().await, BatchPhase::FailureRetry);
    assert_eq!(seqs(&batch), vec![1, 3]);
    assert!(batch.iter().all(|m| m.source() == DeliverySource::Replay));
    assert!(batch.iter().all(|m| m.stream_id() == "acct-1"));
    consumer.finalize_batch(&batch, &[]).await?;
    assert!(consumer.failure_state().tracked(TOPIC, "acct-1").await.is_none());

    // 正常阶段恢复投递 acct-1，且不会重复投递已重放的消息
    broker.publish(TOPIC, "acct-1", json!({"n": 5})).await;
    let batch = next_non_empty(&consumer, &cancel).await?;
    assert_eq!(seqs(&batch), vec![5]);
    assert_eq!(batch[0].source(), DeliverySource::Primary);
    consumer.finalize_batch(&batch, &[]).await?;

    consumer.dispose().await?;
    consumer.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn retry_turn_without_due_keys_returns_normal_batch() -> anyhow::Result<()> {
    let broker = broker();
    let clock = ManualClock::new(Utc::now());
    let consumer = consumer(&broker, config("c1"), &clock, None)?;
    let cancel = CancellationToken::new();

    for i in 0..5 {
        broker.publish(TOPIC, &format!("acct-{i}"), json!(i)).await;
    }

    // 第一次调用即选中重放阶段，但必须在同一次调用内返回正常批次
    let batch = consumer.next_batch(&cancel).await?;
    assert_eq!(batch.len(), 5);
    assert_eq!(consumer.phase().await, BatchPhase::Normal);
    consumer.finalize_batch(&batch, &[]).await?;
    assert_eq!(consumer.failure_state().tracked_stream_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn repeated_replay_failure_backs_off_further() -> anyhow::Result<()> {
    let broker = broker();
    let clock = ManualClock::new(Utc::now());
    let config = SubscriptionConfig {
        retry_backoff_policy: Some(vec![Duration::from_secs(5), Duration::from_secs(60)]),
        ..config("c1")
    };
    let consumer = consumer(&broker, config, &clock, None)?;
    let cancel = CancellationToken::new();

    broker.publish(TOPIC, "acct-1", json!("poison")).await;
    let batch = next_non_empty(&consumer, &cancel).await?;
    consumer.finalize_batch(&[], &batch).await?;

    clock.advance(Duration::from_secs(10));
    let batch = next_non_empty(&consumer, &cancel).await?;
    assert_eq!(batch[0].source(), DeliverySource::Replay);
    consumer.finalize_batch(&[], &batch).await?;

    let state = consumer
        .failure_state()
        .tracked(TOPIC, "acct-1")
        .await
        .expect("still tracked");
    assert_eq!(state.times_retried, 1);
    assert_eq!(state.next_retry, Some(clock.now() + TimeDelta::seconds(60)));
    assert!(consumer.failure_state().streams_for_retry().await.is_empty());

    clock.advance(Duration::from_secs(61));
    assert_eq!(consumer.failure_state().streams_for_retry().await.len(), 1);
    Ok(())
}

fn key_in(range: KeyHashRange) -> String {
    (0..2_000_000)
        .map(|i| format!("acct-{i}"))
        .find(|k| range.contains(key_hash(k)))
        .expect("a key hashing into the range")
}

#[tokio::test]
async fn only_the_owning_instance_replays_a_key() -> anyhow::Result<()> {
    let broker = broker();
    let clock = ManualClock::new(Utc::now());
    let cancel = CancellationToken::new();

    let low = KeyHashRange::new(0, 100);
    let high = KeyHashRange::new(100, 200);
    let a = consumer(
        &broker,
        config("a"),
        &clock,
        Some(Arc::new(StaticKeyHashRangeProvider::new(KeyHashRanges::new([low])))),
    )?;
    let b = consumer(
        &broker,
        config("b"),
        &clock,
        Some(Arc::new(StaticKeyHashRangeProvider::new(KeyHashRanges::new([high])))),
    )?;

    // 两个实例先完成订阅，broker 按注册顺序分配哈希空间
    for c in [&a, &b] {
        let batch = c.next_batch(&cancel).await?;
        assert!(batch.is_empty());
        c.finalize_batch(&[], &[]).await?;
    }

    let key = key_in(low);
    broker.publish(TOPIC, &key, json!("first")).await;

    let batch = next_non_empty(&a, &cancel).await?;
    assert_eq!(batch[0].stream_id(), key);
    a.finalize_batch(&[], &batch).await?;

    clock.advance(Duration::from_secs(10));

    for _ in 0..4 {
        let batch = b.next_batch(&cancel).await?;
        assert!(batch.iter().all(|m| m.stream_id() != key));
        b.finalize_batch(&batch, &[]).await?;
    }
    assert!(b.failure_state().tracked(TOPIC, &key).await.is_some());

    let batch = next_non_empty(&a, &cancel).await?;
    assert_eq!(seqs(&batch), vec![1]);
    assert_eq!(batch[0].source(), DeliverySource::Replay);
    a.finalize_batch(&batch, &[]).await?;
    assert!(a.failure_state().tracked(TOPIC, &key).await.is_none());
    Ok(())
}

#[tokio::test]
async fn poisoned_message_goes_to_dead_letter_and_recovery_resumes() -> anyhow::Result<()> {
    let broker = broker();
    let clock = ManualClock::new(Utc::now());
    let config = SubscriptionConfig {
        dead_letter: Some(
            DeadLetterPolicy::builder()
                .topic("orders-dlq")
                .max_retries(1)
                .build(),
        ),
        ..config("c1")
    };
    let consumer = consumer(&broker, config, &clock, None)?;
    let cancel = CancellationToken::new();

    broker.publish(TOPIC, "acct-1", json!("poison")).await;
    broker.publish(TOPIC, "acct-1", json!("fine")).await;

    let batch = next_non_empty(&consumer, &cancel).await?;
    assert_eq!(seqs(&batch), vec![1, 2]);
    consumer.finalize_batch(&[], &batch).await?;

    clock.advance(Duration::from_secs(10));
    let batch = next_non_empty(&consumer, &cancel).await?;
    assert_eq!(seqs(&batch), vec![1, 2]);
    consumer.finalize_batch(&[], &batch).await?;

    let dead = broker.messages("orders-dlq").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].key(), "acct-1");
    assert_eq!(dead[0].payload()["sequence_id"], json!(1));
    assert_eq!(dead[0].payload()["payload"], json!("poison"));

    let batch = next_non_empty(&consumer, &cancel).await?;
    assert_eq!(seqs(&batch), vec![2]);
    assert_eq!(batch[0].source(), DeliverySource::Replay);
    consumer.finalize_batch(&batch, &[]).await?;
    assert!(consumer.failure_state().tracked(TOPIC, "acct-1").await.is_none());
    Ok(())
}

#[tokio::test]
async fn cancelled_call_returns_empty_without_side_effects() -> anyhow::Result<()> {
    let broker = broker();
    let clock = ManualClock::new(Utc::now());
    let consumer = consumer(&broker, config("c1"), &clock, None)?;
    broker.publish(TOPIC, "acct-1", json!(1)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let batch = consumer.next_batch(&cancel).await?;
    assert!(batch.is_empty());
    consumer.finalize_batch(&[], &[]).await?;
    assert_eq!(consumer.failure_state().tracked_stream_count().await, 0);
    assert_eq!(broker.acknowledged_up_to(TOPIC, "ledger").await, Some(0));
    Ok(())
}

#[tokio::test]
async fn next_batch_after_dispose_is_empty() -> anyhow::Result<()> {
    let broker = broker();
    let clock = ManualClock::new(Utc::now());
    let consumer = consumer(&broker, config("c1"), &clock, None)?;
    let cancel = CancellationToken::new();

    broker.publish(TOPIC, "acct-1", json!(1)).await;
    let batch = next_non_empty(&consumer, &cancel).await?;
    consumer.finalize_batch(&batch, &[]).await?;

    consumer.dispose().await?;
    broker.publish(TOPIC, "acct-1", json!(2)).await;
    for _ in 0..3 {
        assert!(consumer.next_batch(&cancel).await?.is_empty());
        consumer.finalize_batch(&[], &[]).await?;
    }
    Ok(())
}

#[tokio::test]
async fn closed_failure_state_log_yields_empty_batch() -> anyhow::Result<()> {
    let broker = broker();
    let clock = ManualClock::new(Utc::now());
    let consumer = consumer(&broker, config("c1"), &clock, None)?;
    let cancel = CancellationToken::new();

    // 先完成一次取批次，控制 topic 的读取器随之建立
    assert!(consumer.next_batch(&cancel).await?.is_empty());
    consumer.finalize_batch(&[], &[]).await?;

    consumer.failure_state().close().await?;
    broker.publish(TOPIC, "acct-1", json!(1)).await;
    assert!(consumer.next_batch(&cancel).await?.is_empty());
    Ok(())
}

struct UnreachableProvider;

#[async_trait]
impl KeyHashRangeProvider for UnreachableProvider {
    async fn owned_ranges(&self, _: &str, _: &str, _: &str) -> BrokerResult<KeyHashRanges> {
        Err(BrokerError::Disconnected {
            reason: "admin endpoint down".into(),
        })
    }
}

#[tokio::test]
async fn first_range_lookup_failure_is_fatal() -> anyhow::Result<()> {
    let broker = broker();
    let clock = ManualClock::new(Utc::now());
    let consumer = consumer(
        &broker,
        config("c1"),
        &clock,
        Some(Arc::new(UnreachableProvider)),
    )?;

    let err = consumer
        .next_batch(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConsumerError::Broker(BrokerError::Disconnected { .. })));
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let broker = broker();
    let clock = ManualClock::new(Utc::now());
    let config = SubscriptionConfig {
        batch_size: 0,
        ..config("c1")
    };
    assert!(matches!(
        consumer(&broker, config, &clock, None)
            .err()
            .and_then(|e| e.downcast::<ConsumerError>().ok()),
        Some(ConsumerError::InvalidConfig { .. })
    ));
}
