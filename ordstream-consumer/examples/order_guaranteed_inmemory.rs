/// 顺序保证消费示例（内存 broker）
/// 展示 失败 -> 按 key 暂停 -> 退避后从失败处重放 的闭环，其他 key 不受影响
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use ordstream_broker::memory::{InMemoryBroker, InMemoryBrokerConfig};
use ordstream_consumer::{
    BatchHandler, DeliverySource, OrderGuaranteedConsumer, SubscriptionConfig, SubscriptionContext,
    SubscriptionEngine,
};
use serde_json::json;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

const TOPIC: &str = "inventory-events";

// ============================================================================
// 处理器：某个 SKU 的第一次扣减失败
// ============================================================================

struct InventoryProjection {
    poisoned: Mutex<HashSet<i64>>,
    processed: Mutex<usize>,
}

#[async_trait]
impl BatchHandler for InventoryProjection {
    fn handler_name(&self) -> &str {
        "inventory-projection"
    }

    async fn on_batch(&self, ctx: &mut SubscriptionContext) -> AnyResult<()> {
        let mut blocked = HashSet::new();
        for message in ctx.messages().to_vec() {
            let sku = message.stream_id().to_string();
            if blocked.contains(&sku) || self.poisoned.lock().unwrap().remove(&message.sequence_id()) {
                println!("  ✗ seq={} sku={} (will retry)", message.sequence_id(), sku);
                blocked.insert(sku);
                ctx.nack(&message);
                continue;
            }

            let via = match message.source() {
                DeliverySource::Primary => "primary",
                DeliverySource::Replay => "replay",
            };
            println!(
                "  ✓ seq={} sku={} via {} payload={}",
                message.sequence_id(),
                sku,
                via,
                message.payload()
            );
            *self.processed.lock().unwrap() += 1;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let broker = InMemoryBroker::new(
        InMemoryBrokerConfig::builder()
            .nack_redelivery_delay(Duration::from_millis(50))
            .build(),
    );

    let skus = ["sku-apple", "sku-pear"];
    let mut total = 0;
    for (i, delta) in [-1, -2, 5, -1, -3, 2].into_iter().enumerate() {
        let sku = skus[i % skus.len()];
        let id = broker.publish(TOPIC, sku, json!({ "delta": delta })).await;
        println!("published seq={} sku={} delta={}", id.sequence_id(), sku, delta);
        total += 1;
    }

    let config = SubscriptionConfig::builder()
        .topics(vec![TOPIC.to_string()])
        .subscription_name("inventory-projection")
        .consumer_name("projection-demo")
        .batch_size(10)
        .receive_timeout(Duration::from_millis(50))
        .assignment_settle_delay(Duration::ZERO)
        .retry_backoff_policy(vec![Duration::from_millis(200), Duration::from_millis(500)])
        .build();

    let consumer = OrderGuaranteedConsumer::builder()
        .config(config)
        .client(Arc::new(broker.clone()))
        .admin(Arc::new(broker.clone()))
        .key_hash_provider(Arc::new(broker.clone()))
        .build()?;

    // seq=2 属于 sku-pear：它与其后的 seq=4、6 都要等到重放时按顺序处理
    let handler = Arc::new(InventoryProjection {
        poisoned: Mutex::new(HashSet::from([2])),
        processed: Mutex::new(0),
    });

    let engine = Arc::new(
        SubscriptionEngine::builder()
            .consumer(Arc::new(consumer))
            .handler(handler.clone())
            .build(),
    );
    let handle = engine.start();

    tokio::time::timeout(Duration::from_secs(10), async {
        while *handler.processed.lock().unwrap() < total {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    handle.shutdown();
    handle.join().await?;
    println!("processed {} messages", total);
    Ok(())
}
