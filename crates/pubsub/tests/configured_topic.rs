// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end use of the public surface: a topic built from a YAML document,
//! driven through the `Topic` trait and consumed as a `Stream`.

use cull_pubsub::{Error, InMemoryTopic, Topic, TopicConfig, TopicOptions};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
struct Progress {
    done: u32,
    total: u32,
}

fn options_from_yaml(yaml: &str) -> Result<TopicOptions, Error> {
    let config: TopicConfig = serde_yaml::from_str(yaml).expect("document should parse");
    TopicOptions::try_from(config)
}

/// Scenario:
/// 1. Given a rendezvous topic configured from YAML and two registered
///    stream subscribers.
/// 2. When a progress sequence is published through the trait object.
/// 3. Then both streams yield the sequence in order and end with
///    `TopicDisposed` after disposal.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn yaml_configured_topic_streams_to_subscribers() {
    let options = options_from_yaml(
        r#"
capacity: 64
publish_buffer: 0
max_batch_wait_ms: 0
target_shard_size: 4
max_shards: 2
"#,
    )
    .expect("options should be valid");
    assert_eq!(options.capacity, 64);
    assert_eq!(options.publish_buffer, 0);
    assert_eq!(options.max_shards, 2);

    let (topic, disposer) = InMemoryTopic::<Progress>::new(options);
    let topic: Arc<dyn Topic<Progress>> = Arc::new(topic);
    let ctx = CancellationToken::new();

    // Readers report once their first item arrives, which means they are
    // registered and hold the ring for everything after it.
    let (ready_tx, mut ready_rx) = mpsc::channel::<()>(2);
    let mut readers = Vec::new();
    for _ in 0..2 {
        let mut stream = topic.subscribe(ctx.clone());
        let ready = ready_tx.clone();
        readers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut announced = false;
            while seen.len() < 10 {
                let delivery = timeout(WAIT, stream.next())
                    .await
                    .expect("stream should make progress")
                    .expect("stream should not end")
                    .expect("delivery should not fail");
                if !announced {
                    announced = true;
                    ready.send(()).await.expect("test should be waiting");
                }
                assert_eq!(delivery.undelivered(), None);
                let progress = delivery.into_value();
                assert_eq!(progress.total, 10);
                if progress.done > 0 {
                    seen.push(progress.done);
                }
            }
            (seen, stream)
        }));
    }
    drop(ready_tx);

    let mut registered = 0;
    while registered < 2 {
        topic
            .publish(&ctx, Progress { done: 0, total: 10 })
            .await
            .expect("publish should succeed");
        if let Ok(Some(())) = timeout(Duration::from_millis(5), ready_rx.recv()).await {
            registered += 1;
        }
    }
    for done in 1..=10 {
        topic
            .publish(&ctx, Progress { done, total: 10 })
            .await
            .expect("publish should succeed");
    }

    let mut streams = Vec::new();
    for reader in readers {
        let (seen, stream) = reader.await.expect("reader should not panic");
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
        streams.push(stream);
    }

    disposer.dispose();
    for mut stream in streams {
        let end = timeout(WAIT, stream.next()).await.expect("stream should end");
        assert_eq!(end.map(|item| item.map(|d| d.into_value())), Some(Err(Error::TopicDisposed)));
        assert!(stream.next().await.is_none());
    }
}

#[test]
fn invalid_yaml_values_are_reported_together() {
    let err = options_from_yaml("capacity: 0\nidle_timeout_ms: 0\n").unwrap_err();
    let Error::InvalidOptions { reason } = err else {
        panic!("expected InvalidOptions");
    };
    assert!(reason.contains("capacity"), "{reason}");
    assert!(reason.contains("idle_timeout"), "{reason}");
}

#[test]
fn invalid_options_fail_construction_without_a_runtime() {
    let result = InMemoryTopic::<u8>::try_new(TopicOptions::default().with_max_shards(0));
    assert!(matches!(result, Err(Error::InvalidOptions { .. })));
}
