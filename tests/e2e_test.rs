//! End-to-end delivery scenarios through the full service stack.
//!
//! Services are built the same way the binary builds them, but over the
//! in-memory storage, lock table and wake channel from `outbox-testing`, so
//! no database is needed.

use std::time::Duration;

use anyhow::Result;
use outbox_core::{MessageStatus, NewCron};
use outbox_delivery::Role;
use outbox_testing::{eventually, init_tracing, MessageBuilder, QueueBuilder, TestEnv};
use wiremock::{
    matchers::{header, method, path},
    Mock, ResponseTemplate,
};

#[tokio::test]
async fn message_is_delivered_immediately() -> Result<()> {
    init_tracing();
    let env = TestEnv::new().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.http_mock)
        .await;
    let service = env.leader().await?;
    let queue = service
        .create_queue(
            QueueBuilder::new(env.callback_url("/orders"))
                .header("content-type", "application/json")
                .input(),
        )
        .await?;

    let messages = service
        .enqueue(vec![MessageBuilder::new(queue.id).json_body(&serde_json::json!({"id": 1})).input()])
        .await?;

    eventually("delivery", || async {
        env.message(&messages[0]).await.is_ok_and(|m| m.status() == MessageStatus::Delivered)
    })
    .await?;
    let delivered = env.message(&messages[0]).await?;
    assert_eq!(delivered.retries, 0);
    assert_eq!(delivered.sent_at, Some(env.now()));
    assert_eq!(service.stats().await.delivered, 1);

    service.stop().await;
    env.http_mock.verify().await;
    Ok(())
}

#[tokio::test]
async fn failing_message_is_retried_then_dead_lettered() -> Result<()> {
    init_tracing();
    let env = TestEnv::new().await;
    Mock::given(path("/flaky")).respond_with(ResponseTemplate::new(503)).mount(&env.http_mock).await;
    Mock::given(path("/dlq")).respond_with(ResponseTemplate::new(200)).mount(&env.http_mock).await;
    let service = env.leader().await?;
    let dlq = service.create_queue(QueueBuilder::new(env.callback_url("/dlq")).name("dlq").input()).await?;
    let queue = service
        .create_queue(
            QueueBuilder::new(env.callback_url("/flaky"))
                .max_retries(1)
                .dead_letter_queue(dlq.id)
                .input(),
        )
        .await?;

    let messages = service.enqueue(vec![MessageBuilder::new(queue.id).body("payload").input()]).await?;
    let original = &messages[0];

    eventually("first attempt fails", || async {
        env.message(original).await.is_ok_and(|m| m.retries == 1 && m.is_pending())
    })
    .await?;
    assert_eq!(env.message(original).await?.when, env.now() + chrono::Duration::milliseconds(100));

    env.advance(Duration::from_millis(100)).await;
    eventually("retries exhausted", || async {
        env.message(original).await.is_ok_and(|m| m.status() == MessageStatus::Failed)
    })
    .await?;

    eventually("dead-letter copy delivered", || async {
        service.messages_for_queue(dlq.id, 10).await.is_ok_and(|copies| {
            copies.len() == 1 && copies[0].status() == MessageStatus::Delivered
        })
    })
    .await?;
    let copies = service.messages_for_queue(dlq.id, 10).await?;
    assert_eq!(copies[0].body.as_deref(), Some("payload"));
    assert_eq!(copies[0].dead_letter_hops, 1);

    service.stop().await;
    Ok(())
}

#[tokio::test]
async fn cron_fires_once_per_second_with_one_successor_each() -> Result<()> {
    init_tracing();
    let env = TestEnv::new().await;
    Mock::given(path("/tick")).respond_with(ResponseTemplate::new(200)).mount(&env.http_mock).await;
    let service = env.leader().await?;
    let queue = service.create_queue(QueueBuilder::new(env.callback_url("/tick")).input()).await?;

    let (cron, first) = service.create_cron(NewCron::new(queue.id, "* * * * * *")).await?;
    assert!(first.when > env.now());
    assert!(first.when <= env.now() + chrono::Duration::seconds(1));

    env.advance(Duration::from_secs(1)).await;
    eventually("first tick", || async {
        let chain = env.storage.messages_for_cron(cron.id).await;
        chain.len() == 2 && chain.iter().filter(|m| m.is_pending()).count() == 1
    })
    .await?;

    env.advance(Duration::from_secs(1)).await;
    eventually("second tick", || async {
        let chain = env.storage.messages_for_cron(cron.id).await;
        chain.len() == 3 && chain.iter().filter(|m| m.is_pending()).count() == 1
    })
    .await?;

    let chain = env.storage.messages_for_cron(cron.id).await;
    let mut sent: Vec<_> = chain.iter().filter_map(|m| m.sent_at).collect();
    sent.sort();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1] - sent[0], chrono::Duration::seconds(1));

    service.stop().await;
    Ok(())
}

#[tokio::test]
async fn second_instance_takes_over_within_one_poll_interval() -> Result<()> {
    init_tracing();
    let env = TestEnv::new().await;
    Mock::given(path("/hook")).respond_with(ResponseTemplate::new(200)).mount(&env.http_mock).await;
    let first = env.leader().await?;
    let second = env.service()?;
    second.start().await;
    env.advance(env.config().poll_interval).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(first.role(), Role::Leader);
    assert_eq!(second.role(), Role::Follower);

    let queue = second.create_queue(QueueBuilder::new(env.callback_url("/hook")).input()).await?;
    first.stop().await;
    let messages = second.enqueue(vec![MessageBuilder::new(queue.id).input()]).await?;

    env.advance(env.config().poll_interval).await;
    eventually("second instance leads", || async { second.role() == Role::Leader }).await?;
    eventually("delivery after failover", || async {
        env.message(&messages[0]).await.is_ok_and(|m| m.status() == MessageStatus::Delivered)
    })
    .await?;
    assert_eq!(env.request_count().await, 1);

    second.stop().await;
    Ok(())
}
