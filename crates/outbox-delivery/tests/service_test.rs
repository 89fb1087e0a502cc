//! Validation and persistence through the service facade.

use anyhow::Result;
use outbox_core::{MessageStatus, NewCron, NewMessage, QueueId};
use outbox_delivery::DeliveryError;
use outbox_testing::{MessageBuilder, QueueBuilder, TestEnv};

#[tokio::test]
async fn create_queue_applies_defaults() -> Result<()> {
    let env = TestEnv::new().await;
    let service = env.service()?;

    let queue = service.create_queue(QueueBuilder::new(env.callback_url("/hook")).input()).await?;

    assert_eq!(queue.method, "POST");
    assert_eq!(queue.max_retries, outbox_core::DEFAULT_MAX_RETRIES);
    assert_eq!(service.find_queue(queue.id).await?, queue);
    Ok(())
}

#[tokio::test]
async fn create_queue_rejects_zero_retries() -> Result<()> {
    let env = TestEnv::new().await;
    let service = env.service()?;

    let result = service
        .create_queue(QueueBuilder::new(env.callback_url("/hook")).max_retries(0).input())
        .await;

    assert!(matches!(result, Err(DeliveryError::Validation { .. })));
    Ok(())
}

#[tokio::test]
async fn create_queue_rejects_unknown_dead_letter_queue() -> Result<()> {
    let env = TestEnv::new().await;
    let service = env.service()?;

    let result = service
        .create_queue(
            QueueBuilder::new(env.callback_url("/hook")).dead_letter_queue(QueueId::new()).input(),
        )
        .await;

    assert!(matches!(result, Err(DeliveryError::Validation { .. })));
    Ok(())
}

#[tokio::test]
async fn enqueue_requires_existing_queue() -> Result<()> {
    let env = TestEnv::new().await;
    let service = env.service()?;

    let result = service.enqueue(vec![NewMessage::new(QueueId::new())]).await;

    assert!(matches!(result, Err(DeliveryError::NotFound { .. })));
    assert!(env.storage.all_messages().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn enqueue_rejects_empty_batch() -> Result<()> {
    let env = TestEnv::new().await;
    let result = env.service()?.enqueue(Vec::new()).await;
    assert!(matches!(result, Err(DeliveryError::Validation { .. })));
    Ok(())
}

#[tokio::test]
async fn enqueue_defaults_due_time_to_now() -> Result<()> {
    let env = TestEnv::new().await;
    let service = env.service()?;
    let queue = env.create_queue(QueueBuilder::new(env.callback_url("/hook"))).await?;

    let messages = service
        .enqueue(vec![
            MessageBuilder::new(queue.id).input(),
            MessageBuilder::new(queue.id).due_at(env.now() + chrono::Duration::hours(1)).input(),
        ])
        .await?;

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].when, env.now());
    assert_eq!(messages[0].status(), MessageStatus::Pending);
    assert_eq!(service.messages_for_queue(queue.id, 10).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn invalid_cron_is_rejected_before_persisting() -> Result<()> {
    let env = TestEnv::new().await;
    let service = env.service()?;
    let queue = env.create_queue(QueueBuilder::new(env.callback_url("/hook"))).await?;

    let result = service.create_cron(NewCron::new(queue.id, "hello world")).await;

    match result {
        Err(DeliveryError::InvalidCron { expression, .. }) => assert_eq!(expression, "hello world"),
        other => panic!("expected invalid cron error, got {other:?}"),
    }
    assert!(env.storage.all_messages().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn cron_on_unknown_queue_is_rejected() -> Result<()> {
    let env = TestEnv::new().await;
    let result = env.service()?.create_cron(NewCron::new(QueueId::new(), "* * * * *")).await;
    assert!(matches!(result, Err(DeliveryError::NotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn five_field_cron_fires_on_minute_boundaries() -> Result<()> {
    let env = TestEnv::new().await;
    let queue = env.create_queue(QueueBuilder::new(env.callback_url("/hook"))).await?;

    let (cron, first) = env.service()?.create_cron(NewCron::new(queue.id, " */5 * * * * ")).await?;

    assert_eq!(cron.schedule, "*/5 * * * *");
    assert_eq!(first.cron_id, Some(cron.id));
    assert!(first.when > env.now());
    assert_eq!(first.when.timestamp() % 300, 0);
    Ok(())
}

#[tokio::test]
async fn cron_saved_elsewhere_gets_first_message() -> Result<()> {
    let env = TestEnv::new().await;
    let service = env.service()?;
    let queue = env.create_queue(QueueBuilder::new(env.callback_url("/hook"))).await?;
    let (cron, _) = service.create_cron(NewCron::new(queue.id, "0 0 * * * *")).await?;

    let again = service.on_cron_saved(&cron).await?;

    assert_eq!(again.cron_id, Some(cron.id));
    assert_eq!(env.storage.messages_for_cron(cron.id).await.len(), 2);

    let mut broken = cron.clone();
    broken.schedule = "61 * * * *".to_string();
    assert!(matches!(service.on_cron_saved(&broken).await, Err(DeliveryError::InvalidCron { .. })));
    Ok(())
}

#[tokio::test]
async fn lookups_report_missing_records() -> Result<()> {
    let env = TestEnv::new().await;
    let service = env.service()?;

    assert!(matches!(
        service.find_queue(QueueId::new()).await,
        Err(DeliveryError::NotFound { .. })
    ));
    assert!(matches!(
        service.messages_for_queue(QueueId::new(), 10).await,
        Err(DeliveryError::NotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn health_check_reports_storage_errors() -> Result<()> {
    let env = TestEnv::new().await;
    let service = env.service()?;

    service.health_check().await?;
    env.storage.inject_health_error("down").await;

    assert!(matches!(service.health_check().await, Err(DeliveryError::DatabaseError { .. })));
    Ok(())
}
