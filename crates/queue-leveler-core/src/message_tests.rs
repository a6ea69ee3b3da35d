//! Tests for message types.

use super::*;

#[test]
fn test_queue_name_validation() {
    assert!(QueueName::new("application-events".to_string()).is_ok());
    assert!(QueueName::new("plots_v2".to_string()).is_ok());
    assert!(QueueName::new("district.status".to_string()).is_ok());

    assert!(QueueName::new("".to_string()).is_err());
    assert!(QueueName::new("-leading".to_string()).is_err());
    assert!(QueueName::new("trailing-".to_string()).is_err());
    assert!(QueueName::new("double--hyphen".to_string()).is_err());
    assert!(QueueName::new("has:colon".to_string()).is_err());
    assert!(QueueName::new("a".repeat(261)).is_err());
}

#[test]
fn test_queue_name_with_prefix() {
    let name = QueueName::with_prefix("prod", "applications").unwrap();
    assert_eq!(name.as_str(), "prod-applications");
}

#[test]
fn test_message_id_generation() {
    let id1 = MessageId::new();
    let id2 = MessageId::new();
    assert_ne!(id1, id2);
    assert!(!id1.as_str().is_empty());
    assert!("".parse::<MessageId>().is_err());
}

#[test]
fn test_priority_order_is_highest_first() {
    assert_eq!(
        MessagePriority::ALL,
        [
            MessagePriority::Critical,
            MessagePriority::High,
            MessagePriority::Normal,
            MessagePriority::Low
        ]
    );
    assert!(MessagePriority::Critical < MessagePriority::Low);
    assert_eq!(MessagePriority::default(), MessagePriority::Normal);
}

#[test]
fn test_priority_parsing() {
    assert_eq!(
        "Critical".parse::<MessagePriority>().unwrap(),
        MessagePriority::Critical
    );
    assert_eq!("low".parse::<MessagePriority>().unwrap(), MessagePriority::Low);
    assert!("urgent".parse::<MessagePriority>().is_err());
}

#[test]
fn test_timestamp_arithmetic() {
    let start = Timestamp::now();
    let later = start.add_duration(Duration::from_secs(90));

    assert_eq!(later.duration_since(&start), Duration::from_secs(90));
    assert_eq!(start.duration_since(&later), Duration::ZERO);
    assert!((later.as_score() - start.as_score() - 90.0).abs() < 0.001);
}

#[test]
fn test_timestamp_add_saturates() {
    let far = Timestamp::now().add_duration(Duration::from_secs(u64::MAX));
    assert!(far > Timestamp::now());
}

#[test]
fn test_queue_message_from_options() {
    let options = SendOptions::new()
        .with_priority(MessagePriority::High)
        .with_correlation_id("corr-1".to_string())
        .with_reply_to("replies".to_string())
        .with_label("application.created".to_string())
        .with_time_to_live(Duration::from_secs(60))
        .with_property("tenant".to_string(), "north".to_string());

    let message = QueueMessage::new("payload".to_string(), &options);

    assert_eq!(message.body, "payload");
    assert_eq!(message.priority, MessagePriority::High);
    assert_eq!(message.delivery_count, 0);
    assert!(message.dequeue_time.is_none());
    assert_eq!(message.correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(message.reply_to.as_deref(), Some("replies"));
    assert_eq!(message.label.as_deref(), Some("application.created"));
    assert_eq!(message.properties.get("tenant"), Some(&"north".to_string()));

    let expires_at = message.expires_at.expect("ttl should derive expires_at");
    assert_eq!(
        expires_at.duration_since(&message.enqueued_time),
        Duration::from_secs(60)
    );
}

#[test]
fn test_queue_message_expiry() {
    let options = SendOptions::new().with_time_to_live(Duration::from_millis(1));
    let message = QueueMessage::new(1u32, &options);

    let now = message.enqueued_time;
    assert!(!message.is_expired_at(&now));
    assert!(message.is_expired_at(&now.add_duration(Duration::from_millis(10))));

    let no_ttl = QueueMessage::new(1u32, &SendOptions::new());
    assert!(!no_ttl.is_expired_at(&now.add_duration(Duration::from_secs(3600))));
}

#[test]
fn test_queue_message_serde_round_trip_keeps_properties() {
    let options = SendOptions::new().with_property("k".to_string(), "v".to_string());
    let message = QueueMessage::new(serde_json::json!({"plot": 7}), &options);

    let raw = serde_json::to_string(&message).unwrap();
    let parsed: QueueMessage<serde_json::Value> = serde_json::from_str(&raw).unwrap();

    assert_eq!(parsed, message);
}

#[test]
fn test_send_options_with_delay() {
    let before = Timestamp::now();
    let options = SendOptions::new().with_delay(Duration::from_secs(30));
    let after = Timestamp::now();

    let scheduled = options.delay_until.unwrap();
    assert!(scheduled >= before.add_duration(Duration::from_secs(30)));
    assert!(scheduled <= after.add_duration(Duration::from_secs(30)));
}

#[test]
fn test_receipt_handle_expiry() {
    let now = Timestamp::now();
    let id = MessageId::new();
    let receipt = ReceiptHandle::new(
        "entry".to_string(),
        id.clone(),
        now,
        now.add_duration(Duration::from_secs(300)),
    );

    assert!(!receipt.is_expired());
    assert!(receipt.time_until_expiry() > Duration::from_secs(240));
    assert_eq!(receipt.entry(), "entry");
    assert_eq!(receipt.message_id(), &id);
}
