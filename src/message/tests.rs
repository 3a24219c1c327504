use super::*;

#[test]
fn test_async_message_omits_sync_fields() {
    let msg = Message::new("orders", "{\"id\":1}");
    assert!(!msg.is_sync());

    let text = String::from_utf8(msg.serialize().unwrap()).unwrap();
    assert!(!text.contains("sync_token"));
    assert!(!text.contains("response"));
}

#[test]
fn test_deserialize_defaults_missing_fields() {
    let msg = Message::deserialize(br#"{"topic":"orders"}"#).unwrap();
    assert_eq!(msg.topic, "orders");
    assert_eq!(msg.payload, "");
    assert!(!msg.is_sync());
    assert!(!msg.response);
}

#[test]
fn test_deserialize_rejects_garbage() {
    let err = Message::deserialize(b"not json").unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn test_reply_keeps_topic_and_token() {
    let request = Message::new_sync("prices", "AAPL", "t-1");
    let reply = request.reply("189.5");
    assert_eq!(reply.topic, "prices");
    assert_eq!(reply.sync_token, "t-1");
    assert!(reply.response);
}

#[test]
fn test_failure_into_result() {
    let err = Message::failure("t", "boom").into_result().unwrap_err();
    assert!(matches!(err, Error::Remote(reason) if reason == "boom"));

    let ok = Message::success("t", "fine").into_result().unwrap();
    assert_eq!(ok.payload, "fine");
}

#[test]
fn test_batch_payload() {
    let replies = vec![
        Message::new("a", "1").reply("x"),
        Message::new("a", "2").reply("y"),
    ];
    let payload = Message::serialize_batch(&replies).unwrap();
    let decoded = Message::deserialize_batch(&payload).unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[1].payload, "y");
}

#[test]
fn test_topics_payload() {
    let topics = vec!["orders".to_string(), "prices".to_string()];
    let payload = encode_topics(&topics).unwrap();
    assert_eq!(payload, r#"["orders","prices"]"#);
    assert_eq!(decode_topics(&payload).unwrap(), topics);
    assert!(decode_topics("orders").is_err());
}

#[test]
fn test_new_token_is_unique() {
    assert_ne!(Message::new_token(), Message::new_token());
}
