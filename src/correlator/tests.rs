use std::time::Duration;

use super::{Correlator, CorrelatorSettings};
use crate::utils::error::Error;

#[tokio::test]
async fn test_single_response_retires_entry() {
    let correlator = Correlator::<String>::default();
    let mut pending = correlator.new_request("t1", 1, None).unwrap();
    assert!(correlator.contains("t1"));

    correlator.add_response("t1", "pong".to_string()).unwrap();
    assert!(!correlator.contains("t1"));
    assert_eq!(pending.next().await.as_deref(), Some("pong"));
    assert_eq!(pending.next().await, None);
    assert!(pending.is_complete());

    // late response after retirement
    assert!(matches!(
        correlator.add_response("t1", "late".to_string()),
        Err(Error::InvalidToken(_))
    ));
}

#[tokio::test]
async fn test_scatter_gather_collects_up_to_limit() {
    let correlator = Correlator::<u32>::default();
    let pending = correlator.new_request("t", 3, None).unwrap();
    for n in 0..3 {
        correlator.add_response("t", n).unwrap();
    }
    let responses = pending.collect().await;
    assert_eq!(responses, vec![0, 1, 2]);
    assert!(correlator.is_empty());
}

#[tokio::test]
async fn test_timeout_closes_channel_short_of_limit() {
    let correlator = Correlator::<u32>::default();
    let mut pending = correlator
        .new_request("t", 3, Some(Duration::from_millis(20)))
        .unwrap();
    correlator.add_response("t", 7).unwrap();

    assert_eq!(pending.next().await, Some(7));
    assert_eq!(pending.next().await, None);
    assert_eq!(pending.received(), 1);
    assert!(!pending.is_complete());
    assert!(!correlator.contains("t"));
}

#[tokio::test]
async fn test_stale_timer_does_not_retire_reused_token() {
    let correlator = Correlator::<u32>::default();
    let first = correlator
        .new_request("t", 1, Some(Duration::from_millis(30)))
        .unwrap();
    correlator.abort("t").unwrap();
    drop(first);

    let _second = correlator.new_request("t", 1, None).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(correlator.contains("t"));
}

#[test]
fn test_token_collision_and_bounds() {
    let settings = CorrelatorSettings {
        min_token_length: 2,
        max_token_length: 4,
        max_active_requests: 2,
    };
    let correlator = Correlator::<()>::new(settings);

    assert!(matches!(
        correlator.new_request("a", 1, None),
        Err(Error::InvalidToken(_))
    ));
    assert!(matches!(
        correlator.new_request("abcde", 1, None),
        Err(Error::InvalidToken(_))
    ));

    let _one = correlator.new_request("ab", 1, None).unwrap();
    assert!(matches!(
        correlator.new_request("ab", 1, None),
        Err(Error::TokenCollision(_))
    ));
    let _two = correlator.new_request("abc", 1, None).unwrap();
    assert!(matches!(
        correlator.new_request("abcd", 1, None),
        Err(Error::TooManyRequests)
    ));

    let mut tokens = correlator.active_tokens();
    tokens.sort();
    assert_eq!(tokens, vec!["ab", "abc"]);
}

#[test]
fn test_zero_limit_is_rejected() {
    let correlator = Correlator::<()>::default();
    assert!(matches!(
        correlator.new_request("t", 0, None),
        Err(Error::Protocol(_))
    ));
}

#[tokio::test]
async fn test_abort_owned_by_retires_matching_requests() {
    let correlator = Correlator::<u32>::default();
    let mut a = correlator
        .new_owned_request("a", 1, None, vec!["c1".into(), "c2".into()])
        .unwrap();
    let _b = correlator
        .new_owned_request("b", 1, None, vec!["c3".into()])
        .unwrap();

    assert_eq!(correlator.abort_owned_by("c2"), 1);
    assert_eq!(a.next().await, None);
    assert!(correlator.contains("b"));
    assert!(matches!(correlator.abort("a"), Err(Error::InvalidToken(_))));
}

#[tokio::test]
async fn test_dropped_handle_retires_its_entry() {
    let correlator = Correlator::<u32>::default();
    let pending = correlator.new_request("t", 1, None).unwrap();
    drop(pending);
    assert!(!correlator.contains("t"));
    assert!(matches!(
        correlator.add_response("t", 1),
        Err(Error::InvalidToken(_))
    ));

    // a cancelled wait releases the token for reuse
    let mut pending = correlator.new_request("t", 1, None).unwrap();
    let waited = tokio::time::timeout(Duration::from_millis(20), pending.next()).await;
    assert!(waited.is_err());
    drop(pending);
    assert!(correlator.is_empty());
    let _again = correlator.new_request("t", 1, None).unwrap();
}

#[tokio::test]
async fn test_dropping_stale_handle_keeps_newer_request() {
    let correlator = Correlator::<u32>::default();
    let first = correlator.new_request("t", 1, None).unwrap();
    correlator.abort("t").unwrap();
    let _second = correlator.new_request("t", 1, None).unwrap();
    drop(first);
    assert!(correlator.contains("t"));
}

#[tokio::test]
async fn test_collect_with_huge_limit() {
    let correlator = Correlator::<u32>::default();
    let pending = correlator.new_request("t", usize::MAX, None).unwrap();
    correlator.add_response("t", 1).unwrap();
    correlator.add_response("t", 2).unwrap();
    correlator.abort("t").unwrap();
    assert_eq!(pending.collect().await, vec![1, 2]);
}
