use super::*;
use crate::bus::mock::CollectingHandler;

#[test]
fn test_publish_result_success() {
    let result = PublishResult::success(3);
    assert!(result.is_success());
    assert_eq!(result.attempts(), 3);
}

#[test]
fn test_publish_result_failure_before_ack() {
    let result = PublishResult::failure(0);
    assert!(!result.is_success());
    assert_eq!(result.attempts(), 0);
}

#[test]
fn test_fatal_is_the_only_fatal_error() {
    assert!(BusError::Fatal("boom".to_string()).is_fatal());
    assert!(!BusError::Handler("nope".to_string()).is_fatal());
    assert!(!BusError::Timeout(Duration::from_secs(1)).is_fatal());
}

#[test]
fn test_topic_subscriber_equal_for_same_handler() {
    let handler: Arc<dyn EventHandler> = Arc::new(CollectingHandler::default());
    let a = TopicSubscriber::new("t1", handler.clone());
    let b = TopicSubscriber::new("t1", handler);
    assert_eq!(a, b);
}

#[test]
fn test_topic_subscriber_differs_by_handler_identity() {
    let a = TopicSubscriber::new("t1", Arc::new(CollectingHandler::default()));
    let b = TopicSubscriber::new("t1", Arc::new(CollectingHandler::default()));
    assert_ne!(a, b);
}

#[test]
fn test_topic_subscriber_differs_by_topic() {
    let handler: Arc<dyn EventHandler> = Arc::new(CollectingHandler::default());
    let a = TopicSubscriber::new("t1", handler.clone());
    let b = TopicSubscriber::new("t2", handler);
    assert_ne!(a, b);
}

#[test]
fn test_topic_subscriber_set_dedups_same_pair() {
    let handler: Arc<dyn EventHandler> = Arc::new(CollectingHandler::default());
    let mut set = HashSet::new();
    set.insert(TopicSubscriber::new("t1", handler.clone()));
    set.insert(TopicSubscriber::new("t1", handler.clone()));
    set.insert(TopicSubscriber::new("t2", handler));
    assert_eq!(set.len(), 2);
}

#[tokio::test]
async fn test_handler_fn_invokes_closure() {
    let handler = handler_fn(|event: Arc<EventMessage>| async move {
        if event.body.event_type == "bad" {
            Err(BusError::Handler("rejected".to_string()))
        } else {
            Ok(())
        }
    });

    let good = crate::event::EventMessage::new(
        uuid::Uuid::new_v4(),
        crate::event::Event::new("good"),
    );
    let bad = crate::event::EventMessage::new(
        uuid::Uuid::new_v4(),
        crate::event::Event::new("bad"),
    );

    assert!(handler.handle(Arc::new(good)).await.is_ok());
    assert!(handler.handle(Arc::new(bad)).await.is_err());
}
