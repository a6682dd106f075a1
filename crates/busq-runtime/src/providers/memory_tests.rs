//! Tests for the in-memory gateway.

use super::*;

const SHORT_WAIT: Duration = Duration::from_millis(50);

fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

fn session(id: &str) -> SessionId {
    SessionId::new(id.to_string()).unwrap()
}

fn fast_gateway() -> InMemoryGateway {
    InMemoryGateway::new(InMemoryConfig {
        lock_duration: Duration::from_secs(30),
        session_wait: SHORT_WAIT,
        poll_interval: Duration::from_millis(5),
    })
}

async fn send_all(gateway: &InMemoryGateway, queue: &QueueName, bodies: &[&str]) {
    let sender = gateway.create_sender(queue).await.unwrap();
    for body in bodies {
        sender
            .send_message(Message::new(Bytes::from(body.to_string())))
            .await
            .unwrap();
    }
    sender.close().await.unwrap();
}

async fn send_to_session(gateway: &InMemoryGateway, queue: &QueueName, id: &str, body: &str) {
    let sender = gateway.create_sender(queue).await.unwrap();
    sender
        .send_message(Message::new(Bytes::from(body.to_string())).with_session_id(session(id)))
        .await
        .unwrap();
}

fn bodies(messages: &[ReceivedMessage]) -> Vec<String> {
    messages
        .iter()
        .map(|m| String::from_utf8(m.body.to_vec()).unwrap())
        .collect()
}

// ============================================================================
// Plain Queue Tests
// ============================================================================

mod plain_queue {
    use super::*;

    /// Verify messages come back in the order they were sent.
    #[tokio::test]
    async fn test_receive_preserves_send_order() {
        let gateway = fast_gateway();
        let q = queue("orders");
        send_all(&gateway, &q, &["one", "two", "three"]).await;

        let receiver = gateway.create_receiver(&q).await.unwrap();
        let received = receiver.receive_messages(10, SHORT_WAIT).await.unwrap();

        assert_eq!(bodies(&received), vec!["one", "two", "three"]);
        assert!(received.iter().all(|m| m.delivery_count == 1));
        assert!(received
            .windows(2)
            .all(|w| w[0].sequence_number < w[1].sequence_number));
    }

    /// Verify the batch size caps the number of messages returned.
    #[tokio::test]
    async fn test_receive_respects_max_messages() {
        let gateway = fast_gateway();
        let q = queue("orders");
        send_all(&gateway, &q, &["a", "b", "c"]).await;

        let receiver = gateway.create_receiver(&q).await.unwrap();
        let first = receiver.receive_messages(2, SHORT_WAIT).await.unwrap();
        let second = receiver.receive_messages(2, SHORT_WAIT).await.unwrap();

        assert_eq!(bodies(&first), vec!["a", "b"]);
        assert_eq!(bodies(&second), vec!["c"]);
    }

    /// Verify an empty queue yields an empty batch once the wait elapses.
    #[tokio::test]
    async fn test_receive_from_empty_queue_returns_empty_after_wait() {
        let gateway = fast_gateway();
        let receiver = gateway.create_receiver(&queue("empty")).await.unwrap();

        let received = receiver.receive_messages(1, SHORT_WAIT).await.unwrap();

        assert!(received.is_empty());
    }

    /// Verify a message sent while a receiver waits is picked up.
    #[tokio::test]
    async fn test_receive_picks_up_message_sent_during_wait() {
        let gateway = fast_gateway();
        let q = queue("late");
        let receiver = gateway.create_receiver(&q).await.unwrap();

        let sender_gateway = gateway.clone();
        let sender_queue = q.clone();
        let send = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            send_all(&sender_gateway, &sender_queue, &["late"]).await;
        });

        let received = receiver
            .receive_messages(1, Duration::from_secs(2))
            .await
            .unwrap();
        send.await.unwrap();

        assert_eq!(bodies(&received), vec!["late"]);
    }

    /// Verify completion removes the message from the queue.
    #[tokio::test]
    async fn test_complete_removes_message() {
        let gateway = fast_gateway();
        let q = queue("orders");
        send_all(&gateway, &q, &["done"]).await;

        let receiver = gateway.create_receiver(&q).await.unwrap();
        let received = receiver.receive_messages(1, SHORT_WAIT).await.unwrap();
        receiver.complete_message(&received[0]).await.unwrap();

        assert_eq!(gateway.message_count(&q).unwrap(), 0);
    }

    /// Verify completing after the lock expired reports lock lost and the
    /// message is delivered again.
    #[tokio::test]
    async fn test_expired_lock_reports_lock_lost_and_redelivers() {
        let gateway = fast_gateway();
        let q = queue("orders");
        send_all(&gateway, &q, &["slow"]).await;

        let receiver = gateway.create_receiver(&q).await.unwrap();
        let received = receiver.receive_messages(1, SHORT_WAIT).await.unwrap();
        gateway.expire_message_locks(&q).unwrap();

        let error = receiver.complete_message(&received[0]).await.unwrap_err();
        assert!(error.is_lock_lost());

        let redelivered = receiver.receive_messages(1, SHORT_WAIT).await.unwrap();
        assert_eq!(bodies(&redelivered), vec!["slow"]);
        assert_eq!(redelivered[0].delivery_count, 2);
        assert_eq!(redelivered[0].message_id, received[0].message_id);
    }

    /// Verify a receiver cannot complete a message locked by another receiver.
    #[tokio::test]
    async fn test_complete_with_foreign_lock_is_lock_lost() {
        let gateway = fast_gateway();
        let q = queue("orders");
        send_all(&gateway, &q, &["mine"]).await;

        let owner = gateway.create_receiver(&q).await.unwrap();
        let other = gateway.create_receiver(&q).await.unwrap();
        let received = owner.receive_messages(1, SHORT_WAIT).await.unwrap();

        let error = other.complete_message(&received[0]).await.unwrap_err();
        assert!(error.is_lock_lost());
        owner.complete_message(&received[0]).await.unwrap();
    }

    /// Verify closing a receiver releases its locked messages.
    #[tokio::test]
    async fn test_close_returns_locked_messages() {
        let gateway = fast_gateway();
        let q = queue("orders");
        send_all(&gateway, &q, &["first", "second"]).await;

        let receiver = gateway.create_receiver(&q).await.unwrap();
        let _ = receiver.receive_messages(2, SHORT_WAIT).await.unwrap();
        receiver.close().await.unwrap();

        let next = gateway.create_receiver(&q).await.unwrap();
        let received = next.receive_messages(2, SHORT_WAIT).await.unwrap();
        assert_eq!(bodies(&received), vec!["first", "second"]);
    }

    /// Verify explicit message IDs and correlation IDs survive the round trip.
    #[tokio::test]
    async fn test_message_metadata_is_preserved() {
        let gateway = fast_gateway();
        let q = queue("orders");
        let sender = gateway.create_sender(&q).await.unwrap();
        sender
            .send_message(
                Message::new(Bytes::from("body"))
                    .with_message_id("m1".parse().unwrap())
                    .with_correlation_id("c1".to_string()),
            )
            .await
            .unwrap();

        let receiver = gateway.create_receiver(&q).await.unwrap();
        let received = receiver.receive_messages(1, SHORT_WAIT).await.unwrap();

        assert_eq!(received[0].message_id.as_str(), "m1");
        assert_eq!(received[0].correlation_id.as_deref(), Some("c1"));
        assert!(received[0].session_id.is_none());
    }

    /// Verify oversized bodies are rejected.
    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let gateway = fast_gateway();
        let sender = gateway.create_sender(&queue("big")).await.unwrap();
        let body = Bytes::from(vec![b'x'; ProviderType::InMemory.max_message_size() + 1]);

        let error = sender.send_message(Message::new(body)).await.unwrap_err();

        assert!(matches!(error, QueueError::MessageTooLarge { .. }));
    }
}

// ============================================================================
// Peek Tests
// ============================================================================

mod peek {
    use super::*;

    fn peeked_bodies(messages: &[PeekedMessage]) -> Vec<String> {
        messages
            .iter()
            .map(|m| String::from_utf8(m.body.to_vec()).unwrap())
            .collect()
    }

    /// Verify peek walks forward and leaves the queue untouched.
    #[tokio::test]
    async fn test_peek_advances_cursor_without_removing() {
        let gateway = fast_gateway();
        let q = queue("orders");
        send_all(&gateway, &q, &["a", "b", "c"]).await;

        let receiver = gateway.create_receiver(&q).await.unwrap();
        let first = receiver.peek_messages(2).await.unwrap();
        let second = receiver.peek_messages(2).await.unwrap();
        let third = receiver.peek_messages(2).await.unwrap();

        assert_eq!(peeked_bodies(&first), vec!["a", "b"]);
        assert_eq!(peeked_bodies(&second), vec!["c"]);
        assert!(third.is_empty());
        assert_eq!(gateway.message_count(&q).unwrap(), 3);

        let received = receiver.receive_messages(3, SHORT_WAIT).await.unwrap();
        assert_eq!(bodies(&received), vec!["a", "b", "c"]);
    }

    /// Verify locked messages are still visible to peek.
    #[tokio::test]
    async fn test_peek_sees_locked_messages() {
        let gateway = fast_gateway();
        let q = queue("orders");
        send_all(&gateway, &q, &["locked", "free"]).await;

        let consumer = gateway.create_receiver(&q).await.unwrap();
        let _ = consumer.receive_messages(1, SHORT_WAIT).await.unwrap();

        let peeker = gateway.create_receiver(&q).await.unwrap();
        let peeked = peeker.peek_messages(10).await.unwrap();

        assert_eq!(peeked_bodies(&peeked), vec!["locked", "free"]);
    }
}

// ============================================================================
// Session Tests
// ============================================================================

mod sessions {
    use super::*;

    async fn session_queue(gateway: &InMemoryGateway, name: &str) -> QueueName {
        let q = queue(name);
        gateway.create_session_queue(&q).unwrap();
        q
    }

    /// Verify session-enabled queues refuse session-less receivers and sends.
    #[tokio::test]
    async fn test_session_queue_rejects_plain_access() {
        let gateway = fast_gateway();
        let q = session_queue(&gateway, "sessions").await;

        assert!(gateway.create_receiver(&q).await.is_err());

        let sender = gateway.create_sender(&q).await.unwrap();
        let result = sender.send_message(Message::new(Bytes::from("x"))).await;
        assert!(result.is_err());
    }

    /// Verify accepting a session on a plain queue fails.
    #[tokio::test]
    async fn test_accept_on_plain_queue_fails() {
        let gateway = fast_gateway();
        let q = queue("plain");

        let result = gateway.accept_session(&q, &session("s1")).await;

        assert!(result.is_err());
    }

    /// Verify a session receiver only sees its own session's messages.
    #[tokio::test]
    async fn test_named_session_receives_only_its_messages() {
        let gateway = fast_gateway();
        let q = session_queue(&gateway, "sessions").await;
        send_to_session(&gateway, &q, "s1", "one").await;
        send_to_session(&gateway, &q, "s2", "other").await;
        send_to_session(&gateway, &q, "s1", "two").await;

        let receiver = gateway.accept_session(&q, &session("s1")).await.unwrap();
        let received = receiver.receive_messages(10, SHORT_WAIT).await.unwrap();

        assert_eq!(receiver.session_id().as_str(), "s1");
        assert_eq!(bodies(&received), vec!["one", "two"]);
        assert!(received
            .iter()
            .all(|m| m.session_id.as_ref().map(SessionId::as_str) == Some("s1")));
    }

    /// Verify a named session can be accepted even when it has no messages.
    #[tokio::test]
    async fn test_named_session_accepted_when_empty() {
        let gateway = fast_gateway();
        let q = session_queue(&gateway, "sessions").await;

        let receiver = gateway.accept_session(&q, &session("idle")).await.unwrap();
        let received = receiver.receive_messages(1, SHORT_WAIT).await.unwrap();

        assert!(received.is_empty());
    }

    /// Verify a held session cannot be accepted twice until it is closed.
    #[tokio::test]
    async fn test_session_lock_is_exclusive_until_close() {
        let gateway = fast_gateway();
        let q = session_queue(&gateway, "sessions").await;
        let s1 = session("s1");

        let first = gateway.accept_session(&q, &s1).await.unwrap();
        assert!(gateway.is_session_locked(&q, &s1).unwrap());

        let second = gateway.accept_session(&q, &s1).await;
        assert!(matches!(second, Err(QueueError::SessionLocked { .. })));

        first.close().await.unwrap();
        assert!(!gateway.is_session_locked(&q, &s1).unwrap());
        assert!(gateway.accept_session(&q, &s1).await.is_ok());
    }

    /// Verify accept-next hands out distinct sessions with pending messages.
    #[tokio::test]
    async fn test_accept_next_skips_locked_sessions() {
        let gateway = fast_gateway();
        let q = session_queue(&gateway, "sessions").await;
        send_to_session(&gateway, &q, "s1", "a").await;
        send_to_session(&gateway, &q, "s2", "b").await;

        let first = gateway.accept_next_session(&q).await.unwrap();
        let second = gateway.accept_next_session(&q).await.unwrap();

        assert_eq!(first.session_id().as_str(), "s1");
        assert_eq!(second.session_id().as_str(), "s2");
    }

    /// Verify accept-next reports no session available after the wait.
    #[tokio::test]
    async fn test_accept_next_without_sessions_times_out() {
        let gateway = fast_gateway();
        let q = session_queue(&gateway, "sessions").await;

        let error = match gateway.accept_next_session(&q).await {
            Ok(_) => panic!("no session should be available"),
            Err(e) => e,
        };

        assert!(error.is_session_unavailable());
    }

    /// Verify closing a session receiver returns its unfinished messages.
    #[tokio::test]
    async fn test_session_close_returns_unfinished_messages() {
        let gateway = fast_gateway();
        let q = session_queue(&gateway, "sessions").await;
        send_to_session(&gateway, &q, "s1", "pending").await;

        let receiver = gateway.accept_next_session(&q).await.unwrap();
        let _ = receiver.receive_messages(1, SHORT_WAIT).await.unwrap();
        receiver.close().await.unwrap();

        let again = gateway.accept_next_session(&q).await.unwrap();
        let received = again.receive_messages(1, SHORT_WAIT).await.unwrap();
        assert_eq!(bodies(&received), vec!["pending"]);
    }
}
