//! Tests for receive orchestration.

use super::*;
use crate::output::PrintOptions;
use crate::test_support::{
    connection_lost, no_session_available, received, Script, ScriptedGateway,
};
use busq_runtime::{InMemoryGateway, Message, MessageSender, ReceivedMessage};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;

fn orders() -> QueueName {
    QueueName::new("orders".to_string()).unwrap()
}

fn options() -> RunOptions {
    RunOptions {
        debug: false,
        print: PrintOptions::default(),
        correlation_id: None,
        receive_wait: Duration::from_millis(20),
        session_wait: Duration::from_millis(20),
    }
}

fn with_batches(batches: Vec<Vec<ReceivedMessage>>) -> Script {
    Script {
        batches: VecDeque::from(batches),
        ..Script::default()
    }
}

async fn run(
    gateway: &ScriptedGateway,
    mode: SessionMode,
    count: MessageCount,
) -> (Result<ReceiveSummary, CliError>, String) {
    let mut out = Vec::new();
    let result = receive(gateway, &orders(), &mode, count, &options(), &mut out).await;
    (result, String::from_utf8(out).unwrap())
}

#[tokio::test]
async fn test_zero_count_touches_nothing() {
    for mode in [
        SessionMode::NoSession,
        SessionMode::AnySession,
        SessionMode::from_flag(Some("s1")).unwrap(),
    ] {
        let gateway = ScriptedGateway::default();

        let (result, out) = run(&gateway, mode, MessageCount::Bounded(0)).await;

        assert_eq!(result.unwrap(), ReceiveSummary::default());
        assert!(out.is_empty());
        assert!(gateway.events().is_empty());
    }
}

// ============================================================================
// Plain Queue Tests
// ============================================================================

mod plain {
    use super::*;

    #[tokio::test]
    async fn test_stops_when_count_is_met() {
        let gateway = ScriptedGateway::new(with_batches(vec![
            vec![received("m1", None, "a")],
            vec![received("m2", None, "b")],
            vec![received("m3", None, "c")],
        ]));

        let (result, out) = run(&gateway, SessionMode::NoSession, MessageCount::Bounded(2)).await;

        let summary = result.unwrap();
        assert_eq!(summary.completed, 2);
        assert!(!summary.exhausted);
        assert_eq!(summary.session, None);
        assert_eq!(out, "a\nb\n");
        assert_eq!(
            gateway.events(),
            vec![
                "create_receiver:orders",
                "receive:1",
                "complete:m1",
                "receive:1",
                "complete:m2",
                "close"
            ]
        );
    }

    #[tokio::test]
    async fn test_lock_lost_message_does_not_count() {
        let mut script = with_batches(vec![
            vec![received("m1", None, "a")],
            vec![received("m2", None, "b")],
            vec![received("m3", None, "c")],
        ]);
        script.lock_lost.insert("m2".to_string());
        let gateway = ScriptedGateway::new(script);

        let (result, out) = run(&gateway, SessionMode::NoSession, MessageCount::Bounded(2)).await;

        let summary = result.unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.lock_lost, 1);
        assert_eq!(out, "a\nb\nc\n");
    }

    #[tokio::test]
    async fn test_unbounded_stops_at_empty_queue() {
        let gateway = ScriptedGateway::new(with_batches(vec![vec![received("m1", None, "a")]]));

        let (result, _) = run(&gateway, SessionMode::NoSession, MessageCount::Unbounded).await;

        let summary = result.unwrap();
        assert_eq!(summary.completed, 1);
        assert!(summary.exhausted);
        assert_eq!(
            gateway.events(),
            vec![
                "create_receiver:orders",
                "receive:1",
                "complete:m1",
                "receive:1",
                "close"
            ]
        );
    }

    #[tokio::test]
    async fn test_receiver_closed_after_fatal_error() {
        let mut script = with_batches(vec![vec![received("m1", None, "a")]]);
        script.complete_error = Some(connection_lost);
        let gateway = ScriptedGateway::new(script);

        let (result, _) = run(&gateway, SessionMode::NoSession, MessageCount::Bounded(1)).await;

        assert!(result.is_err());
        assert_eq!(gateway.events().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn test_in_memory_queue_keeps_unreceived_messages() {
        let gateway = InMemoryGateway::default();
        let sender = gateway.create_sender(&orders()).await.unwrap();
        for body in ["a", "b", "c"] {
            sender.send_message(Message::new(Bytes::from(body))).await.unwrap();
        }
        let mut out = Vec::new();

        let summary = receive(
            &gateway,
            &orders(),
            &SessionMode::NoSession,
            MessageCount::Bounded(2),
            &options(),
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(out, b"a\nb\n");
        assert_eq!(gateway.message_count(&orders()).unwrap(), 1);
    }
}

// ============================================================================
// Session Tests
// ============================================================================

mod session {
    use super::*;

    #[tokio::test]
    async fn test_any_session_drains_and_closes() {
        let gateway = ScriptedGateway::new(with_batches(vec![vec![
            received("m1", Some("s1"), "a"),
            received("m2", Some("s1"), "b"),
        ]]));

        let (result, out) = run(&gateway, SessionMode::AnySession, MessageCount::Unbounded).await;

        let summary = result.unwrap();
        assert_eq!(summary.completed, 2);
        assert!(summary.exhausted);
        assert_eq!(summary.session.unwrap().as_str(), "s1");
        assert_eq!(out, "a\nb\n");
        assert_eq!(
            gateway.events(),
            vec![
                "accept_next",
                "receive:100",
                "complete:m1",
                "complete:m2",
                "receive:100",
                "close"
            ]
        );
    }

    #[tokio::test]
    async fn test_exhausted_named_session_is_not_topped_up() {
        let gateway = ScriptedGateway::new(with_batches(vec![vec![
            received("m1", Some("s9"), "a"),
            received("m2", Some("s9"), "b"),
        ]]));
        let mode = SessionMode::from_flag(Some("s9")).unwrap();

        let (result, _) = run(&gateway, mode, MessageCount::Bounded(5)).await;

        let summary = result.unwrap();
        assert_eq!(summary.completed, 2);
        assert!(summary.exhausted);
        assert_eq!(
            gateway.events(),
            vec![
                "accept:s9",
                "receive:5",
                "complete:m1",
                "complete:m2",
                "receive:3",
                "close"
            ]
        );
    }

    #[tokio::test]
    async fn test_acquisition_retries_then_drains() {
        let mut script = with_batches(vec![vec![received("m1", Some("s1"), "a")]]);
        script.accept_errors = VecDeque::from(vec![no_session_available(), no_session_available()]);
        let gateway = ScriptedGateway::new(script);

        let (result, out) = run(&gateway, SessionMode::AnySession, MessageCount::Bounded(1)).await;

        assert_eq!(result.unwrap().completed, 1);
        assert_eq!(out, "a\n");
        assert_eq!(
            gateway.events(),
            vec![
                "accept_next",
                "accept_next",
                "accept_next",
                "receive:1",
                "complete:m1",
                "close"
            ]
        );
    }

    #[tokio::test]
    async fn test_session_closed_after_fatal_error() {
        let mut script = with_batches(vec![vec![received("m1", Some("s1"), "a")]]);
        script.complete_error = Some(connection_lost);
        let gateway = ScriptedGateway::new(script);

        let (result, _) = run(&gateway, SessionMode::AnySession, MessageCount::Bounded(1)).await;

        assert!(matches!(result, Err(CliError::Queue { .. })));
        assert_eq!(gateway.events().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn test_close_failure_does_not_fail_receive() {
        let mut script = with_batches(vec![vec![received("m1", Some("s1"), "a")]]);
        script.close_error = Some(connection_lost);
        let gateway = ScriptedGateway::new(script);

        let (result, _) = run(&gateway, SessionMode::AnySession, MessageCount::Bounded(1)).await;

        assert_eq!(result.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_failed_acquisition_has_nothing_to_close() {
        let gateway = ScriptedGateway::new(Script {
            accept_errors: VecDeque::from(vec![connection_lost()]),
            ..Script::default()
        });

        let (result, _) = run(&gateway, SessionMode::AnySession, MessageCount::Bounded(1)).await;

        assert!(result.is_err());
        assert_eq!(gateway.events(), vec!["accept_next"]);
    }
}
