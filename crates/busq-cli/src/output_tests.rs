//! Tests for message printing.

use super::*;
use bytes::Bytes;

fn session(id: &str) -> SessionId {
    SessionId::new(id.to_string()).unwrap()
}

fn message_id(id: &str) -> MessageId {
    id.parse().unwrap()
}

fn peeked(session_id: Option<&str>, id: &str, body: &str) -> PeekedMessage {
    PeekedMessage {
        message_id: message_id(id),
        body: Bytes::from(body.to_string()),
        session_id: session_id.map(session),
        correlation_id: None,
        sequence_number: 1,
    }
}

#[test]
fn test_no_prefix_by_default() {
    let prefix = format_prefix(PrintOptions::default(), Some(&session("s1")), &message_id("m1"));
    assert_eq!(prefix, "");
}

#[test]
fn test_both_prefixes() {
    let options = PrintOptions {
        session_id: true,
        message_id: true,
    };
    let prefix = format_prefix(options, Some(&session("s1")), &message_id("m1"));
    assert_eq!(prefix, "s1:m1:");
}

#[test]
fn test_prefixes_are_independent() {
    let session_only = PrintOptions {
        session_id: true,
        message_id: false,
    };
    let id_only = PrintOptions {
        session_id: false,
        message_id: true,
    };

    assert_eq!(format_prefix(session_only, Some(&session("s1")), &message_id("m1")), "s1:");
    assert_eq!(format_prefix(id_only, Some(&session("s1")), &message_id("m1")), "m1:");
}

#[test]
fn test_session_prefix_skipped_without_session() {
    let options = PrintOptions {
        session_id: true,
        message_id: true,
    };
    assert_eq!(format_prefix(options, None, &message_id("m1")), "m1:");
}

#[test]
fn test_print_writes_one_line_per_message() {
    let options = PrintOptions {
        session_id: true,
        message_id: true,
    };
    let mut out = Vec::new();

    print_peeked(&mut out, options, &peeked(Some("s1"), "m1", "hello")).unwrap();
    print_peeked(&mut out, options, &peeked(None, "m2", "world")).unwrap();

    assert_eq!(String::from_utf8(out).unwrap(), "s1:m1:hello\nm2:world\n");
}

#[test]
fn test_write_failure_is_an_output_error() {
    struct Broken;
    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let result = print_peeked(&mut Broken, PrintOptions::default(), &peeked(None, "m1", "x"));
    assert!(matches!(result, Err(CliError::Output(_))));
}
