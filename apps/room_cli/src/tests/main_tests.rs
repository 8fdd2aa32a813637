use super::*;
use crate::terminal::{sanitize, Screen};
use chrono::{TimeZone, Utc};
use room_client::{ChangeCause, LocalRef, Message, MessageBody, Origin};
use shared::domain::UserId;

#[test]
fn plain_lines_are_text() {
    assert_eq!(
        parse_command("  hello there "),
        Ok(Some(Command::Text("hello there".into())))
    );
    assert_eq!(parse_command("   "), Ok(None));
}

#[test]
fn slash_commands_parse_their_arguments() {
    assert_eq!(
        parse_command("/file ./notes.txt"),
        Ok(Some(Command::File(PathBuf::from("./notes.txt"))))
    );
    assert_eq!(
        parse_command("/delete m7"),
        Ok(Some(Command::Delete(MessageId::from("m7"))))
    );
    assert_eq!(parse_command("/retry #3"), Ok(Some(Command::Retry(3))));
    assert_eq!(parse_command("/discard 2"), Ok(Some(Command::Discard(2))));
    assert_eq!(parse_command("/quit"), Ok(Some(Command::Quit)));
}

#[test]
fn malformed_commands_are_reported() {
    assert!(parse_command("/retry abc").is_err());
    assert!(parse_command("/file").is_err());
    assert!(parse_command("/shout hi").is_err());
}

#[test]
fn control_characters_are_stripped() {
    assert_eq!(sanitize("hi\u{1b}[2Jthere\n"), "hi [2Jthere ");
}

#[test]
fn screen_prints_new_entries_once_and_tracks_local_refs() {
    let mut screen = Screen::new(UserId::from("alice"), 48.0);
    let local_ref = LocalRef::new(3);
    let failed = Message {
        id: local_ref.placeholder_id(),
        author_id: UserId::from("alice"),
        author_name: "Alice".into(),
        body: MessageBody::Text("oops".into()),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
        origin: Origin::Failed,
        local_ref: Some(local_ref),
    };
    let messages = vec![failed];

    let lines = screen.update(&messages, ChangeCause::SendFailed);
    assert_eq!(lines, vec!["09:30 Alice: oops (failed, /retry 3)".to_string()]);
    assert!(screen.update(&messages, ChangeCause::SendFailed).is_empty());
    assert_eq!(screen.local_ref(3), Some(local_ref));
    assert_eq!(screen.local_ref(4), None);
}
