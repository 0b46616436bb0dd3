use signalhub_messages::{Channel, ChannelError, ClientId, Publication, ReplyError, StreamPosition};
use signalhub_messages::command::ErrorCode;

#[test]
fn channel_rejects_empty_name() {
    assert_eq!(Channel::new("").unwrap_err(), ChannelError::Empty);
}

#[test]
fn channel_enforces_max_length() {
    let err = Channel::new_checked("room:very-long-name", 4).unwrap_err();
    assert!(matches!(err, ChannelError::TooLong(19, 4)));
}

#[test]
fn publication_round_trips_through_json() {
    let pub_ = Publication {
        offset: 7,
        epoch: 1,
        data: b"hello".as_ref().into(),
        info: None,
        tags: None,
    };
    let json = serde_json::to_string(&pub_).unwrap();
    let back: Publication = serde_json::from_str(&json).unwrap();
    assert_eq!(pub_, back);
    assert!(back.is_recoverable());
    assert_eq!(back.position(), StreamPosition { offset: 7, epoch: 1 });
}

#[test]
fn transient_publication_is_not_recoverable() {
    assert!(!Publication::transient("x").is_recoverable());
}

#[test]
fn client_id_generate_is_unique() {
    assert_ne!(ClientId::generate(), ClientId::generate());
}

#[test]
fn reply_error_defaults_to_non_temporary() {
    let err = ReplyError::new(ErrorCode::BadRequest, "nope");
    assert!(!err.temporary);
    let err = ReplyError::temporary(ErrorCode::Unavailable, "retry me");
    assert!(err.temporary);
}
