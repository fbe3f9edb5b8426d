use crate::base::neterror::{ErrorClass, NetError};
use std::io;

#[test]
fn test_net_error_codes() {
    // Standard Chromium errors
    assert_eq!(NetError::not_resolved("a.test", "nope").as_i32(), -105);
    assert_eq!(NetError::NoNameserver.as_i32(), -137);
    assert_eq!(NetError::malformed("a.test", "short").as_i32(), -800);
    assert_eq!(
        NetError::DnsServerFailed {
            host: "a.test".into(),
            rcode: 2
        }
        .as_i32(),
        -802
    );
    assert_eq!(
        NetError::DnsTimedOut {
            host: "a.test".into(),
            attempts: 2
        }
        .as_i32(),
        -803
    );

    // Custom error
    let custom = NetError::DnsCacheStorage {
        message: "locked".into(),
    };
    assert_eq!(custom.as_i32(), -900);
}

#[test]
fn test_transport_codes_follow_io_kind() {
    let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "closed");
    assert_eq!(NetError::transport("a.test", &eof).as_i32(), -100);

    let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
    assert_eq!(NetError::transport("a.test", &refused).as_i32(), -102);

    let other = io::Error::new(io::ErrorKind::Other, "boom");
    assert_eq!(NetError::transport("a.test", &other).as_i32(), -104);
}

#[test]
fn test_error_classes() {
    assert_eq!(NetError::NoNameserver.class(), ErrorClass::Resolution);
    assert_eq!(
        NetError::not_resolved("a.test", "x").class(),
        ErrorClass::Resolution
    );
    assert_eq!(NetError::malformed("a.test", "x").class(), ErrorClass::Decode);
    assert_eq!(
        NetError::HostResolverQueueTooLarge.class(),
        ErrorClass::Transport
    );
}

#[test]
fn test_for_host_rebinds_scope() {
    let err = NetError::not_resolved("foo.corp.example", "name or service not known")
        .for_host("foo");
    assert_eq!(
        err.to_string(),
        "can't resolve host foo: name or service not known"
    );

    // Errors without a host are unchanged
    assert_eq!(NetError::NoNameserver.for_host("foo"), NetError::NoNameserver);
}
