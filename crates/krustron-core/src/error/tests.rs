use super::*;

#[test]
fn test_transient_classification() {
    assert!(Error::Disconnected.is_transient());
    assert!(Error::Timeout("publish".to_string()).is_transient());
    assert!(!Error::HubClosed.is_transient());
    assert!(!Error::InvalidSubject("a..b".to_string()).is_transient());
    assert!(!Error::Draining.is_transient());
}

#[test]
fn test_display_messages() {
    let err = Error::ConsumerNotFound {
        stream: "KRUSTRON_CLUSTER".to_string(),
        durable: "billing".to_string(),
    };
    assert_eq!(err.to_string(), "consumer not found: KRUSTRON_CLUSTER/billing");
    assert_eq!(Error::handler("boom").to_string(), "handler error: boom");
}

#[test]
fn test_serde_error_conversion() {
    let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
    let err: Error = parse.unwrap_err().into();
    assert!(matches!(err, Error::Serialization(_)));
}
