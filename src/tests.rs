use super::addr::{BusAddress, ClientAddress, RouterAddress, ServiceAddress};
use super::message::Message;
use super::message::MessageType;
use super::message::Payload;
use super::message::TransportMessage;
use super::util;
use json;

const TRANSPORT_MSG_JSON: &str = r#"{
    "to":"my-to",
    "from":"my-from",
    "thread":"my-thread",
    "body":[{
        "__c":"osrfMessage",
        "__p":{
            "threadTrace":1,
            "type":"REQUEST",
            "locale":"en-US",
            "timezone":"America/New_York",
            "api_level":1,
            "ingress":"opensrf",
            "payload":{
                "__c":"osrfMethod",
                "__p":{
                    "method":"opensrf.system.echo",
                    "params":["Hello","World"]
                }
            }
        }
    }]
}"#;

#[test]
fn parse_transport_message() {
    let json_value = json::parse(TRANSPORT_MSG_JSON).unwrap();
    let tm = TransportMessage::from_json_value(&json_value).unwrap();

    assert_eq!(tm.thread(), "my-thread");

    let msg = &tm.body()[0];
    let type_str: &str = (*msg.mtype()).into();
    assert_eq!(type_str, "REQUEST");

    if let Payload::Method(method) = msg.payload() {
        assert_eq!(method.params()[0].as_str().unwrap(), "Hello");
    } else {
        panic!("Transport message failed to parse as Method");
    }
}

#[test]
fn parse_bus_addresses() {
    let client = BusAddress::parse("opensrf:client:user:localhost:host1:1234:55").unwrap();
    assert!(client.is_client());
    assert_eq!(client.domain(), "localhost");
    assert_eq!(client.username(), "user");

    let service = BusAddress::parse("opensrf:service:_:_:opensrf.math").unwrap();
    assert!(service.is_service());
    assert_eq!(service.service(), Some("opensrf.math"));

    let router = BusAddress::parse("opensrf:router:router:example.com").unwrap();
    assert!(router.is_router());

    assert!(BusAddress::parse("bogus").is_err());
}

#[test]
fn compose_typed_addresses() {
    let client = ClientAddress::new("opensrf", "example.com");
    assert!(client.as_str().starts_with("opensrf:client:opensrf:example.com:"));

    let service = ServiceAddress::new("opensrf.math");
    assert_eq!(service.as_str(), "opensrf:service:_:_:opensrf.math");
    assert_eq!(service.service(), "opensrf.math");

    let router = RouterAddress::new("router", "example.com");
    assert_eq!(router.as_str(), "opensrf:router:router:example.com");
}

#[test]
fn stringify_params_redacts_protected_methods() {
    let params = vec![json::from("plaintext-password")];
    let protect = vec!["opensrf.auth.".to_string()];

    let redacted = util::stringify_params("opensrf.auth.login", &params, &protect);
    assert_eq!(redacted, "**PARAMS REDACTED**");

    let visible = util::stringify_params("opensrf.math.add", &params, &protect);
    assert_eq!(visible, "\"plaintext-password\"");
}

#[test]
fn timer_tracks_remaining_duration() {
    let timer = util::Timer::new(30);
    assert!(!timer.done());
    assert!(timer.remaining() <= 30 && timer.remaining() > 0);

    let expired = util::Timer::new(0);
    assert!(expired.done());
}
