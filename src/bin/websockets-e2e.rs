use ferrosrf::message;
use ferrosrf::util;
use std::net::TcpStream;
use std::time::Duration;
use websocket::sync::Client;
use websocket::{ClientBuilder, Message, OwnedMessage};

/// Manual end-to-end harness for the websocket translator, run against
/// a live bus and a running `opensrf-websockets` process.  Not part of
/// the automated test suite -- it exercises the stateless echo and
/// idle-timeout scenarios against real network I/O.

const DEFAULT_URI: &str = "ws://127.0.0.1:7682";

// Websockets is a public-facing gateway, so the destination service
// must be a public one.
const SERVICE: &str = "opensrf.settings";
const METHOD: &str = "opensrf.system.echo";

fn main() {
    let mut client = ClientBuilder::new(DEFAULT_URI)
        .unwrap()
        .connect_insecure()
        .unwrap();

    stateless_echo(&mut client, 0);
    stateless_echo(&mut client, 1);

    println!("Sleeping past the configured idle timeout...");
    std::thread::sleep(Duration::from_secs(10));

    match client.send_message(&Message::ping(vec![])) {
        Ok(()) => println!("Connection still open after idle sleep"),
        Err(e) => println!("Connection closed as expected: {e}"),
    }
}

fn stateless_echo(client: &mut Client<TcpStream>, count: usize) {
    let echo = format!("Hello, World {count}");

    let request = json::object! {
        thread: util::random_number(12),
        service: SERVICE,
        osrf_msg: [{
            __c: "osrfMessage",
            __p: {
                threadTrace: 1,
                type: "REQUEST",
                locale: "en-US",
                timezone: "America/New_York",
                api_level: 1,
                ingress: "opensrf",
                payload: {
                    __c: "osrfMethod",
                    __p: {
                        method: METHOD,
                        params: [echo.as_str()],
                    }
                }
            }
        }]
    };

    client
        .send_message(&Message::text(request.dump()))
        .expect("send request");

    let response = client.recv_message().expect("receive response");

    let text = match response {
        OwnedMessage::Text(text) => text,
        other => panic!("Expected a text frame, got {other:?}"),
    };

    let mut ws_msg = json::parse(&text).expect("parse response JSON");
    let mut osrf_list = ws_msg["osrf_msg"].take();
    let osrf_msg = osrf_list[0].take();

    if osrf_msg.is_null() {
        panic!("No response to echo request");
    }

    let msg = message::Message::from_json_value(&osrf_msg).expect("decode osrf message");

    match msg.payload() {
        message::Payload::Result(res) => {
            assert_eq!(res.content(), &echo.as_str());
            println!("echo {count} OK");
        }
        other => panic!("Expected a RESULT payload, got {other:?}"),
    }
}
