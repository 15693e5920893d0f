use getopts;
use ferrosrf as osrf;
use osrf::addr::{RouterAddress, ServiceAddress};
use osrf::bus::Bus;
use osrf::conf;
use osrf::init;
use osrf::logging::Logger;
use osrf::message;
use osrf::util;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use threadpool::ThreadPool;
use tiny_http::{Header, Method, Request, Response, Server};

const HTTP_INGRESS: &str = "http-translator-v1";

/// Default number of seconds to wait for a complete reply before
/// returning a gateway timeout, unless overridden per-request by
/// X-OpenSRF-timeout.
const DEFAULT_REQUEST_TIMEOUT: i32 = 60;

/// Max length of a thread or xid value carried in a client header.
const MAX_THREAD_SIZE: usize = 64;

const DEFAULT_PORT: u16 = 7680;
const DEFAULT_MAX_WORKERS: usize = 64;

/// A drone address this translator has pinned to a thread after
/// seeing a successful CONNECT reply, plus enough of the original
/// request to detect a client trying to hijack another client's
/// thread.
#[derive(Clone)]
struct PinnedSession {
    client_ip: String,
    drone_addr: String,
    service: String,
}

/// Shared, cross-thread translator state: configuration and the
/// stateful-session cache.  One instance backs every worker thread.
struct Translator {
    conf: Arc<conf::Config>,
    sessions: Mutex<HashMap<String, PinnedSession>>,
}

thread_local! {
    /// Each worker thread keeps one bus connection open across
    /// requests it handles, mirroring a long-lived gateway process.
    /// Reusing it means a prior request's leftover replies must be
    /// drained before the next request is sent.
    static WORKER_BUS: RefCell<Option<Bus>> = RefCell::new(None);
}

impl Translator {
    fn new(conf: Arc<conf::Config>) -> Self {
        Translator {
            conf,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn evict(&self, thread: &str) {
        self.sessions.lock().unwrap().remove(thread);
    }

    fn pin(&self, thread: &str, client_ip: &str, drone_addr: &str, service: &str) {
        self.sessions.lock().unwrap().insert(
            thread.to_string(),
            PinnedSession {
                client_ip: client_ip.to_string(),
                drone_addr: drone_addr.to_string(),
                service: service.to_string(),
            },
        );
    }

    fn pinned(&self, thread: &str) -> Option<PinnedSession> {
        self.sessions.lock().unwrap().get(thread).cloned()
    }

    /// Runs `f` against this worker thread's bus connection, opening
    /// one on first use.
    fn with_bus<F, R>(&self, f: F) -> Result<R, String>
    where
        F: FnOnce(&mut Bus) -> Result<R, String>,
    {
        let busconf = self
            .conf
            .gateway()
            .ok_or_else(|| "No gateway configuration found".to_string())?;

        WORKER_BUS.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_none() {
                *slot = Some(Bus::new(busconf)?);
            }
            f(slot.as_mut().unwrap())
        })
    }

    fn domain(&self) -> String {
        self.conf
            .gateway()
            .map(|g| g.domain().name().to_string())
            .unwrap_or_default()
    }

    fn log_protect(&self) -> &Vec<String> {
        self.conf.log_protect()
    }

    fn handle(&self, mut request: Request) {
        let client_ip = request
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let method = request.method().clone();
        let url = request.url().to_string();

        let to_header = header_value(&request, "X-OpenSRF-to");
        let service_header = header_value(&request, "X-OpenSRF-service");
        let thread_header = header_value(&request, "X-OpenSRF-thread");
        let xid_header = header_value(&request, "X-OpenSRF-xid");
        let timeout_header = header_value(&request, "X-OpenSRF-timeout");
        let multipart_header = header_value(&request, "X-OpenSRF-multipart");

        let body = match extract_osrf_msg(&mut request, &method, &url) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("{client_ip} bad request: {e}");
                respond(request, 400, "text/plain", &e);
                return;
            }
        };

        match self.process(
            &client_ip,
            to_header,
            service_header,
            thread_header,
            xid_header,
            timeout_header,
            multipart_header,
            body,
        ) {
            Ok(resp) => {
                let _ = request.respond(resp.into_tiny_http());
            }
            Err((code, msg)) => {
                log::error!("{client_ip} request failed ({code}): {msg}");
                respond(request, code, "text/plain", &msg);
            }
        }
    }

    fn process(
        &self,
        client_ip: &str,
        to_header: Option<String>,
        service_header: Option<String>,
        thread_header: Option<String>,
        xid_header: Option<String>,
        timeout_header: Option<String>,
        multipart_header: Option<String>,
        osrf_msg_json: json::JsonValue,
    ) -> Result<TranslatorResponse, (u16, String)> {
        let thread = thread_header.ok_or((400, "Missing X-OpenSRF-thread".to_string()))?;

        if thread.len() > MAX_THREAD_SIZE {
            return Err((400, "X-OpenSRF-thread exceeds max size".to_string()));
        }

        let xid = xid_header.unwrap_or_else(Logger::mk_log_trace);
        Logger::set_log_trace(&xid);

        let multipart = multipart_header.as_deref() == Some("true");

        let timeout = timeout_header
            .and_then(|t| t.parse::<i32>().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        // Determine the recipient address and the service name used
        // for activity logging.
        let (recipient, service, send_to_router) = if let Some(service) = service_header {
            let router = RouterAddress::new("router", &self.domain())
                .as_str()
                .to_string();
            let svc_addr = ServiceAddress::new(&service).as_str().to_string();
            (svc_addr, service, Some(router))
        } else if let Some(to) = to_header {
            match self.pinned(&thread) {
                Some(p) if p.drone_addr == to && p.client_ip == client_ip => {
                    (p.drone_addr, p.service, None)
                }
                Some(_) => {
                    return Err((
                        400,
                        "X-OpenSRF-to does not match the active session".to_string(),
                    ))
                }
                None => return Err((400, "No active session for X-OpenSRF-to".to_string())),
            }
        } else {
            return Err((
                400,
                "One of X-OpenSRF-service or X-OpenSRF-to is required".to_string(),
            ));
        };

        let mut msg_list = osrf_msg_json;
        if !msg_list.is_array() {
            let mut list = json::JsonValue::new_array();
            list.push(msg_list)
                .map_err(|e| (400, format!("Error building message list: {e}")))?;
            msg_list = list;
        }

        let mut body_vec: Vec<message::Message> = Vec::new();

        loop {
            let msg_json = msg_list.array_remove(0);
            if msg_json.is_null() {
                break;
            }

            let mut msg = message::Message::from_json_value(&msg_json)
                .ok_or((400, "Could not parse osrf message".to_string()))?;

            msg.set_ingress(HTTP_INGRESS);

            if let message::Payload::Method(_) = msg.payload() {
                self.log_request(client_ip, &xid, &service, &msg);
            }

            body_vec.push(msg);
        }

        if body_vec.is_empty() {
            return Err((400, "osrf-msg contained no messages".to_string()));
        }

        let disconnect_only = body_vec
            .iter()
            .all(|m| matches!(m.mtype(), message::MessageType::Disconnect));

        let gateway_addr = self
            .with_bus(|bus| Ok(bus.address().as_str().to_string()))
            .map_err(|e| (500, e))?;

        let mut tmsg =
            message::TransportMessage::with_body_vec(&recipient, &gateway_addr, &thread, body_vec);
        tmsg.set_osrf_xid(&xid);

        // A reused worker connection may still hold replies from a
        // prior request that this thread abandoned (e.g. on timeout).
        self.with_bus(|bus| bus.clear_bus())
            .map_err(|e| (500, e))?;

        self.with_bus(|bus| {
            if let Some(router) = &send_to_router {
                bus.send_to(&tmsg, router)
            } else {
                bus.send(&tmsg)
            }
        })
        .map_err(|e| (500, e))?;

        if disconnect_only {
            self.evict(&thread);
            return Ok(TranslatorResponse::empty(&gateway_addr, &thread));
        }

        self.collect_replies(client_ip, &thread, &service, multipart, timeout)
    }

    /// Waits for replies to the just-sent request, building either a
    /// multipart or a single aggregated JSON-array response.
    fn collect_replies(
        &self,
        client_ip: &str,
        thread: &str,
        service: &str,
        multipart: bool,
        timeout: i32,
    ) -> Result<TranslatorResponse, (u16, String)> {
        let mut timer = util::Timer::new(timeout);
        let mut chunks: Vec<String> = Vec::new();
        let mut from_addr = String::new();

        loop {
            if timer.done() {
                return Err((504, "Gateway timeout waiting for a response".to_string()));
            }

            let remaining = timer.remaining();

            let tm = self
                .with_bus(|bus| bus.recv(remaining, None))
                .map_err(|e| {
                    self.evict(thread);
                    (500, e)
                })?;

            let tm = match tm {
                Some(tm) => tm,
                None => return Err((504, "Gateway timeout waiting for a response".to_string())),
            };

            from_addr = tm.from().to_string();

            let mut terminal = false;

            for msg in tm.body() {
                if let message::Payload::Status(s) = msg.payload() {
                    match *s.status() {
                        message::MessageStatus::Ok => {
                            self.pin(thread, client_ip, tm.from(), service);
                        }
                        message::MessageStatus::Continue => {}
                        message::MessageStatus::Timeout => {
                            self.evict(thread);
                            terminal = true;
                        }
                        _ => terminal = true,
                    }
                }
            }

            let body_str = json::from(
                tm.body()
                    .iter()
                    .map(|m| m.to_json_value())
                    .collect::<Vec<_>>(),
            )
            .dump();

            chunks.push(body_str);

            if terminal {
                break;
            }
        }

        if multipart {
            Ok(TranslatorResponse::multipart(&from_addr, thread, &chunks))
        } else {
            Ok(TranslatorResponse::aggregate(&from_addr, thread, &chunks))
        }
    }

    fn log_request(&self, client_ip: &str, xid: &str, service: &str, msg: &message::Message) {
        let request = match msg.payload() {
            message::Payload::Method(m) => m,
            _ => return,
        };

        let log_params =
            util::stringify_params(request.method(), request.params(), self.log_protect());

        log::info!(
            "ACT:[{}:{}] {} {} {}",
            client_ip,
            xid,
            service,
            request.method(),
            log_params
        );
    }
}

/// A fully-built HTTP response, expressed independently of tiny_http
/// so it can be constructed without borrowing the inbound Request.
struct TranslatorResponse {
    status: u16,
    from: String,
    thread: String,
    content_type: String,
    body: String,
}

impl TranslatorResponse {
    fn empty(from: &str, thread: &str) -> Self {
        TranslatorResponse {
            status: 200,
            from: from.to_string(),
            thread: thread.to_string(),
            content_type: "text/plain".to_string(),
            body: String::new(),
        }
    }

    fn aggregate(from: &str, thread: &str, chunks: &[String]) -> Self {
        let mut combined = String::new();

        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                combined.push_str(&chunk[..chunk.len() - 1]);
            } else {
                let inner = &chunk[1..chunk.len() - 1];
                if !inner.is_empty() {
                    combined.push(',');
                    combined.push_str(inner);
                }
            }
        }
        combined.push(']');

        TranslatorResponse {
            status: 200,
            from: from.to_string(),
            thread: thread.to_string(),
            content_type: "text/plain".to_string(),
            body: combined,
        }
    }

    fn multipart(from: &str, thread: &str, chunks: &[String]) -> Self {
        let boundary = util::random_number(16);
        let mut body = String::new();

        for chunk in chunks {
            body.push_str("--");
            body.push_str(&boundary);
            body.push_str("\r\nContent-Type: text/plain\r\n\r\n");
            body.push_str(chunk);
            body.push_str("\r\n");
        }

        body.push_str("--");
        body.push_str(&boundary);
        body.push_str("--\r\n");

        TranslatorResponse {
            status: 200,
            from: from.to_string(),
            thread: thread.to_string(),
            content_type: format!("multipart/x-mixed-replace; boundary=\"{boundary}\""),
            body,
        }
    }

    fn into_tiny_http(self) -> Response<std::io::Cursor<Vec<u8>>> {
        let mut response = Response::from_string(self.body).with_status_code(self.status);

        if let Ok(h) = Header::from_bytes(&b"Content-Type"[..], self.content_type.as_bytes()) {
            response = response.with_header(h);
        }
        if let Ok(h) = Header::from_bytes(&b"X-OpenSRF-from"[..], self.from.as_bytes()) {
            response = response.with_header(h);
        }
        if let Ok(h) = Header::from_bytes(&b"X-OpenSRF-thread"[..], self.thread.as_bytes()) {
            response = response.with_header(h);
        }

        response
    }
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.to_string().eq_ignore_ascii_case(name))
        .map(|h| h.value.to_string())
}

fn extract_osrf_msg(
    request: &mut Request,
    method: &Method,
    url: &str,
) -> Result<json::JsonValue, String> {
    let raw = if *method == Method::Get {
        let query = url.splitn(2, '?').nth(1).unwrap_or("");
        form_decode(query).remove("osrf-msg")
    } else {
        let mut body = String::new();
        request
            .as_reader()
            .read_to_string(&mut body)
            .map_err(|e| format!("Error reading request body: {e}"))?;
        form_decode(&body).remove("osrf-msg")
    };

    let raw = raw.ok_or_else(|| "Missing osrf-msg parameter".to_string())?;

    json::parse(&raw).map_err(|e| format!("Cannot parse osrf-msg JSON: {e}"))
}

/// Minimal `application/x-www-form-urlencoded` decoder; avoids pulling
/// in a full URL-parsing crate for a single query-string lookup.
fn form_decode(input: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();

    for pair in input.split('&') {
        if pair.is_empty() {
            continue;
        }

        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");

        map.insert(percent_decode(key), percent_decode(value));
    }

    map
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(
                    std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""),
                    16,
                ) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).to_string()
}

fn respond(request: Request, status: u16, content_type: &str, body: &str) {
    let mut response = Response::from_string(body.to_string()).with_status_code(status);

    if let Ok(h) = Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes()) {
        response = response.with_header(h);
    }

    let _ = request.respond(response);
}

fn main() {
    let mut ops = getopts::Options::new();

    ops.optopt("p", "port", "Port", "PORT");
    ops.optopt("a", "address", "Listen Address", "ADDRESS");
    ops.optopt("", "max-workers", "Max Worker Threads", "MAX_WORKERS");

    let initops = init::InitOptions { skip_logging: true };

    let (config, params) = init::init_with_more_options(&mut ops, &initops).unwrap();

    let config = config.into_shared();

    let gateway = config.gateway().expect("No gateway configuration found");

    let logger = Logger::new(gateway.logging()).expect("Creating logger");
    logger.init().expect("Logger Init");

    let address = params
        .opt_get_default("a", "127.0.0.1".to_string())
        .unwrap();

    let port = params
        .opt_get_default("p", DEFAULT_PORT.to_string())
        .unwrap();
    let port = port.parse::<u16>().expect("Invalid port number");

    let max_workers = match params.opt_str("max-workers") {
        Some(mw) => mw.parse::<usize>().expect("Invalid max-workers value"),
        None => DEFAULT_MAX_WORKERS,
    };

    let host = format!("{address}:{port}");

    log::info!("HTTP translator listening at {host}");

    let server = Server::http(&host).expect("Could not start HTTP server");
    let translator = Arc::new(Translator::new(config));
    let pool = ThreadPool::new(max_workers);

    for request in server.incoming_requests() {
        let translator = translator.clone();
        pool.execute(move || translator.handle(request));
    }
}
