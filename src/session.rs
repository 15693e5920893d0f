//! The CONNECT/REQUEST/DISCONNECT conversation, from both ends: the
//! client side (`SessionHandle`/`Request`/`MultiSession`) that issues
//! calls and reads replies, and the server side (`ServerSession`) a
//! drone uses to answer one.

use super::addr::BusAddress;
use super::client::{Client, ClientSingleton};
use super::message;
use super::message::Message;
use super::message::MessageStatus;
use super::message::MessageType;
use super::message::Method;
use super::message::Payload;
use super::message::Status;
use super::message::TransportMessage;
use super::params::ApiParams;
use super::util;
use json::JsonValue;
use std::cell::RefCell;
use std::cell::RefMut;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

const CONNECT_TIMEOUT: i32 = 10;
pub const DEFAULT_REQUEST_TIMEOUT: i32 = 60;

/// One reply pulled off the bus for a specific request.
#[derive(Debug)]
struct Response {
    value: Option<JsonValue>,
    /// The request that produced this reply has seen its final message.
    complete: bool,
    /// This reply is one chunk of a larger value split across messages.
    partial: bool,
}

/// Accumulates the string chunks of a "partial" response (one whose
/// JSON value was too large for a single transport message) until a
/// PartialComplete message says the value is whole.
#[derive(Default)]
struct PartialAssembly {
    buf: Option<String>,
}

impl PartialAssembly {
    fn push_chunk(&mut self, chunk: &str) {
        self.buf.get_or_insert_with(String::new).push_str(chunk);
    }

    /// Appends a final chunk (if any) and parses the accumulated text as
    /// a complete JSON value.
    fn finish(&mut self, trailing_chunk: Option<&str>) -> Result<JsonValue, String> {
        let mut buf = self.buf.take().unwrap_or_default();

        if let Some(chunk) = trailing_chunk {
            buf.push_str(chunk);
        }

        json::parse(&buf).map_err(|e| format!("Error reconstituting partial message: {e}"))
    }
}

/// FIFO of replies that have arrived but not yet been claimed by the
/// `Request` whose thread_trace they answer.
#[derive(Default)]
struct Backlog {
    messages: VecDeque<Message>,
}

impl Backlog {
    fn push(&mut self, msg: Message) {
        self.messages.push_back(msg);
    }

    /// Removes and returns the first queued message for `thread_trace`,
    /// if any.
    fn take(&mut self, thread_trace: usize) -> Option<Message> {
        let index = self
            .messages
            .iter()
            .position(|m| m.thread_trace() == thread_trace)?;

        self.messages.remove(index)
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn clear(&mut self) {
        self.messages.clear();
    }
}

/// One API call a caller can poll for responses.
#[derive(Clone)]
pub struct Request {
    /// Link back to the session so we can pull bus data through it.
    session: Rc<RefCell<Session>>,

    /// Set once a COMPLETE message has been seen for this request.
    complete: bool,

    /// Unique per-session call id; replies echo this back.
    thread_trace: usize,

    /// Local copy of the thread id, since `session` is reachable only
    /// through a temporary borrow.
    thread: String,
}

impl Request {
    fn new(thread: String, session: Rc<RefCell<Session>>, thread_trace: usize) -> Request {
        Request {
            session,
            thread,
            thread_trace,
            complete: false,
        }
    }

    pub fn thread(&self) -> &str {
        &self.thread
    }

    pub fn thread_trace(&self) -> usize {
        self.thread_trace
    }

    /// A COMPLETE message has arrived. Doesn't imply every reply has
    /// been read yet — see [`Request::exhausted`].
    pub fn complete(&self) -> bool {
        self.complete
    }

    /// A COMPLETE message has arrived AND every backlogged reply for
    /// this request has been drained.
    pub fn exhausted(&self) -> bool {
        self.complete && self.session.borrow().backlog.is_empty()
    }

    /// Reads every response off the bus and returns the first one —
    /// useful when exactly one reply is expected, or only the first
    /// matters but the stream still needs draining to COMPLETE.
    pub fn first(&mut self) -> Result<Option<JsonValue>, String> {
        self.first_with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn first_with_timeout(&mut self, timeout: i32) -> Result<Option<JsonValue>, String> {
        let mut first = None;

        while !self.complete {
            if let Some(value) = self.recv_with_timeout(timeout)? {
                first.get_or_insert(value);
            }
        }

        Ok(first)
    }

    /// Receives the next reply to this request.
    ///
    /// `timeout`: negative waits forever, zero never blocks, positive
    /// waits up to that many seconds.
    pub fn recv_with_timeout(&mut self, timeout: i32) -> Result<Option<JsonValue>, String> {
        // Once complete, every remaining reply is already on our
        // backlog — there's nothing left to wait on the bus for.
        let timeout = if self.complete { 0 } else { timeout };

        loop {
            let response = self.session.borrow_mut().recv(self.thread_trace, timeout)?;

            let response = match response {
                Some(r) => r,
                None => return Ok(None),
            };

            if response.partial {
                // A partial reply resets our effective wait: once data
                // starts arriving we keep polling until it's whole,
                // regardless of the caller's original timeout.
                continue;
            }

            if response.complete {
                self.complete = true;
            }

            return Ok(response.value);
        }
    }

    pub fn recv(&mut self) -> Result<Option<JsonValue>, String> {
        self.recv_with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }
}

/// Client-side conversation state: which service/worker we're talking
/// to, whether we're CONNECTed, and the backlog of replies not yet
/// claimed by a `Request`.
struct Session {
    client: Client,

    /// Random per-session thread id; identifies this conversation on
    /// the wire.
    thread: String,

    connected: bool,
    service: String,

    /// Address of the service as a whole — used for the first request
    /// of a conversation, before a specific worker has replied.
    service_addr: BusAddress,

    /// Router this session's top-level requests are dispatched through.
    router_addr: BusAddress,

    /// Address of the specific drone handling this conversation, once
    /// it has replied at least once.
    worker_addr: Option<BusAddress>,

    last_thread_trace: usize,
    backlog: Backlog,
    partial: PartialAssembly,
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({} {})", self.service(), self.thread())
    }
}

impl Session {
    fn new(client: Client, service: &str) -> Session {
        let router_addr = super::addr::RouterAddress::new("router", client.domain())
            .addr()
            .clone();

        let service_addr = super::addr::ServiceAddress::new(service).addr().clone();

        Session {
            client,
            router_addr,
            service_addr,
            worker_addr: None,
            service: service.to_string(),
            connected: false,
            last_thread_trace: 0,
            partial: PartialAssembly::default(),
            backlog: Backlog::default(),
            thread: util::random_number(16),
        }
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn thread(&self) -> &str {
        &self.thread
    }

    fn connected(&self) -> bool {
        self.connected
    }

    fn reset(&mut self) {
        log::trace!("{self} resetting...");
        self.worker_addr = None;
        self.connected = false;
        self.backlog.clear();
    }

    fn router_addr(&self) -> &BusAddress {
        &self.router_addr
    }

    fn worker_addr(&self) -> Option<&BusAddress> {
        self.worker_addr.as_ref()
    }

    fn service_addr(&self) -> &BusAddress {
        &self.service_addr
    }

    fn client_internal_mut(&self) -> RefMut<ClientSingleton> {
        self.client.singleton().borrow_mut()
    }

    /// Where the next message to the remote end should go: the known
    /// worker if we've heard from one, else the service as a whole.
    fn destination_addr(&self) -> &BusAddress {
        self.worker_addr().unwrap_or_else(|| self.service_addr())
    }

    /// Sends one transport message toward `addr`, routing it through
    /// our router if we aren't connected to a specific worker yet.
    fn send_toward(&mut self, addr: &BusAddress, tmsg: &TransportMessage) -> Result<(), String> {
        if !self.connected() {
            let router_addr = self.router_addr().as_str().to_string();
            return self.client_internal_mut().bus_mut().send_to(tmsg, &router_addr);
        }

        self.client_internal_mut()
            .get_domain_bus(addr.domain())?
            .send(tmsg)
    }

    fn recv(&mut self, thread_trace: usize, timeout: i32) -> Result<Option<Response>, String> {
        let mut timer = util::Timer::new(timeout);
        let mut first_loop = true;

        loop {
            log::trace!(
                "{self} in recv() for trace {thread_trace} with {} remaining",
                timer.remaining()
            );

            if let Some(msg) = self.backlog.take(thread_trace) {
                return self.unpack_reply(&mut timer, msg);
            }

            if first_loop {
                first_loop = false;
            } else if timer.done() {
                return Ok(None);
            }

            let received = self
                .client_internal_mut()
                .recv_session(&mut timer, self.thread())?;

            let mut tmsg = match received {
                Some(m) => m,
                None => continue, // timeout, etc.
            };

            self.worker_addr = Some(BusAddress::parse(tmsg.from())?);

            for msg in tmsg.body_as_mut().drain(..) {
                self.backlog.push(msg);
            }
        }
    }

    /// Unpacks one OSRF message; a single transport message may carry
    /// several.
    fn unpack_reply(
        &mut self,
        timer: &mut util::Timer,
        mut msg: Message,
    ) -> Result<Option<Response>, String> {
        if let Payload::Result(resp) = msg.payload_mut() {
            log::trace!("unpack_reply() status={}", resp.status());

            let mut value = resp.take_content();

            match resp.status() {
                MessageStatus::Partial => {
                    if let Some(chunk) = value.as_str() {
                        self.partial.push_chunk(chunk);
                    }

                    return Ok(Some(Response {
                        value: None,
                        complete: false,
                        partial: true,
                    }));
                }
                MessageStatus::PartialComplete => {
                    value = self.partial.finish(value.as_str())?;
                    log::trace!("Partial message is now complete");
                }
                _ => {}
            }

            if let Some(s) = self.client.singleton().borrow().serializer() {
                value = s.unpack(&value);
            }

            return Ok(Some(Response {
                value: Some(value),
                complete: false,
                partial: false,
            }));
        }

        let trace = msg.thread_trace();

        let err_msg = if let Payload::Status(stat) = msg.payload() {
            match self.unpack_status_message(trace, timer, stat) {
                Ok(v) => return Ok(v),
                Err(e) => e,
            }
        } else {
            format!("{self} unexpected response for request {trace}: {msg:?}")
        };

        self.reset();
        Err(err_msg)
    }

    fn unpack_status_message(
        &mut self,
        trace: usize,
        timer: &mut util::Timer,
        statmsg: &Status,
    ) -> Result<Option<Response>, String> {
        match statmsg.status() {
            MessageStatus::Ok => {
                log::trace!("{self} marking self as connected");
                self.connected = true;
                Ok(None)
            }
            MessageStatus::Continue => {
                timer.reset();
                Ok(None)
            }
            MessageStatus::Complete => {
                log::trace!("{self} request {trace} complete");
                Ok(Some(Response {
                    value: None,
                    complete: true,
                    partial: false,
                }))
            }
            _ => {
                self.reset();
                Err(format!("{self} request {trace} failed: {statmsg}"))
            }
        }
    }

    fn incr_thread_trace(&mut self) -> usize {
        self.last_thread_trace += 1;
        self.last_thread_trace
    }

    /// Issues a new API call, returning its thread_trace.
    fn request<T>(&mut self, method: &str, params: T) -> Result<usize, String>
    where
        T: Into<ApiParams>,
    {
        log::debug!("{self} sending request {method}");

        let trace = self.incr_thread_trace();

        let params: ApiParams = params.into();
        let params = params
            .serialize(&self.client)
            .unwrap_or_else(|| params.params().clone());

        if !self.connected() {
            // Not connected, so any previously-known worker is stale.
            self.worker_addr = None;
        }

        let destination = self.destination_addr().clone();

        let tmsg = TransportMessage::with_body(
            destination.as_str(),
            self.client.address().as_str(),
            self.thread(),
            Message::new(
                MessageType::Request,
                trace,
                Payload::Method(Method::new(method, params)),
            ),
        );

        if self.connected() && self.worker_addr().is_none() {
            self.reset();
            return Err("We are connected, but have no worker_addr()".to_string());
        }

        self.send_toward(&destination, &tmsg)?;

        Ok(trace)
    }

    /// Establishes a connected conversation with a remote worker.
    fn connect(&mut self) -> Result<(), String> {
        if self.connected() {
            log::warn!("{self} is already connected");
            return Ok(());
        }

        self.worker_addr = None;

        log::debug!("{self} sending CONNECT");

        let trace = self.incr_thread_trace();

        let tm = TransportMessage::with_body(
            self.destination_addr().as_str(),
            self.client.address().as_str(),
            self.thread(),
            Message::new(MessageType::Connect, trace, Payload::NoPayload),
        );

        let router_addr = self.router_addr().as_str().to_string();
        self.client_internal_mut()
            .bus_mut()
            .send_to(&tm, &router_addr)?;

        self.recv(trace, CONNECT_TIMEOUT)?;

        if self.connected() {
            log::trace!("{self} connected OK");
            Ok(())
        } else {
            self.reset();
            Err("CONNECT timed out".to_string())
        }
    }

    /// Sends DISCONNECT to our remote worker and does not wait for a
    /// reply. No-op if not connected.
    fn disconnect(&mut self) -> Result<(), String> {
        if !self.connected() || self.worker_addr().is_none() {
            self.reset();
            return Ok(());
        }

        let dest_addr = self.worker_addr().expect("checked above").clone();
        let trace = self.incr_thread_trace();

        log::debug!("{self} sending DISCONNECT");

        let tmsg = TransportMessage::with_body(
            dest_addr.as_str(),
            self.client.address().as_str(),
            self.thread(),
            Message::new(MessageType::Disconnect, trace, Payload::NoPayload),
        );

        self.client_internal_mut()
            .get_domain_bus(dest_addr.domain())?
            .send(&tmsg)?;

        self.reset();

        Ok(())
    }
}

/// Public handle onto a client conversation with one service.
pub struct SessionHandle {
    session: Rc<RefCell<Session>>,
}

impl SessionHandle {
    pub fn new(client: Client, service: &str) -> SessionHandle {
        let session = Session::new(client, service);
        log::trace!("Created new session {session}");

        SessionHandle {
            session: Rc::new(RefCell::new(session)),
        }
    }

    /// Issues a new API call and returns a `Request` to read its
    /// responses. `params` is anything JSON-able, e.g. `vec![1, 2, 3]`
    /// or `json::object! {"a": "b"}`.
    pub fn request<T>(&mut self, method: &str, params: T) -> Result<Request, String>
    where
        T: Into<ApiParams>,
    {
        let thread = self.session.borrow().thread().to_string();
        let thread_trace = self.session.borrow_mut().request(method, params)?;

        Ok(Request::new(thread, self.session.clone(), thread_trace))
    }

    /// Issues a request and wraps it in a `ResponseIterator`, using
    /// `DEFAULT_REQUEST_TIMEOUT` per reply.
    pub fn send_recv<T>(&mut self, method: &str, params: T) -> Result<ResponseIterator, String>
    where
        T: Into<ApiParams>,
    {
        Ok(ResponseIterator::new(self.request(method, params)?))
    }

    pub fn connect(&self) -> Result<(), String> {
        self.session.borrow_mut().connect()
    }

    pub fn disconnect(&self) -> Result<(), String> {
        self.session.borrow_mut().disconnect()
    }

    pub fn connected(&self) -> bool {
        self.session.borrow().connected()
    }
}

/// Iterates over the replies to one request.
pub struct ResponseIterator {
    request: Request,
}

impl ResponseIterator {
    pub fn new(request: Request) -> Self {
        ResponseIterator { request }
    }
}

impl Iterator for ResponseIterator {
    type Item = Result<JsonValue, String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.request.recv().transpose()
    }
}

/// Fires a batch of one-shot requests in parallel and lets the caller
/// drain whichever replies arrive first, without tracking each
/// underlying session by hand.
///
/// Each request gets its own session, so connected (stateful) sessions
/// aren't supported here.
pub struct MultiSession {
    client: Client,
    service: String,
    requests: Vec<Request>,
}

impl MultiSession {
    pub fn new(client: Client, service: &str) -> MultiSession {
        MultiSession {
            client,
            service: service.to_string(),
            requests: Vec::new(),
        }
    }

    /// Opens a new session and sends one request through it. Returns
    /// the session's thread so the caller can match replies from
    /// [`MultiSession::recv`] back to this request.
    pub fn request<T>(&mut self, method: &str, params: T) -> Result<String, String>
    where
        T: Into<ApiParams>,
    {
        let mut session = self.client.session(&self.service);
        let request = session.request(method, params)?;
        let thread = request.thread().to_string();

        self.requests.push(request);

        Ok(thread)
    }

    /// True once every request has a COMPLETE message and an empty
    /// backlog. May retire finished requests as a side effect.
    pub fn complete(&mut self) -> bool {
        self.remove_completed();
        self.requests.is_empty()
    }

    /// Waits up to `timeout` seconds for a reply to any outstanding
    /// request, returning `(thread, value)` for whichever arrives
    /// first.
    pub fn recv(&mut self, timeout: i32) -> Result<Option<(String, JsonValue)>, String> {
        if self.client.wait(timeout)? {
            for request in self.requests.iter_mut() {
                if let Some(value) = request.recv_with_timeout(0)? {
                    return Ok(Some((request.thread.clone(), value)));
                }
            }
        }

        self.remove_completed();

        Ok(None)
    }

    fn remove_completed(&mut self) {
        self.requests.retain(|r| !r.exhausted());
    }
}

/// Server-side counterpart to a client `Session`: the state a drone
/// uses to reply to one caller's request(s).
pub struct ServerSession {
    service: String,
    client: Client,
    thread: String,
    sender: BusAddress,

    /// Set once a COMPLETE message has gone out, to guard against
    /// sending further replies afterward.
    responded_complete: bool,

    last_thread_trace: usize,

    /// When set, `respond()` appends here instead of sending
    /// immediately; `send_complete()` flushes the whole batch as one
    /// "atomic" array reply.
    atomic_resp_queue: Option<Vec<JsonValue>>,
}

impl fmt::Display for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerSession({} {})", self.service(), self.thread())
    }
}

impl ServerSession {
    pub fn new(
        client: Client,
        service: &str,
        thread: &str,
        last_thread_trace: usize,
        sender: BusAddress,
    ) -> ServerSession {
        ServerSession {
            client,
            sender,
            last_thread_trace,
            service: service.to_string(),
            thread: thread.to_string(),
            responded_complete: false,
            atomic_resp_queue: None,
        }
    }

    pub fn last_thread_trace(&self) -> usize {
        self.last_thread_trace
    }

    pub fn set_last_thread_trace(&mut self, trace: usize) {
        self.last_thread_trace = trace;
    }

    pub fn clear_responded_complete(&mut self) {
        self.responded_complete = false;
    }

    pub fn thread(&self) -> &str {
        &self.thread
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn sender(&self) -> &BusAddress {
        &self.sender
    }

    pub fn new_atomic_resp_queue(&mut self) {
        log::debug!("{self} starting new atomic queue...");
        self.atomic_resp_queue = Some(Vec::new());
    }

    fn client_internal_mut(&self) -> RefMut<ClientSingleton> {
        self.client.singleton().borrow_mut()
    }

    pub fn responded_complete(&self) -> bool {
        self.responded_complete
    }

    /// Builds and sends one transport message of type `mtype` to our
    /// caller, sharing the domain-routing logic `respond`/
    /// `send_complete` both need.
    fn send_to_caller(&self, mtype: MessageType, payload: Payload) -> Result<(), String> {
        let msg = Message::new(mtype, self.last_thread_trace(), payload);

        let tmsg = TransportMessage::with_body(
            self.sender.as_str(),
            self.client.address().as_str(),
            self.thread(),
            msg,
        );

        self.client_internal_mut()
            .get_domain_bus(self.sender.domain())?
            .send(&tmsg)
    }

    pub fn respond<T>(&mut self, value: T) -> Result<(), String>
    where
        T: Into<JsonValue>,
    {
        let mut value = json::from(value);

        if let Some(s) = self.client.singleton().borrow().serializer() {
            value = s.pack(&value);
        }

        if let Some(queue) = &mut self.atomic_resp_queue {
            queue.push(value);
            return Ok(());
        }

        self.send_to_caller(
            MessageType::Result,
            Payload::Result(message::Result::new(
                MessageStatus::Ok,
                "OK",
                "osrfResult",
                value,
            )),
        )
    }

    pub fn respond_complete<T>(&mut self, value: T) -> Result<(), String>
    where
        T: Into<JsonValue>,
    {
        if self.responded_complete {
            log::warn!(
                "respond_complete() called multiple times for thread {}. Dropping trailing responses",
                self.thread()
            );
            return Ok(());
        }

        self.respond(value)?;
        self.send_complete()
    }

    /// Sends the Request Complete status message, flushing any pending
    /// atomic-queue responses first. Equivalent to `respond_complete()`
    /// with no value.
    pub fn send_complete(&mut self) -> Result<(), String> {
        self.responded_complete = true;

        if let Some(queue) = self.atomic_resp_queue.take() {
            log::debug!("{self} responding with contents of atomic queue");
            self.respond(queue)?;
        }

        self.send_to_caller(
            MessageType::Status,
            Payload::Status(message::Status::new(
                MessageStatus::Complete,
                "Request Complete",
                "osrfStatus",
            )),
        )
    }
}
