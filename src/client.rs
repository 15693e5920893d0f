use super::addr::{ClientAddress, RouterAddress};
use super::bus;
use super::conf;
use super::message;
use super::params::ApiParams;
use super::session::ResponseIterator;
use super::session::SessionHandle;
use super::util;
use json::JsonValue;
use log::{info, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

const DEFAULT_ROUTER_COMMAND_TIMEOUT: i32 = 10;

pub trait DataSerializer {
    fn pack(&self, value: &JsonValue) -> JsonValue;
    fn unpack(&self, value: &JsonValue) -> JsonValue;
}

/// Transport messages pulled off the bus for a thread other than the one
/// currently asking for them, stashed here until their owning session
/// comes looking.
#[derive(Default)]
struct Backlog {
    messages: Vec<message::TransportMessage>,
}

impl Backlog {
    fn stash(&mut self, tm: message::TransportMessage) {
        self.messages.push(tm);
    }

    /// Removes and returns the first stashed message for `thread`, if any.
    fn claim(&mut self, thread: &str) -> Option<message::TransportMessage> {
        let index = self.messages.iter().position(|tm| tm.thread() == thread)?;
        trace!("Found a backlog reply for thread {thread}");
        Some(self.messages.remove(index))
    }

    fn clear(&mut self) {
        self.messages.clear();
    }
}

/// One bus connection per domain we've had reason to talk to: our
/// primary domain's bus, plus a lazily-grown pool of connections to
/// other domains reached via [`ClientSingleton::get_domain_bus`].
struct DomainBuses {
    primary_domain: String,
    primary: bus::Bus,
    remote: HashMap<String, bus::Bus>,
}

impl DomainBuses {
    fn new(primary_domain: String, primary: bus::Bus) -> Self {
        DomainBuses {
            primary_domain,
            primary,
            remote: HashMap::new(),
        }
    }

    fn primary(&self) -> &bus::Bus {
        &self.primary
    }

    fn primary_mut(&mut self) -> &mut bus::Bus {
        &mut self.primary
    }

    /// Returns the bus connection for `domain`, opening a new connection
    /// that reuses our primary domain's credentials/transport if one
    /// does not already exist.
    fn get_or_connect(
        &mut self,
        domain: &str,
        template: &conf::BusClient,
    ) -> Result<&mut bus::Bus, String> {
        trace!("Loading bus connection for domain: {domain}");

        if domain == self.primary_domain {
            return Ok(&mut self.primary);
        }

        if !self.remote.contains_key(domain) {
            // Assume the same connection type, etc. as our primary
            // connection is used and just change the domain.
            let mut conf = template.clone();
            conf.set_domain(domain);

            let bus = bus::Bus::new(&conf)?;
            info!("Opened connection to new domain: {domain}");

            self.remote.insert(domain.to_string(), bus);
        }

        Ok(self.remote.get_mut(domain).unwrap())
    }
}

/// Generally speaking, we only need 1 ClientSingleton per thread (hence
/// the name).  This manages one bus connection per domain and stores
/// messages pulled from the bus that have not yet been processed by
/// higher-up modules.
pub struct ClientSingleton {
    buses: DomainBuses,
    domain: String,
    config: Arc<conf::Config>,
    backlog: Backlog,

    /// If present, JsonValue's will be passed through its pack() and
    /// unpack() methods before/after data hits the network.
    serializer: Option<Arc<dyn DataSerializer>>,
}

impl ClientSingleton {
    fn new(config: Arc<conf::Config>) -> Result<ClientSingleton, String> {
        let bus = bus::Bus::new(config.client())?;
        let domain = config.client().domain().name().to_string();

        Ok(ClientSingleton {
            config,
            buses: DomainBuses::new(domain.clone(), bus),
            domain,
            backlog: Backlog::default(),
            serializer: None,
        })
    }

    pub fn serializer(&self) -> &Option<Arc<dyn DataSerializer>> {
        &self.serializer
    }

    fn clear_backlog(&mut self) {
        self.backlog.clear();
    }

    /// Full bus address as a string
    fn address(&self) -> &str {
        self.buses.primary().address().as_str()
    }

    /// Our primary bus domain
    fn domain(&self) -> &str {
        &self.domain
    }

    pub fn bus(&self) -> &bus::Bus {
        self.buses.primary()
    }

    pub fn bus_mut(&mut self) -> &mut bus::Bus {
        self.buses.primary_mut()
    }

    pub fn get_domain_bus(&mut self, domain: &str) -> Result<&mut bus::Bus, String> {
        self.buses.get_or_connect(domain, self.config.client())
    }

    /// Waits for one TransportMessage to arrive, for any session,
    /// stashing it on the backlog for the owning session to claim later.
    ///
    /// Returns true if a message arrived within the timeout.
    fn wait(&mut self, timeout: i32) -> Result<bool, String> {
        match self.buses.primary_mut().recv(timeout, None)? {
            Some(tm) => {
                self.backlog.stash(tm);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn recv_session(
        &mut self,
        timer: &mut util::Timer,
        thread: &str,
    ) -> Result<Option<message::TransportMessage>, String> {
        loop {
            if let Some(tm) = self.backlog.claim(thread) {
                return Ok(Some(tm));
            }

            if timer.done() {
                // Nothing in the backlog and all out of time.
                return Ok(None);
            }

            // See what we can pull from the message bus, then loop back
            // around and see if it's the one our caller is waiting on.
            if let Some(tm) = self.buses.primary_mut().recv(timer.remaining(), None)? {
                self.backlog.stash(tm);
            }
        }
    }

    fn build_router_command(
        &self,
        router_command: &str,
        router_class: Option<&str>,
    ) -> message::TransportMessage {
        let addr = RouterAddress::new("router", self.domain());

        // Always use the address of our primary Bus.
        let mut tmsg = message::TransportMessage::new(
            addr.as_str(),
            self.buses.primary().address().as_str(),
            &util::random_number(16),
        );

        tmsg.set_router_command(router_command);
        if let Some(rc) = router_class {
            tmsg.set_router_class(rc);
        }

        tmsg
    }

    fn parse_router_reply(
        router_command: &str,
        reply: &message::TransportMessage,
    ) -> Result<JsonValue, String> {
        let content = reply.router_reply().ok_or_else(|| {
            format!("Router command {router_command} returned without reply_content")
        })?;

        json::parse(content).map_err(|e| {
            format!("Router command {router_command} returned unparseable content: {content} {e}")
        })
    }

    fn send_router_command(
        &mut self,
        domain: &str,
        router_command: &str,
        router_class: Option<&str>,
        await_reply: bool,
    ) -> Result<Option<JsonValue>, String> {
        let tmsg = self.build_router_command(router_command, router_class);

        let bus = self.get_domain_bus(domain)?;
        bus.send(&tmsg)?;

        if !await_reply {
            return Ok(None);
        }

        // Always listen on our primary bus.
        // TODO rethink this.  If we have replies from other requests
        // sitting in the bus, they may be received here instead
        // of the expected router response.  self.bus.clear() before
        // send is one option, but pretty heavy-handed.
        let reply = self
            .buses
            .primary_mut()
            .recv(DEFAULT_ROUTER_COMMAND_TIMEOUT, None)?
            .ok_or_else(|| {
                format!(
                    "Router command {router_command} returned no results in {DEFAULT_ROUTER_COMMAND_TIMEOUT} seconds"
                )
            })?;

        Self::parse_router_reply(router_command, &reply).map(Some)
    }
}

impl fmt::Display for ClientSingleton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSingleton({})", self.address())
    }
}

/// Wrapper around our ClientSingleton Ref so we can easily share a client
/// within a given thread.
///
/// Wrapping the Ref in a struct allows us to present a client-like
/// API to the caller.  I.e. the caller is not required to .borrow() /
/// .borrow_mut() directly when performing actions against the client Ref.
///
/// When a new client Ref is needed, clone the Client.
#[derive(Clone)]
pub struct Client {
    singleton: Rc<RefCell<ClientSingleton>>,
    address: ClientAddress,
    domain: String,
}

impl Client {
    pub fn connect(config: Arc<conf::Config>) -> Result<Client, String> {
        // This performs the actual bus-level connection.
        let singleton = ClientSingleton::new(config)?;

        let address = ClientAddress::from_addr(singleton.bus().address().clone())?;
        let domain = singleton.domain().to_string();

        Ok(Client {
            address,
            domain,
            singleton: Rc::new(RefCell::new(singleton)),
        })
    }

    pub fn singleton(&self) -> &Rc<RefCell<ClientSingleton>> {
        &self.singleton
    }

    pub fn clone(&self) -> Self {
        Client {
            address: self.address().clone(),
            domain: self.domain().to_string(),
            singleton: self.singleton().clone(),
        }
    }

    pub fn set_serializer(&self, serializer: Arc<dyn DataSerializer>) {
        self.singleton.borrow_mut().serializer = Some(serializer);
    }

    pub fn address(&self) -> &ClientAddress {
        &self.address
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Create a new client session for the requested service.
    pub fn session(&self, service: &str) -> SessionHandle {
        SessionHandle::new(self.clone(), service)
    }

    /// Discard any unprocessed messages from our backlog and clear our
    /// stream of pending messages on the bus.
    pub fn clear(&self) -> Result<(), String> {
        self.singleton().borrow_mut().clear_backlog();
        self.singleton().borrow_mut().bus_mut().clear_bus()
    }

    /// Waits up to `timeout` seconds for a reply to arrive on the bus
    /// for any outstanding session.  Returns true if one arrived.
    pub fn wait(&self, timeout: i32) -> Result<bool, String> {
        self.singleton().borrow_mut().wait(timeout)
    }

    pub fn send_router_command(
        &self,
        domain: &str,
        command: &str,
        router_class: Option<&str>,
        await_reply: bool,
    ) -> Result<Option<JsonValue>, String> {
        self.singleton()
            .borrow_mut()
            .send_router_command(domain, command, router_class, await_reply)
    }

    /// Send a request and receive a ResponseIterator for iterating
    /// the responses to the method.
    ///
    /// Uses the default request timeout DEFAULT_REQUEST_TIMEOUT.
    pub fn sendrecv<T>(
        &self,
        service: &str,
        method: &str,
        params: T,
    ) -> Result<ResponseIterator, String>
    where
        T: Into<ApiParams>,
    {
        Ok(ResponseIterator::new(
            self.session(service).request(method, params)?,
        ))
    }

    pub fn config(&self) -> Arc<conf::Config> {
        self.singleton().borrow().config.clone()
    }
}
