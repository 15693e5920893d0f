//! Traits a service implements to plug into the prefork listener: what
//! methods it exposes, what per-worker state it carries, and the
//! lifecycle hooks the listener calls as drones come up, go idle, and
//! shut down.

use super::client;
use super::conf;
use super::message;
use super::method;
use super::sclient;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A service's entry point: one `name()`, one startup hook, one method
/// table, one way to spin up workers.
pub trait Application {
    /// Service name, e.g. `opensrf.settings`.
    fn name(&self) -> &str;

    /// Runs once, right after the service connects to the bus.
    fn init(
        &mut self,
        client: client::Client,
        config: Arc<conf::Config>,
        host_settings: Arc<sclient::HostSettings>,
    ) -> Result<(), String>;

    /// Builds the method table. Called after `init()`, before any
    /// worker threads are spawned.
    fn register_methods(
        &self,
        client: client::Client,
        config: Arc<conf::Config>,
        host_settings: Arc<sclient::HostSettings>,
    ) -> Result<Vec<method::Method>, String>;

    /// A function pointer that produces new `ApplicationWorker`
    /// instances. A bare function, rather than a trait object, since
    /// trait objects can't cross a thread-spawn boundary but function
    /// pointers can.
    fn worker_factory(&self) -> ApplicationWorkerFactory;

    /// Builds one instance of this application's shared environment.
    fn env(&self) -> Box<dyn ApplicationEnv>;
}

pub type ApplicationWorkerFactory = fn() -> Box<dyn ApplicationWorker>;

/// Read-only, `Send + Sync` state shared by every drone in a service —
/// things built once at startup and handed to each worker thread.
pub trait ApplicationEnv: Any + Sync + Send {
    fn as_any(&self) -> &dyn Any;
}

/// Per-thread worker state and the lifecycle hooks the listener invokes
/// around it.
pub trait ApplicationWorker: Any {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Hands the worker its copies of the service-wide environment:
    /// bus client, config, host settings, and method table.
    fn absorb_env(
        &mut self,
        client: client::Client,
        config: Arc<conf::Config>,
        host_settings: Arc<sclient::HostSettings>,
        methods: Arc<HashMap<String, method::Method>>,
        env: Box<dyn ApplicationEnv>,
    ) -> Result<(), String>;

    fn methods(&self) -> &Arc<HashMap<String, method::Method>>;

    /// Runs once, right after `absorb_env`, before any request is
    /// handled.
    fn worker_start(&mut self) -> Result<(), String>;

    /// Runs whenever the worker wakes with nothing else to do — no
    /// shutdown signal, keepalive timeout, or pending request. `connected`
    /// is true mid-stateful-conversation.
    fn worker_idle_wake(&mut self, connected: bool) -> Result<(), String>;

    /// Runs once the worker thread is retiring, for any cleanup.
    fn worker_end(&mut self) -> Result<(), String>;

    /// Runs on CONNECT for a stateful session, and once per request for
    /// a stateless one.
    fn start_session(&mut self) -> Result<(), String>;

    /// Runs on DISCONNECT (or keepalive timeout) for a stateful session,
    /// and once the single request completes for a stateless one.
    fn end_session(&mut self) -> Result<(), String>;

    /// Runs when a client CONNECTs but never DISCONNECTs within the
    /// configured timeout.
    fn keepalive_timeout(&mut self) -> Result<(), String>;

    fn api_call_error(&mut self, request: &message::Method, error: &str);
}
