//! XML-backed configuration: bus credentials/domains, the routers this
//! process trusts, the HTTP gateway's bus identity, and logging options.
//! Parsed from the `<config><opensrf>...</opensrf></config>` document
//! every binary in this crate starts from.

use gethostname::gethostname;
use roxmltree;
use std::fs;
use std::str::FromStr;
use std::sync::Arc;
use syslog;

const DEFAULT_BUS_PORT: u16 = 6379;

/// Finds the first direct child of `node` with tag name `name`.
/// Nearly every section of the config document looks up a handful of
/// known child tags, so this one lookup replaces what would otherwise
/// be a `.children().filter(...).next()` at every call site.
fn find_child<'a, 'input>(
    node: &roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

/// Text content of the first direct child of `node` named `name`, if
/// both the child and its text exist.
fn find_child_text<'a: 'input, 'input>(
    node: &roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<&'input str> {
    find_child(node, name)?.text()
}

#[derive(Debug, Clone)]
pub enum LogFile {
    Syslog,
    Filename(String),
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    log_level: Option<log::LevelFilter>,
    log_file: Option<LogFile>,
    syslog_facility: Option<syslog::Facility>,
    activity_log_facility: Option<syslog::Facility>,
}

impl LogOptions {
    fn empty() -> LogOptions {
        LogOptions {
            log_level: None,
            log_file: None,
            syslog_facility: None,
            activity_log_facility: None,
        }
    }

    pub fn syslog_facility(&self) -> Option<syslog::Facility> {
        self.syslog_facility
    }
    pub fn activity_log_facility(&self) -> Option<syslog::Facility> {
        self.activity_log_facility
    }
    pub fn log_file(&self) -> &Option<LogFile> {
        &self.log_file
    }
    pub fn log_level(&self) -> &Option<log::LevelFilter> {
        &self.log_level
    }
    pub fn set_log_level(&mut self, level: &str) {
        self.log_level = Some(LogOptions::log_level_from_str(level));
    }

    /// Maps the OpenSRF 1-5 log level numbers onto `log::LevelFilter`.
    /// Defaults to `Info` for anything out of range.
    pub fn log_level_from_str(level: &str) -> log::LevelFilter {
        match level {
            "1" => log::LevelFilter::Error,
            "2" => log::LevelFilter::Warn,
            "3" => log::LevelFilter::Info,
            "4" => log::LevelFilter::Debug,
            "5" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }
}

/// A single message bus endpoint domain/host.
#[derive(Debug, Clone)]
pub struct BusDomain {
    name: String,
    port: u16,
}

impl BusDomain {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// A set of bus login credentials.
#[derive(Debug, Clone)]
pub struct BusClient {
    username: String,
    password: String,
    domain: BusDomain,
    logging: LogOptions,
    settings_config: Option<String>,
    routers: Vec<ClientRouter>,
}

impl BusClient {
    pub fn username(&self) -> &str {
        &self.username
    }
    pub fn password(&self) -> &str {
        &self.password
    }
    pub fn domain(&self) -> &BusDomain {
        &self.domain
    }
    pub fn logging(&self) -> &LogOptions {
        &self.logging
    }
    pub fn logging_mut(&mut self) -> &mut LogOptions {
        &mut self.logging
    }
    pub fn settings_config(&self) -> Option<&str> {
        self.settings_config.as_deref()
    }
    pub fn routers(&self) -> &Vec<ClientRouter> {
        &self.routers
    }
    pub fn set_domain(&mut self, domain: &str) {
        self.domain.name = domain.to_string();
    }
    pub fn set_username(&mut self, username: &str) {
        self.username = username.to_string();
    }
    pub fn set_password(&mut self, password: &str) {
        self.password = password.to_string();
    }
}

#[derive(Debug, Clone)]
pub struct ClientRouter {
    domain: String,
    services: Option<Vec<String>>,
}

impl ClientRouter {
    pub fn services(&self) -> Option<&Vec<String>> {
        self.services.as_ref()
    }
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    client: BusClient,
}

impl Router {
    pub fn client(&self) -> &BusClient {
        &self.client
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    client: Option<BusClient>,
    routers: Vec<Router>,
    gateway: Option<BusClient>,
    log_protect: Vec<String>,
}

impl ConfigBuilder {
    pub fn build(self) -> Result<Config, String> {
        let client = self
            .client
            .ok_or_else(|| "Config has no client settings".to_string())?;

        Ok(Config {
            hostname: Config::get_os_hostname()?,
            client,
            routers: self.routers,
            gateway: self.gateway,
            log_protect: self.log_protect,
        })
    }

    pub fn from_file(filename: &str) -> Result<Self, String> {
        let text = fs::read_to_string(filename).map_err(|e| {
            format!("Error reading configuration file: file='{filename}' {e:?}")
        })?;

        ConfigBuilder::from_xml_string(&text)
    }

    pub fn from_xml_string(xml: &str) -> Result<Self, String> {
        let doc = roxmltree::Document::parse(xml).map_err(|e| format!("Error parsing XML: {e}"))?;

        let conf_node =
            find_child(&doc.root(), "config").ok_or_else(|| "Missing 'config' element".to_string())?;

        let mut builder = ConfigBuilder {
            client: None,
            gateway: None,
            routers: Vec::new(),
            log_protect: Vec::new(),
        };

        for node in conf_node.children() {
            match node.tag_name().name() {
                "opensrf" => builder.unpack_opensrf_node(&node)?,
                "routers" => builder.unpack_routers(&node)?,
                "gateway" => builder.unpack_gateway(&node)?,
                "shared" => builder.unpack_shared(&node)?,
                _ => {}
            }
        }

        Ok(builder)
    }

    fn unpack_gateway(&mut self, node: &roxmltree::Node) -> Result<(), String> {
        self.gateway = Some(self.unpack_client_node(node)?);
        Ok(())
    }

    fn unpack_shared(&mut self, node: &roxmltree::Node) -> Result<(), String> {
        if let Some(log_protect) = find_child(node, "log_protect") {
            for ms in log_protect.children().filter(|c| c.has_tag_name("match_string")) {
                if let Some(t) = ms.text() {
                    self.log_protect.push(t.to_string());
                }
            }
        }

        Ok(())
    }

    fn unpack_routers(&mut self, node: &roxmltree::Node) -> Result<(), String> {
        for rnode in node.children().filter(|n| n.has_tag_name("router")) {
            // Router client config lives mostly inside a <transport> element.
            let tnode = find_child(&rnode, "transport")
                .ok_or_else(|| "Routers require a transport config".to_string())?;

            let mut client = self.unpack_client_node(&tnode)?;

            // Logging config for a router sits outside its transport node.
            client.logging = self.unpack_logging_node(&rnode)?;

            self.routers.push(Router { client });
        }

        Ok(())
    }

    fn unpack_opensrf_node(&mut self, node: &roxmltree::Node) -> Result<(), String> {
        let mut client = self.unpack_client_node(node)?;

        if let Some(routers) = find_child(node, "routers") {
            for rnode in routers.children().filter(|r| r.has_tag_name("router")) {
                Self::unpack_client_router_node(&mut client, &rnode)?;
            }
        }

        self.client = Some(client);

        Ok(())
    }

    fn unpack_client_router_node(
        client: &mut BusClient,
        rnode: &roxmltree::Node,
    ) -> Result<(), String> {
        let domain = find_child_text(rnode, "domain")
            .ok_or_else(|| format!("Client router node has no domain: {rnode:?}"))?
            .to_string();

        let services = find_child(rnode, "services").map(|services_node| {
            services_node
                .children()
                .filter(|n| n.has_tag_name("service"))
                .filter_map(|snode| snode.text())
                .map(|s| s.to_string())
                .collect()
        });

        client.routers.push(ClientRouter { domain, services });

        Ok(())
    }

    fn unpack_client_node(&mut self, node: &roxmltree::Node) -> Result<BusClient, String> {
        let logging = self.unpack_logging_node(node)?;
        let domain = self.unpack_domain_node(node)?;

        let mut username = String::new();
        let mut password = String::new();
        let mut settings_config = None;

        for child in node.children() {
            match child.tag_name().name() {
                "username" => {
                    if let Some(t) = child.text() {
                        username = t.to_string();
                    }
                }
                "passwd" | "password" => {
                    if let Some(t) = child.text() {
                        password = t.to_string();
                    }
                }
                "settings_config" => {
                    if let Some(t) = child.text() {
                        settings_config = Some(t.to_string());
                    }
                }
                _ => {}
            }
        }

        Ok(BusClient {
            domain,
            logging,
            settings_config,
            username,
            password,
            routers: Vec::new(),
        })
    }

    fn unpack_domain_node(&mut self, node: &roxmltree::Node) -> Result<BusDomain, String> {
        let domain_name = find_child_text(node, "domain")
            .or_else(|| find_child_text(node, "server"))
            .ok_or_else(|| "Node has no domain or server".to_string())?;

        let port = find_child_text(node, "port")
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_BUS_PORT);

        Ok(BusDomain {
            port,
            name: domain_name.to_string(),
        })
    }

    fn unpack_logging_node(&mut self, node: &roxmltree::Node) -> Result<LogOptions, String> {
        let mut ops = LogOptions::empty();

        for child in node.children() {
            match child.tag_name().name() {
                "logfile" => {
                    if let Some(filename) = child.text() {
                        ops.log_file = Some(if filename == "syslog" {
                            LogFile::Syslog
                        } else {
                            LogFile::Filename(filename.to_string())
                        });
                    }
                }
                "syslog" => {
                    if let Some(f) = child.text() {
                        if let Ok(ff) = syslog::Facility::from_str(f) {
                            ops.syslog_facility = Some(ff);
                        }
                    }
                }
                "actlog" => {
                    if let Some(f) = child.text() {
                        if let Ok(ff) = syslog::Facility::from_str(f) {
                            ops.activity_log_facility = Some(ff);
                        }
                    }
                }
                "loglevel" => {
                    if let Some(level_num) = child.text() {
                        ops.log_level = Some(LogOptions::log_level_from_str(level_num));
                    }
                }
                _ => {}
            }
        }

        Ok(ops)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    hostname: String,
    client: BusClient,
    routers: Vec<Router>,
    gateway: Option<BusClient>,
    log_protect: Vec<String>,
}

impl Config {
    pub fn into_shared(self) -> Arc<Config> {
        Arc::new(self)
    }

    pub fn routers(&self) -> &Vec<Router> {
        &self.routers
    }

    pub fn log_protect(&self) -> &Vec<String> {
        &self.log_protect
    }

    pub fn gateway(&self) -> Option<&BusClient> {
        self.gateway.as_ref()
    }

    pub fn client(&self) -> &BusClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut BusClient {
        &mut self.client
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn get_router_conf(&self, domain: &str) -> Option<&Router> {
        self.routers.iter().find(|r| r.client().domain().name() == domain)
    }

    /// Manually overrides the OS hostname, e.g. with "localhost".
    pub fn set_hostname(&mut self, hostname: &str) {
        self.hostname = hostname.to_string();
    }

    fn get_os_hostname() -> Result<String, String> {
        gethostname()
            .into_string()
            .map_err(|e| format!("Cannot read OS host name: {e:?}"))
    }
}
