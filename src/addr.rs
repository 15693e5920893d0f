use super::util;
use gethostname::gethostname;
use std::fmt;
use std::process;

const BUS_ADDR_NAMESPACE: &str = "opensrf";

/// What a bus address refers to: an ephemeral per-connection client, a
/// service's shared listening address, or a router.
///
/// A service address additionally carries the service name, since the
/// address grammar folds it into the same slot other purposes leave
/// blank (`_`).
#[derive(Debug, Clone, PartialEq, Eq)]
enum Purpose {
    Client,
    Service(String),
    Router,
}

/// A parsed bus-level address.
///
/// Every address on the bus follows one of three shapes:
///
/// ```text
/// opensrf:router:$username:$domain
/// opensrf:service:_:_:$service
/// opensrf:client:$username:$domain:$hostname:$pid:$random
/// ```
#[derive(Debug, Clone)]
pub struct BusAddress {
    full: String,
    domain: String,
    username: String,
    purpose: Purpose,
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Address={}", &self.full)
    }
}

impl BusAddress {
    /// Builds a `opensrf:{purpose}:{username}:{domain}[:{suffix}]` string
    /// and parses it back, so every constructor below funnels through the
    /// same validation path instead of hand-assembling + unwrapping.
    fn compose(purpose: &str, username: &str, domain: &str, suffix: Option<&str>) -> BusAddress {
        let full = match suffix {
            Some(s) => format!("{BUS_ADDR_NAMESPACE}:{purpose}:{username}:{domain}:{s}"),
            None => format!("{BUS_ADDR_NAMESPACE}:{purpose}:{username}:{domain}"),
        };

        BusAddress::parse(&full).expect("a freshly composed address string is always well-formed")
    }

    /// Parses a bus address string into its components.
    ///
    /// ```
    /// let addr =
    ///   ferrosrf::addr::BusAddress::parse("opensrf:client:foobar:localhost:12345")
    ///   .expect("Error creating address from string");
    ///
    /// assert!(addr.is_client());
    /// assert_eq!(addr.domain(), "localhost");
    /// ```
    pub fn parse(full: &str) -> Result<Self, String> {
        let malformed = || format!("Malformed bus address: {full}");

        let mut parts = full.split(':');

        parts.next().ok_or_else(malformed)?; // namespace, unchecked
        let purpose_str = parts.next().ok_or_else(malformed)?;
        let username = parts.next().ok_or_else(malformed)?.to_string();
        let domain = parts.next().ok_or_else(malformed)?.to_string();

        let purpose = match purpose_str {
            "client" => Purpose::Client,
            "router" => Purpose::Router,
            "service" => {
                let service = parts.next().ok_or_else(malformed)?;
                Purpose::Service(service.to_string())
            }
            _ => return Err(malformed()),
        };

        Ok(BusAddress {
            full: full.to_string(),
            domain,
            username,
            purpose,
        })
    }

    /// Full address string
    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_domain(&mut self, s: &str) {
        self.domain = s.to_string();
    }

    pub fn set_username(&mut self, s: &str) {
        self.username = s.to_string();
    }

    /// Service name, present only on service addresses.
    pub fn service(&self) -> Option<&str> {
        match &self.purpose {
            Purpose::Service(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_client(&self) -> bool {
        self.purpose == Purpose::Client
    }

    pub fn is_service(&self) -> bool {
        matches!(self.purpose, Purpose::Service(_))
    }

    pub fn is_router(&self) -> bool {
        self.purpose == Purpose::Router
    }
}

/// An ephemeral address identifying a single connection to the bus.
///
/// A client address is unique for the lifetime of the connection it
/// names; once the connection drops, the address is never reused.
#[derive(Debug, Clone)]
pub struct ClientAddress {
    addr: BusAddress,
}

impl ClientAddress {
    pub fn from_addr(addr: BusAddress) -> Result<Self, String> {
        if addr.is_client() {
            Ok(ClientAddress { addr })
        } else {
            Err(format!("Cannot create a ClientAddress from a non-client address"))
        }
    }

    pub fn from_string(full: &str) -> Result<Self, String> {
        ClientAddress::from_addr(BusAddress::parse(full)?)
    }

    pub fn as_str(&self) -> &str {
        self.addr.as_str()
    }

    pub fn domain(&self) -> &str {
        self.addr.domain()
    }

    /// Creates a new, globally-unique client address for a domain.
    ///
    /// ```
    /// let username = "opensrf";
    /// let domain = "private.localhost";
    /// let addr = ferrosrf::addr::ClientAddress::new(username, domain);
    /// assert_eq!(addr.domain(), domain);
    /// assert!(addr.addr().is_client());
    /// ```
    pub fn new(username: &str, domain: &str) -> Self {
        let uniq = format!(
            "{}:{}:{}",
            gethostname().into_string().unwrap(),
            process::id(),
            util::random_number(6),
        );

        ClientAddress {
            addr: BusAddress::compose("client", username, domain, Some(&uniq)),
        }
    }

    /// Overwrites everything after the domain with caller-supplied content.
    ///
    /// ```
    /// let username = "opensrf";
    /// let domain = "private.localhost";
    /// let mut addr = ferrosrf::addr::ClientAddress::new(username, domain);
    /// assert_eq!(addr.domain(), domain);
    ///
    /// let remainder = "HELLO123";
    /// addr.set_remainder(remainder);
    /// assert!(addr.addr().is_client());
    /// assert!(addr.as_str().ends_with(remainder));
    /// ```
    pub fn set_remainder(&mut self, remainder: &str) {
        self.addr = BusAddress::compose(
            "client",
            self.addr().username(),
            self.addr().domain(),
            Some(remainder),
        );
    }

    pub fn addr(&self) -> &BusAddress {
        &self.addr
    }
}

impl fmt::Display for ClientAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ClientAddress={}", self.as_str())
    }
}

/// The shared, domain-agnostic address a service's drones all listen on.
#[derive(Debug, Clone)]
pub struct ServiceAddress {
    addr: BusAddress,
}

impl ServiceAddress {
    pub fn from_addr(addr: BusAddress) -> Result<Self, String> {
        if addr.is_service() {
            Ok(ServiceAddress { addr })
        } else {
            Err(format!("Cannot create a ServiceAddress from a non-service address"))
        }
    }

    pub fn from_string(full: &str) -> Result<Self, String> {
        ServiceAddress::from_addr(BusAddress::parse(full)?)
    }

    pub fn as_str(&self) -> &str {
        self.addr.as_str()
    }

    /// Creates a user/domain-agnostic service address.
    ///
    /// ```
    /// let service = "opensrf.settings";
    /// let addr = ferrosrf::addr::ServiceAddress::new(service);
    /// assert_eq!(addr.service(), service);
    /// assert!(addr.addr().is_service());
    /// ```
    pub fn new(service: &str) -> Self {
        ServiceAddress {
            addr: BusAddress::compose("service", "_", "_", Some(service)),
        }
    }

    pub fn addr(&self) -> &BusAddress {
        &self.addr
    }

    pub fn addr_mut(&mut self) -> &mut BusAddress {
        &mut self.addr
    }

    pub fn service(&self) -> &str {
        self.addr()
            .service()
            .expect("a ServiceAddress always wraps a service-purpose BusAddress")
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServiceAddress={}", self.as_str())
    }
}

/// The address of a router process on one domain.
#[derive(Debug, Clone)]
pub struct RouterAddress {
    addr: BusAddress,
}

impl RouterAddress {
    pub fn from_addr(addr: BusAddress) -> Result<Self, String> {
        if addr.is_router() {
            Ok(RouterAddress { addr })
        } else {
            Err(format!("Cannot create a RouterAddress from a non-router address"))
        }
    }

    /// ```
    /// let addr_res = ferrosrf::addr::RouterAddress::from_string("foo:bar");
    /// assert!(addr_res.is_err());
    ///
    /// let addr_res = ferrosrf::addr::RouterAddress::from_string("opensrf:router:router:localhost");
    /// assert!(addr_res.is_ok());
    /// assert!(addr_res.unwrap().domain().eq("localhost"));
    /// ```
    pub fn from_string(full: &str) -> Result<Self, String> {
        RouterAddress::from_addr(BusAddress::parse(full)?)
    }

    pub fn as_str(&self) -> &str {
        self.addr.as_str()
    }

    pub fn domain(&self) -> &str {
        self.addr().domain()
    }

    /// ```
    /// let addr = ferrosrf::addr::RouterAddress::new("router", "localhost");
    /// assert_eq!(addr.as_str(), "opensrf:router:router:localhost");
    /// ```
    pub fn new(username: &str, domain: &str) -> Self {
        RouterAddress {
            addr: BusAddress::compose("router", username, domain, None),
        }
    }

    pub fn addr(&self) -> &BusAddress {
        &self.addr
    }
}

impl fmt::Display for RouterAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RouterAddress={}", self.as_str())
    }
}
