use chrono::{DateTime, Local};
use ferrosrf::bus;
use ferrosrf::conf;
use getopts;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DEFAULT_WAIT_TIME_MILLIS: u64 = 5000;

// Redis lists are deleted every time the last value in the list is
// popped. If a list key persists for many minutes, the backend
// responsible for draining it is either down or perpetually
// overloaded. Tell stale keys to expire themselves after this many
// seconds of being unable to drain.
const DEFAULT_KEY_EXPIRE_SECS: u64 = 1800; // 30 minutes

struct BusWatch {
    domain: String,
    bus: bus::Bus,
    wait_time: u64,
    ttl: u64,
    _start_time: DateTime<Local>,
}

impl BusWatch {
    pub fn new(config: Arc<conf::Config>, domain: &str) -> Self {
        let mut busconf = config
            .get_router_conf(domain)
            .unwrap_or_else(|| panic!("No router config for domain {domain}"))
            .client()
            .clone();

        // Connect using the router's domain/port, but log in with our
        // own credentials, which are subject to command-line overrides.
        busconf.set_username(config.client().username());
        busconf.set_password(config.client().password());

        let bus = bus::Bus::new(&busconf).unwrap_or_else(|e| panic!("Cannot connect bus: {e}"));

        BusWatch {
            bus,
            domain: domain.to_string(),
            wait_time: DEFAULT_WAIT_TIME_MILLIS,
            ttl: DEFAULT_KEY_EXPIRE_SECS,
            _start_time: Local::now(),
        }
    }

    /// Examines one bus key: records its queue depth and refreshes the
    /// TTL of any key that looks abandoned (no expiry set at all).
    /// Returns `Err` only on a bus error serious enough to warrant a
    /// full watcher restart.
    fn inspect_key(&mut self, key: &str, stats: &mut json::JsonValue) -> Result<(), String> {
        let len = self
            .bus
            .llen(key)
            .map_err(|e| format!("Error reading LLEN list={key} error={e}"))?;

        if len > 0 {
            stats[key]["count"] = json::from(len);
        }

        let ttl = match self.bus.ttl(key) {
            Ok(ttl) => ttl,
            Err(e) => {
                log::error!("Error with ttl: {e}");
                return Ok(());
            }
        };

        stats[key]["ttl"] = json::from(ttl);

        if ttl == -1 {
            log::debug!("Setting TTL for stale key {key}");
            self.bus
                .set_key_timeout(key, self.ttl)
                .map_err(|e| format!("Error with set_key_timeout: {e}"))?;
        }

        Ok(())
    }

    /// Builds one `{domain, stats, time}` report by walking every
    /// `opensrf:*` key currently on the bus.
    fn collect_report(&mut self) -> Result<json::JsonValue, String> {
        let mut report = json::object! {
            "domain": json::from(self.domain.as_str()),
        };

        let keys = self
            .bus
            .keys("opensrf:*")
            .map_err(|e| format!("Error in keys() command: {e}"))?;

        if !keys.is_empty() {
            let mut stats = json::JsonValue::new_object();
            for key in &keys {
                self.inspect_key(key, &mut stats)?;
            }
            report["stats"] = stats;
        }

        report["time"] = json::from(Local::now().format("%FT%T%z").to_string());

        Ok(report)
    }

    /// Returns true if the caller should start a new watcher to recover
    /// from a potentially transient bus error; false on clean shutdown.
    pub fn watch(&mut self) -> bool {
        loop {
            thread::sleep(Duration::from_millis(self.wait_time));

            match self.collect_report() {
                Ok(report) => println!("{}", report.dump()),
                Err(e) => {
                    log::error!("{e}");
                    return true;
                }
            }
        }
    }
}

struct Cli {
    domains: Vec<String>,
    ttl: Option<u64>,
}

/// Pulls the watcher's own `-d/--domain` and `--ttl` flags out of
/// already-parsed getopts output, falling back to every router-trusted
/// domain in `config` when no `-d` was given.
fn read_cli(config: &conf::Config, params: &getopts::Matches) -> Cli {
    let mut domains = params.opt_strs("domain");

    if domains.is_empty() {
        domains = config
            .routers()
            .iter()
            .map(|r| r.client().domain().name().to_string())
            .collect();

        if domains.is_empty() {
            panic!("Watcher requires at least one domain");
        }
    }

    let ttl = params.opt_str("ttl").map(|t| {
        t.parse::<u64>()
            .unwrap_or_else(|e| panic!("Invalid --ttl value: {e}"))
    });

    Cli { domains, ttl }
}

fn main() {
    let mut ops = getopts::Options::new();
    ops.optmulti("d", "domain", "Domain", "DOMAIN");
    ops.optopt("", "ttl", "Time to Live", "TTL");

    let (config, params) = ferrosrf::init::init_with_options(&mut ops).unwrap();
    let config = config.into_shared();
    let cli = read_cli(&config, &params);

    println!("Starting buswatch for domains: {:?}", cli.domains);

    let threads: Vec<thread::JoinHandle<()>> = cli
        .domains
        .iter()
        .map(|domain| {
            let conf = config.clone();
            let domain = domain.clone();
            let ttl = cli.ttl;

            thread::spawn(move || loop {
                let mut watcher = BusWatch::new(conf.clone(), &domain);
                if let Some(t) = ttl {
                    watcher.ttl = t;
                }
                if watcher.watch() {
                    log::error!("Restarting watcher after exit-on-error");
                } else {
                    break;
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().ok();
    }
}
