//! Common startup sequence shared by every binary: parse the standard
//! `--osrf-*` command-line flags, load the XML config they point at,
//! and (optionally) bring up logging. Does not touch the bus.

use super::conf;
use super::logging;
use getopts;
use std::env;

const DEFAULT_OSRF_CONFIG: &str = "/openils/conf/opensrf_core.xml";

pub struct InitOptions {
    pub skip_logging: bool,
}

impl InitOptions {
    pub fn new() -> InitOptions {
        InitOptions {
            skip_logging: false,
        }
    }
}

/// Registers the standard `osrf-*` flags on `opts`, all prefixed to
/// avoid colliding with option names a caller may want for itself.
fn register_osrf_flags(opts: &mut getopts::Options) {
    opts.optflag("l", "osrf-localhost", "Use Localhost");
    opts.optopt("", "osrf-hostname", "hostname", "hostname");
    opts.optopt("", "osrf-config", "OpenSRF Config", "OSRF_CONFIG");
    opts.optopt("", "osrf-log-level", "Log Level Number (0-5)", "LOG_LEVEL");
    opts.optopt("", "osrf-bus-username", "Bus Login Username", "BUS_USERNAME");
    opts.optopt("", "osrf-bus-password", "Bus Login Password", "BUS_PASSWORD");
}

/// Applies any `osrf-*` overrides found in `params` onto an
/// already-loaded `config`.
fn apply_osrf_overrides(config: &mut conf::Config, params: &getopts::Matches) {
    if params.opt_present("osrf-localhost") {
        config.set_hostname("localhost");
    } else if let Some(hostname) = params.opt_str("osrf-hostname") {
        config.set_hostname(&hostname);
    }

    if let Some(level) = params.opt_str("osrf-log-level") {
        config.client_mut().logging_mut().set_log_level(&level);
    }

    if let Some(username) = params.opt_str("osrf-bus-username") {
        config.client_mut().set_username(&username);
    }

    if let Some(password) = params.opt_str("osrf-bus-password") {
        config.client_mut().set_password(&password);
    }
}

/// Parses the standard command-line options, loads the core config, and
/// starts logging. Does not connect to the bus.
pub fn init() -> Result<conf::Config, String> {
    let (config, _) = init_with_options(&mut getopts::Options::new())?;
    Ok(config)
}

/// Same as [`init`], but lets the caller pass a pre-populated
/// `getopts::Options`, which is then augmented with the standard OpenSRF
/// flags.
pub fn init_with_options(
    opts: &mut getopts::Options,
) -> Result<(conf::Config, getopts::Matches), String> {
    init_with_more_options(opts, &InitOptions::new())
}

pub fn init_with_more_options(
    opts: &mut getopts::Options,
    options: &InitOptions,
) -> Result<(conf::Config, getopts::Matches), String> {
    register_osrf_flags(opts);

    let args: Vec<String> = env::args().collect();

    let params = opts
        .parse(&args[1..])
        .map_err(|e| format!("Error parsing options: {e}"))?;

    let filename = params
        .opt_get_default("osrf-config", DEFAULT_OSRF_CONFIG.to_string())
        .map_err(|e| format!("Error reading osrf-config option: {e}"))?;

    let mut config = conf::ConfigBuilder::from_file(&filename)?.build()?;

    apply_osrf_overrides(&mut config, &params);

    if !options.skip_logging {
        logging::Logger::new(config.client().logging())?
            .init()
            .map_err(|e| format!("Error initializing logger: {e}"))?;
    }

    Ok((config, params))
}
