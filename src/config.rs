use std::{
    collections::HashMap,
    env,
    fs::read_to_string,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use codec::{ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId};
use service::{
    discovery::{ClientTimings, ServerTimings},
    policy::{IdRange, Policy, PolicyMode, PolicySet, Rule},
};

/// Environment variable naming the configuration file, checked when no
/// `--config` argument is given.
pub const CONFIGURATION_ENV: &str = "VSOMEIP_CONFIGURATION";

/// Environment variable selecting the application block when an
/// application passes no name programmatically.
pub const APPLICATION_NAME_ENV: &str = "VSOMEIP_APPLICATION_NAME";

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceDiscovery {
    #[serde(default = "ServiceDiscovery::enable")]
    pub enable: bool,
    ///
    /// Discovery multicast group and port.
    ///
    #[serde(default = "ServiceDiscovery::multicast")]
    pub multicast: Ipv4Addr,
    #[serde(default = "ServiceDiscovery::port")]
    pub port: u16,
    ///
    /// Offer phase timing, per SOME/IP-SD: a uniformly random initial
    /// wait, doubling repetition delays, then a cyclic announcement.
    ///
    #[serde(default = "ServiceDiscovery::initial_delay_min")]
    pub initial_delay_min: u64,
    #[serde(default = "ServiceDiscovery::initial_delay_max")]
    pub initial_delay_max: u64,
    #[serde(default = "ServiceDiscovery::repetitions_base_delay")]
    pub repetitions_base_delay: u64,
    #[serde(default = "ServiceDiscovery::repetitions_max")]
    pub repetitions_max: u8,
    #[serde(default = "ServiceDiscovery::cyclic_offer_delay")]
    pub cyclic_offer_delay: u64,
    ///
    /// TTL announced in offer and subscribe entries, seconds;
    /// 0xFFFFFF holds until the next reboot.
    ///
    #[serde(default = "ServiceDiscovery::ttl")]
    pub ttl: u32,
    ///
    /// Answer timeout for subscriptions and unicast replies.
    ///
    #[serde(default = "ServiceDiscovery::request_response_delay")]
    pub request_response_delay: u64,
}

impl ServiceDiscovery {
    fn enable() -> bool {
        true
    }

    fn multicast() -> Ipv4Addr {
        Ipv4Addr::new(224, 0, 0, 0)
    }

    fn port() -> u16 {
        30490
    }

    fn initial_delay_min() -> u64 {
        0
    }

    fn initial_delay_max() -> u64 {
        3000
    }

    fn repetitions_base_delay() -> u64 {
        10
    }

    fn repetitions_max() -> u8 {
        3
    }

    fn cyclic_offer_delay() -> u64 {
        1000
    }

    fn ttl() -> u32 {
        codec::TTL_INFINITE
    }

    fn request_response_delay() -> u64 {
        2000
    }

    pub fn server_timings(&self) -> ServerTimings {
        ServerTimings {
            initial_delay_min: Duration::from_millis(self.initial_delay_min),
            initial_delay_max: Duration::from_millis(self.initial_delay_max),
            repetitions_base_delay: Duration::from_millis(self.repetitions_base_delay),
            repetitions_max: self.repetitions_max,
            cyclic_offer_delay: Duration::from_millis(self.cyclic_offer_delay),
            ttl: self.ttl,
        }
    }

    pub fn client_timings(&self) -> ClientTimings {
        ClientTimings {
            initial_delay_min: Duration::from_millis(self.initial_delay_min),
            initial_delay_max: Duration::from_millis(self.initial_delay_max),
            repetitions_base_delay: Duration::from_millis(self.repetitions_base_delay),
            repetitions_max: self.repetitions_max,
            subscription_ttl: self.ttl,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.multicast), self.port)
    }
}

impl Default for ServiceDiscovery {
    fn default() -> Self {
        serde_json5::from_str("{}").unwrap()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Reliable {
    pub port: u16,
    ///
    /// Prefix every flushed packet with a magic cookie and resynchronize
    /// on them after a framing error.
    ///
    #[serde(default)]
    pub enable_magic_cookies: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Multicast {
    pub address: Ipv4Addr,
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Debounce {
    #[serde(default)]
    pub on_change: bool,
    ///
    /// Byte index to ignore bit mask; `{ "2": 0x0F }` masks the low
    /// nibble of payload byte 2 out of the comparison.
    ///
    #[serde(default)]
    pub ignore: HashMap<usize, u8>,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub on_change_resets_interval: bool,
}

impl Debounce {
    pub fn filter(&self) -> service::events::DebounceFilter {
        let mut ignore = self.ignore.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
        ignore.sort();

        service::events::DebounceFilter {
            on_change: self.on_change,
            ignore,
            interval: self.interval.map(Duration::from_millis),
            on_change_resets_interval: self.on_change_resets_interval,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Event {
    pub event: EventId,
    #[serde(default)]
    pub eventgroups: Vec<EventgroupId>,
    #[serde(default)]
    pub debounce: Option<Debounce>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceEntry {
    pub service: ServiceId,
    pub instance: InstanceId,
    #[serde(default)]
    pub major: MajorVersion,
    #[serde(default)]
    pub minor: MinorVersion,
    ///
    /// UDP port the service is reachable on, when offered here.
    ///
    #[serde(default)]
    pub unreliable: Option<u16>,
    #[serde(default)]
    pub reliable: Option<Reliable>,
    ///
    /// Multicast group this service publishes its notifications to.
    ///
    #[serde(default)]
    pub multicast: Option<Multicast>,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Application {
    pub name: String,
    pub id: ClientId,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyCredentials {
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyRule {
    pub service: ServiceId,
    #[serde(default)]
    pub instances: Option<Vec<IdRange>>,
    #[serde(default)]
    pub methods: Option<Vec<IdRange>>,
}

impl PolicyRule {
    fn rule(&self) -> Rule {
        Rule {
            service: self.service,
            instances: self.instances.clone().unwrap_or_else(|| vec![IdRange::any()]),
            methods: self.methods.clone().unwrap_or_else(|| vec![IdRange::any()]),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyEntry {
    pub credentials: PolicyCredentials,
    #[serde(default)]
    pub requests: Vec<PolicyRule>,
    #[serde(default)]
    pub offers: Vec<PolicyRule>,
    #[serde(default)]
    pub eventgroups: Vec<PolicyRule>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Security {
    #[serde(default = "Security::mode")]
    pub mode: PolicyMode,
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            mode: Self::mode(),
            policies: Vec::new(),
        }
    }
}

impl Security {
    fn mode() -> PolicyMode {
        PolicyMode::Off
    }

    pub fn policy_set(&self) -> PolicySet {
        PolicySet {
            policies: self
                .policies
                .iter()
                .map(|entry| Policy {
                    uid: entry.credentials.uid,
                    gid: entry.credentials.gid,
                    requests: entry.requests.iter().map(PolicyRule::rule).collect(),
                    offers: entry.offers.iter().map(PolicyRule::rule).collect(),
                    eventgroups: entry.eventgroups.iter().map(PolicyRule::rule).collect(),
                })
                .collect(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Tcp {
    ///
    /// Maximum accepted message size, 0 meaning unlimited.
    ///
    #[serde(default)]
    pub max_message_size: usize,
    ///
    /// Delay before a partially filled outbound packet is flushed.
    ///
    #[serde(default = "Tcp::flush_delay")]
    pub flush_delay: u64,
}

impl Tcp {
    fn flush_delay() -> u64 {
        5
    }
}

impl Default for Tcp {
    fn default() -> Self {
        Self {
            max_message_size: 0,
            flush_delay: Self::flush_delay(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Watchdog {
    #[serde(default = "Watchdog::interval")]
    pub interval: u64,
    #[serde(default = "Watchdog::timeout")]
    pub timeout: u64,
}

impl Watchdog {
    fn interval() -> u64 {
        2000
    }

    fn timeout() -> u64 {
        5000
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self {
            interval: Self::interval(),
            timeout: Self::timeout(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    ///
    /// Unicast address of this host; every offered endpoint and the
    /// discovery socket bind here.
    ///
    #[serde(default = "Config::unicast")]
    pub unicast: IpAddr,
    #[serde(default)]
    pub netmask: Option<IpAddr>,
    ///
    /// Name of the routing host instance. The local IPC socket is
    /// derived from it, so guests and host must agree on it.
    ///
    #[serde(default = "Config::routing")]
    pub routing: String,
    ///
    /// Relay messages between remote peers. Off by default; the host
    /// then only routes for its own guests.
    ///
    #[serde(default)]
    pub forwarding: bool,
    #[serde(default)]
    pub service_discovery: ServiceDiscovery,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub tcp: Tcp,
    #[serde(default)]
    pub watchdog: Watchdog,
    ///
    /// How long a relayed request may wait for its response, ms.
    ///
    #[serde(default = "Config::request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn unicast() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn routing() -> String {
        "routingmanagerd".to_string()
    }

    fn request_timeout() -> u64 {
        5000
    }

    /// Path of the local IPC socket of this routing host.
    pub fn local_socket_path(&self) -> String {
        format!("/tmp/vsomeip-{}-0", self.routing)
    }

    pub fn find_service(&self, service: ServiceId, instance: InstanceId) -> Option<&ServiceEntry> {
        self.services
            .iter()
            .find(|entry| entry.service == service && entry.instance == instance)
    }

    /// Resolve the instance a frame received on `port` belongs to.
    pub fn instance_on_port(&self, service: ServiceId, port: u16, reliable: bool) -> Option<InstanceId> {
        self.services
            .iter()
            .find(|entry| {
                entry.service == service
                    && if reliable {
                        entry.reliable.as_ref().is_some_and(|it| it.port == port)
                    } else {
                        entry.unreliable == Some(port)
                    }
            })
            .map(|entry| entry.instance)
    }

    /// The eventgroups a local notification belongs to.
    pub fn eventgroups_of(&self, service: ServiceId, instance: InstanceId, event: EventId) -> Vec<EventgroupId> {
        self.find_service(service, instance)
            .and_then(|entry| entry.events.iter().find(|it| it.event == event))
            .map(|it| it.eventgroups.clone())
            .unwrap_or_default()
    }

    pub fn client_hints(&self) -> ahash::AHashMap<String, ClientId> {
        self.applications
            .iter()
            .map(|application| (application.name.clone(), application.id))
            .collect()
    }

    ///
    /// Load configure from config file and command line parameters.
    ///
    /// The path comes from `--config` when given, otherwise from the
    /// `VSOMEIP_CONFIGURATION` environment variable.
    ///
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        let path = match cli.config {
            Some(path) => path,
            None => env::var(CONFIGURATION_ENV)
                .with_context(|| format!("no --config and no {CONFIGURATION_ENV} set"))?,
        };

        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let content = read_to_string(path).with_context(|| format!("reading {path}"))?;
        serde_json5::from_str(&content).with_context(|| format!("parsing {path}"))
    }
}

impl Default for Config {
    fn default() -> Self {
        serde_json5::from_str("{}").unwrap()
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: someip-router --config /etc/someip/router.json
    ///
    #[arg(long, short)]
    config: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_falls_back_to_defaults() {
        let config: Config = serde_json5::from_str("{}").unwrap();

        assert_eq!(config.unicast, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(config.service_discovery.enable);
        assert_eq!(config.service_discovery.port, 30490);
        assert_eq!(config.local_socket_path(), "/tmp/vsomeip-routingmanagerd-0");
        assert!(!config.forwarding);
    }

    #[test]
    fn services_and_policies_parse() {
        let config: Config = serde_json5::from_str(
            r#"{
                unicast: "192.168.1.5",
                routing: "router",
                "service-discovery": { "cyclic-offer-delay": 2000 },
                services: [{
                    service: 0x1234,
                    instance: 0x0001,
                    major: 1,
                    unreliable: 30509,
                    reliable: { port: 30510, "enable-magic-cookies": true },
                    multicast: { address: "239.1.2.3", port: 31000 },
                    events: [{
                        event: 0x8005,
                        eventgroups: [0x0005],
                        debounce: { "on-change": true, interval: 50 },
                    }],
                }],
                applications: [{ name: "radar", id: 0x0101 }],
                security: {
                    mode: "enforced",
                    policies: [{
                        credentials: { uid: 1000 },
                        requests: [{ service: 0x1234 }],
                    }],
                },
            }"#,
        )
        .unwrap();

        assert_eq!(config.service_discovery.cyclic_offer_delay, 2000);
        assert_eq!(config.instance_on_port(0x1234, 30509, false), Some(0x0001));
        assert_eq!(config.instance_on_port(0x1234, 30510, true), Some(0x0001));
        assert_eq!(config.instance_on_port(0x1234, 30511, true), None);
        assert_eq!(config.eventgroups_of(0x1234, 0x0001, 0x8005), vec![0x0005]);
        assert_eq!(config.client_hints().get("radar"), Some(&0x0101));
        assert_eq!(config.security.policy_set().policies.len(), 1);

        let entry = config.find_service(0x1234, 0x0001).unwrap();
        assert!(entry.reliable.as_ref().unwrap().enable_magic_cookies);
        assert!(entry.events[0].debounce.as_ref().unwrap().on_change);
    }
}
