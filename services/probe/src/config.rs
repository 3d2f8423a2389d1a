use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use transit_client::{KafkaConfig, NatsConfig, StartPosition};
use transit_wire::TimeUnit;

// Probe configuration: defaults, then TRANSIT_* environment variables, then
// the YAML file named by TRANSIT_PROBE_CONFIG, then command-line flags.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    pub transport: TransportKind,
    // Broker addresses; NATS tries them in order, Kafka bootstraps from all.
    pub brokers: Vec<String>,
    pub topic: String,
    // Partition to publish to and read from (Kafka and in-process).
    pub partition: u32,
    // Where the consumer starts reading.
    pub offset: StartPosition,
    pub tick_period_us: u64,
    // Cumulative arrival spacing that closes a statistics window.
    pub stat_period_ms: u64,
    pub time_unit: TimeUnit,
    // Prometheus /metrics listener; disabled when unset.
    pub metrics_bind: Option<SocketAddr>,
    pub connect_timeout_ms: u64,
    pub flush_timeout_ms: u64,
    pub client_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Nats,
    Kafka,
    #[value(name = "inprocess")]
    #[serde(rename = "inprocess")]
    InProcess,
}

impl TransportKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(TransportKind::Nats),
            "kafka" => Ok(TransportKind::Kafka),
            "inprocess" | "in-process" => Ok(TransportKind::InProcess),
            other => bail!("unknown transport {other:?} (expected nats, kafka or inprocess)"),
        }
    }
}

const DEFAULT_BROKER: &str = "nats://127.0.0.1:4222";
const DEFAULT_KAFKA_BROKER: &str = "127.0.0.1:9092";
// Partitions are numbered below this bound.
pub const MAX_PARTITIONS: u32 = 1024;
const DEFAULT_TOPIC: &str = "topic007";
const DEFAULT_TICK_PERIOD_US: u64 = 500_000;
const DEFAULT_STAT_PERIOD_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 5_000;

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            brokers: vec![DEFAULT_BROKER.to_string()],
            topic: DEFAULT_TOPIC.to_string(),
            partition: 0,
            offset: StartPosition::Newest,
            tick_period_us: DEFAULT_TICK_PERIOD_US,
            stat_period_ms: DEFAULT_STAT_PERIOD_MS,
            time_unit: TimeUnit::default(),
            metrics_bind: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            client_name: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProbeConfigOverride {
    transport: Option<TransportKind>,
    brokers: Option<Brokers>,
    topic: Option<String>,
    partition: Option<u32>,
    offset: Option<String>,
    tick_period_us: Option<u64>,
    stat_period_ms: Option<u64>,
    time_unit: Option<TimeUnit>,
    metrics_bind: Option<String>,
    connect_timeout_ms: Option<u64>,
    flush_timeout_ms: Option<u64>,
    client_name: Option<String>,
}

// YAML accepts either a list or a comma-separated string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Brokers {
    List(Vec<String>),
    Csv(String),
}

impl Brokers {
    fn into_vec(self) -> Vec<String> {
        match self {
            Brokers::List(list) => list,
            Brokers::Csv(csv) => split_brokers(&csv),
        }
    }
}

/// Command-line overrides shared by the probe binaries.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ProbeArgs {
    /// Broker transport
    #[arg(long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Broker addresses, comma separated
    #[arg(long, value_delimiter = ',')]
    pub brokers: Option<Vec<String>>,

    /// Topic (a subject on NATS) carrying the probes
    #[arg(long)]
    pub topic: Option<String>,

    /// Partition to use (Kafka and in-process transports)
    #[arg(long)]
    pub partition: Option<u32>,

    /// Consumer start: oldest, newest or an explicit offset
    #[arg(long)]
    pub offset: Option<StartPosition>,

    /// Emission period in microseconds
    #[arg(long)]
    pub tick_period_us: Option<u64>,

    /// Statistics window period in milliseconds
    #[arg(long)]
    pub stat_period_ms: Option<u64>,

    /// Timestamp unit carried by probes: us or ns
    #[arg(long)]
    pub time_unit: Option<TimeUnit>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_bind: Option<SocketAddr>,

    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    #[arg(long)]
    pub flush_timeout_ms: Option<u64>,

    /// Name reported to the broker
    #[arg(long)]
    pub client_name: Option<String>,
}

impl ProbeConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let transport = match std::env::var("TRANSIT_TRANSPORT") {
            Ok(value) => TransportKind::parse(&value).context("parse TRANSIT_TRANSPORT")?,
            Err(_) => defaults.transport,
        };
        let brokers = std::env::var("TRANSIT_BROKERS")
            .ok()
            .map(|value| split_brokers(&value))
            .filter(|brokers| !brokers.is_empty())
            .unwrap_or(defaults.brokers);
        let topic = std::env::var("TRANSIT_TOPIC").unwrap_or(defaults.topic);
        let partition = read_env_number("TRANSIT_PARTITION")?.unwrap_or(defaults.partition);
        let offset = match std::env::var("TRANSIT_OFFSET") {
            Ok(value) => value.parse().context("parse TRANSIT_OFFSET")?,
            Err(_) => defaults.offset,
        };
        let tick_period_us =
            read_env_number("TRANSIT_TICK_PERIOD_US")?.unwrap_or(defaults.tick_period_us);
        let stat_period_ms =
            read_env_number("TRANSIT_STAT_PERIOD_MS")?.unwrap_or(defaults.stat_period_ms);
        let time_unit = match std::env::var("TRANSIT_TIME_UNIT") {
            Ok(value) => value.parse().context("parse TRANSIT_TIME_UNIT")?,
            Err(_) => defaults.time_unit,
        };
        let metrics_bind = std::env::var("TRANSIT_METRICS_BIND")
            .ok()
            .map(|value| value.parse())
            .transpose()
            .context("parse TRANSIT_METRICS_BIND")?;
        let connect_timeout_ms = read_env_number("TRANSIT_CONNECT_TIMEOUT_MS")?
            .filter(|value| *value > 0)
            .unwrap_or(defaults.connect_timeout_ms);
        let flush_timeout_ms = read_env_number("TRANSIT_FLUSH_TIMEOUT_MS")?
            .filter(|value| *value > 0)
            .unwrap_or(defaults.flush_timeout_ms);
        let client_name = std::env::var("TRANSIT_CLIENT_NAME").ok();
        Ok(Self {
            transport,
            brokers,
            topic,
            partition,
            offset,
            tick_period_us,
            stat_period_ms,
            time_unit,
            metrics_bind,
            connect_timeout_ms,
            flush_timeout_ms,
            client_name,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("TRANSIT_PROBE_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read TRANSIT_PROBE_CONFIG: {path}"))?;
            let override_cfg: ProbeConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse probe config yaml")?;
            config.apply_yaml(override_cfg)?;
        }
        Ok(config)
    }

    /// Resolves every layer and validates the result.
    ///
    /// `client_name` falls back to the binary's name.
    pub fn resolve(args: &ProbeArgs, binary: &str) -> Result<Self> {
        let mut config = Self::from_env_or_yaml()?;
        config.apply_args(args);
        // The built-in broker address is a NATS URL.
        if config.transport == TransportKind::Kafka && config.brokers == [DEFAULT_BROKER] {
            config.brokers = vec![DEFAULT_KAFKA_BROKER.to_string()];
        }
        if config.client_name.is_none() {
            config.client_name = Some(binary.to_string());
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_yaml(&mut self, override_cfg: ProbeConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.transport {
            self.transport = value;
        }
        if let Some(value) = override_cfg.brokers {
            self.brokers = value.into_vec();
        }
        if let Some(value) = override_cfg.topic {
            self.topic = value;
        }
        if let Some(value) = override_cfg.partition {
            self.partition = value;
        }
        if let Some(value) = override_cfg.offset {
            self.offset = value.parse().with_context(|| "parse offset")?;
        }
        if let Some(value) = override_cfg.tick_period_us {
            self.tick_period_us = value;
        }
        if let Some(value) = override_cfg.stat_period_ms {
            self.stat_period_ms = value;
        }
        if let Some(value) = override_cfg.time_unit {
            self.time_unit = value;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = Some(value.parse().with_context(|| "parse metrics_bind")?);
        }
        if let Some(value) = override_cfg.connect_timeout_ms.filter(|value| *value > 0) {
            self.connect_timeout_ms = value;
        }
        if let Some(value) = override_cfg.flush_timeout_ms.filter(|value| *value > 0) {
            self.flush_timeout_ms = value;
        }
        if let Some(value) = override_cfg.client_name {
            self.client_name = Some(value);
        }
        Ok(())
    }

    pub fn apply_args(&mut self, args: &ProbeArgs) {
        if let Some(value) = args.transport {
            self.transport = value;
        }
        if let Some(value) = &args.brokers {
            self.brokers = value
                .iter()
                .map(|broker| broker.trim().to_string())
                .filter(|broker| !broker.is_empty())
                .collect();
        }
        if let Some(value) = &args.topic {
            self.topic = value.clone();
        }
        if let Some(value) = args.partition {
            self.partition = value;
        }
        if let Some(value) = args.offset {
            self.offset = value;
        }
        if let Some(value) = args.tick_period_us {
            self.tick_period_us = value;
        }
        if let Some(value) = args.stat_period_ms {
            self.stat_period_ms = value;
        }
        if let Some(value) = args.time_unit {
            self.time_unit = value;
        }
        if let Some(value) = args.metrics_bind {
            self.metrics_bind = Some(value);
        }
        if let Some(value) = args.connect_timeout_ms.filter(|value| *value > 0) {
            self.connect_timeout_ms = value;
        }
        if let Some(value) = args.flush_timeout_ms.filter(|value| *value > 0) {
            self.flush_timeout_ms = value;
        }
        if let Some(value) = &args.client_name {
            self.client_name = Some(value.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_period_us == 0 {
            bail!("tick_period_us must be positive");
        }
        if self.stat_period_ms == 0 {
            bail!("stat_period_ms must be positive");
        }
        if self.topic.trim().is_empty() {
            bail!("topic must not be empty");
        }
        if self.topic.contains(char::is_whitespace) {
            bail!("topic must not contain whitespace: {:?}", self.topic);
        }
        if self.partition >= MAX_PARTITIONS {
            bail!(
                "partition {} out of range (must be below {MAX_PARTITIONS})",
                self.partition
            );
        }
        match self.transport {
            TransportKind::Nats => {
                if self.brokers.is_empty() {
                    bail!("at least one broker address is required");
                }
                if self.offset != StartPosition::Newest {
                    bail!(
                        "offset {} needs a replaying transport; nats only reads from newest",
                        self.offset
                    );
                }
                if self.partition != 0 {
                    bail!("nats subjects have no partitions (got partition {})", self.partition);
                }
            }
            TransportKind::Kafka => {
                if self.brokers.is_empty() {
                    bail!("at least one broker address is required");
                }
                if let StartPosition::Offset(offset) = self.offset
                    && i64::try_from(offset).is_err()
                {
                    bail!("offset {offset} is beyond the Kafka offset range");
                }
            }
            TransportKind::InProcess => {}
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_micros(self.tick_period_us)
    }

    pub fn stat_period(&self) -> Duration {
        Duration::from_millis(self.stat_period_ms)
    }

    pub fn kafka_config(&self) -> KafkaConfig {
        KafkaConfig {
            client_id: self.client_name.clone(),
            // validate() keeps partitions below MAX_PARTITIONS.
            partition: i32::try_from(self.partition).unwrap_or(i32::MAX),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            delivery_timeout: Duration::from_millis(self.flush_timeout_ms),
        }
    }

    pub fn nats_config(&self) -> NatsConfig {
        NatsConfig {
            name: self.client_name.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            flush_timeout: Duration::from_millis(self.flush_timeout_ms),
            ..NatsConfig::default()
        }
    }
}

fn split_brokers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|broker| !broker.is_empty())
        .map(str::to_string)
        .collect()
}

// Unset variables fall back to the default; set but unparsable ones are errors.
fn read_env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parse {key}")),
        Err(_) => Ok(None),
    }
}
