//! Publishes periodic host telemetry (CPU time counters, memory usage) under
//! pre-formatted topics, bypassing the regular `<prefix>/<gw>/<sender>/<type>`
//! template used by other devices.
//!
//! The set of published fields is configured by two optional subsections,
//! `[status "cpu"]` (`cpu_times = user,system,...`) and `[status "memory"]`
//! (`virtual_memory = total,available,...`). A field absent from its list is
//! simply never published; an absent subsection publishes nothing for that
//! `main` category.

use std::time::Duration;

use sysinfo::System;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::config::Config;
use crate::message::Message;

#[derive(Debug, Error)]
pub enum StatusConfigError {
    /// An explicit `[status]` section with `interval = 0`, or with the
    /// `interval` key entirely absent, is a configuration error; an *absent*
    /// `[status]` section means "no status device" and is not.
    #[error("status interval must be greater than zero")]
    ZeroInterval,

    #[error("interval must be a positive integer of seconds, got {0:?}")]
    InvalidInterval(String),

    #[error("broker name must be set")]
    MissingBroker,
}

/// One CPU time counter, named to match its `cpu_times` config list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuField {
    User,
    System,
    Idle,
    Nice,
    Iowait,
    Irq,
    Softirq,
    Guest,
}

impl CpuField {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "system" => Some(Self::System),
            "idle" => Some(Self::Idle),
            "nice" => Some(Self::Nice),
            "iowait" => Some(Self::Iowait),
            "irq" => Some(Self::Irq),
            "softirq" => Some(Self::Softirq),
            "guest" => Some(Self::Guest),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Idle => "idle",
            Self::Nice => "nice",
            Self::Iowait => "iowait",
            Self::Irq => "irq",
            Self::Softirq => "softirq",
            Self::Guest => "guest",
        }
    }
}

/// One virtual-memory counter, named to match its `virtual_memory` config list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryField {
    Total,
    Available,
    Percent,
    Used,
    Free,
}

impl MemoryField {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "total" => Some(Self::Total),
            "available" => Some(Self::Available),
            "percent" => Some(Self::Percent),
            "used" => Some(Self::Used),
            "free" => Some(Self::Free),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Available => "available",
            Self::Percent => "percent",
            Self::Used => "used",
            Self::Free => "free",
        }
    }
}

/// Raw counter values for one sampling tick, decoupled from any particular
/// collection backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTimes {
    pub user: u64,
    pub system: u64,
    pub idle: u64,
    pub nice: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub guest: u64,
}

impl CpuTimes {
    fn get(&self, field: CpuField) -> u64 {
        match field {
            CpuField::User => self.user,
            CpuField::System => self.system,
            CpuField::Idle => self.idle,
            CpuField::Nice => self.nice,
            CpuField::Iowait => self.iowait,
            CpuField::Irq => self.irq,
            CpuField::Softirq => self.softirq,
            CpuField::Guest => self.guest,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualMemory {
    pub total: u64,
    pub available: u64,
    pub percent: f32,
    pub used: u64,
    pub free: u64,
}

/// Source of host telemetry, abstracted so the device's publish logic can be
/// tested without touching the real machine's CPU/memory counters. Host
/// metrics collection is a pluggable telemetry source (spec's own words) —
/// this crate's production implementation is one reasonable choice among
/// several, not load-bearing for the routing core.
pub trait HostMetrics: Send {
    fn refresh(&mut self);
    fn cpu_times(&self) -> CpuTimes;
    fn virtual_memory(&self) -> VirtualMemory;
}

pub struct SysinfoMetrics {
    system: System,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMetrics for SysinfoMetrics {
    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
    }

    /// `sysinfo` exposes only an aggregate usage percentage portably; the
    /// per-state breakdown (`user`/`system`/`iowait`/...) is read straight
    /// from `/proc/stat` on Linux, the same source `gopsutil` reads under
    /// the original implementation. Elsewhere all counters report zero.
    fn cpu_times(&self) -> CpuTimes {
        read_proc_stat_cpu_times().unwrap_or_default()
    }

    fn virtual_memory(&self) -> VirtualMemory {
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let free = self.system.free_memory();
        let available = self.system.available_memory();
        let percent = if total > 0 { used as f32 / total as f32 * 100.0 } else { 0.0 };
        VirtualMemory { total, available, percent, used, free }
    }
}

#[cfg(target_os = "linux")]
fn read_proc_stat_cpu_times() -> Option<CpuTimes> {
    let contents = std::fs::read_to_string("/proc/stat").ok()?;
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let mut fields = line.split_whitespace().skip(1).filter_map(|f| f.parse::<u64>().ok());
    Some(CpuTimes {
        user: fields.next()?,
        nice: fields.next()?,
        system: fields.next()?,
        idle: fields.next()?,
        iowait: fields.next()?,
        irq: fields.next()?,
        softirq: fields.next()?,
        guest: fields.next().unwrap_or(0),
    })
}

#[cfg(not(target_os = "linux"))]
fn read_proc_stat_cpu_times() -> Option<CpuTimes> {
    None
}

/// Parses a comma-separated field list, e.g. `"user, system, idle"`, skipping
/// empty entries and anything not a recognized field name for `F`.
fn parse_field_list<F>(raw: &str, parse: impl Fn(&str) -> Option<F>) -> Vec<F> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(parse)
        .collect()
}

pub struct StatusDevice {
    pub gateway_name: String,
    pub broker_name: String,
    pub interval: Duration,
    pub cpu_fields: Vec<CpuField>,
    pub memory_fields: Vec<MemoryField>,
}

/// `$SYS`: the literal, non-configurable base every status topic is rooted
/// at, matching the original's hardcoded `genTopic` prefix.
const STATUS_TOPIC_ROOT: &str = "$SYS";

impl StatusDevice {
    /// Builds the status device from the full configuration tree: the
    /// top-level `[status]` section for broker/interval, plus the sibling
    /// `[status "cpu"]`/`[status "memory"]` subsections for field selection.
    pub fn from_config(conf: &Config, gateway_name: &str) -> Result<Self, StatusConfigError> {
        let top = conf
            .sections
            .iter()
            .find(|s| s.r#type == "status" && s.name.is_empty())
            .expect("caller only invokes this once a top-level [status] section is known to exist");

        let interval_secs: u64 = match top.get("interval") {
            None => return Err(StatusConfigError::ZeroInterval),
            Some(raw) => raw.parse().map_err(|_| StatusConfigError::InvalidInterval(raw.to_string()))?,
        };
        if interval_secs == 0 {
            return Err(StatusConfigError::ZeroInterval);
        }

        let broker_name = top.get("broker").unwrap_or_default().to_string();
        if broker_name.is_empty() {
            return Err(StatusConfigError::MissingBroker);
        }

        let cpu_fields = conf
            .sections
            .iter()
            .find(|s| s.r#type == "status" && s.name == "cpu")
            .and_then(|s| s.get("cpu_times"))
            .map(|raw| parse_field_list(raw, CpuField::parse))
            .unwrap_or_default();

        let memory_fields = conf
            .sections
            .iter()
            .find(|s| s.r#type == "status" && s.name == "memory")
            .and_then(|s| s.get("virtual_memory"))
            .map(|raw| parse_field_list(raw, MemoryField::parse))
            .unwrap_or_default();

        Ok(Self {
            gateway_name: gateway_name.to_string(),
            broker_name,
            interval: Duration::from_secs(interval_secs),
            cpu_fields,
            memory_fields,
        })
    }

    pub async fn run(self, out: mpsc::Sender<Message>, stop: oneshot::Receiver<()>) {
        self.run_with(SysinfoMetrics::new(), out, stop).await
    }

    async fn run_with(
        self,
        mut metrics: impl HostMetrics,
        out: mpsc::Sender<Message>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    metrics.refresh();
                    for msg in self.snapshot_messages(&metrics) {
                        if out.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
                _ = &mut stop => {
                    info!(gateway = %self.gateway_name, "status device stop requested");
                    return;
                }
            }
        }
    }

    fn topic_base(&self) -> String {
        format!("{}/gateway/{}", STATUS_TOPIC_ROOT, self.gateway_name)
    }

    fn snapshot_messages(&self, metrics: &impl HostMetrics) -> Vec<Message> {
        let base = self.topic_base();
        let mut messages = Vec::with_capacity(self.cpu_fields.len() + self.memory_fields.len());

        if !self.cpu_fields.is_empty() {
            let times = metrics.cpu_times();
            for field in &self.cpu_fields {
                messages.push(Message::status(
                    format!("{base}/cpu/cpu_times/{}", field.as_str()),
                    times.get(*field).to_string().into_bytes(),
                    self.broker_name.clone(),
                ));
            }
        }

        if !self.memory_fields.is_empty() {
            let mem = metrics.virtual_memory();
            for field in &self.memory_fields {
                let body = match field {
                    MemoryField::Total => mem.total.to_string(),
                    MemoryField::Available => mem.available.to_string(),
                    MemoryField::Percent => mem.percent.to_string(),
                    MemoryField::Used => mem.used.to_string(),
                    MemoryField::Free => mem.free.to_string(),
                };
                messages.push(Message::status(
                    format!("{base}/memory/virtual_memory/{}", field.as_str()),
                    body.into_bytes(),
                    self.broker_name.clone(),
                ));
            }
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    struct FakeMetrics {
        cpu: CpuTimes,
        mem: VirtualMemory,
    }

    impl HostMetrics for FakeMetrics {
        fn refresh(&mut self) {}
        fn cpu_times(&self) -> CpuTimes {
            self.cpu
        }
        fn virtual_memory(&self) -> VirtualMemory {
            self.mem
        }
    }

    #[test]
    fn absent_interval_is_zero_interval_error() {
        let conf = Config::load_bytes(b"[gateway]\nname=ham\n[status]\nbroker=sango\n").unwrap();
        assert!(matches!(StatusDevice::from_config(&conf, "ham"), Err(StatusConfigError::ZeroInterval)));
    }

    #[test]
    fn explicit_zero_interval_is_error() {
        let conf = Config::load_bytes(b"[gateway]\nname=ham\n[status]\nbroker=sango\ninterval=0\n").unwrap();
        assert!(matches!(StatusDevice::from_config(&conf, "ham"), Err(StatusConfigError::ZeroInterval)));
    }

    #[test]
    fn no_subsections_means_no_fields() {
        let conf = Config::load_bytes(b"[gateway]\nname=ham\n[status]\nbroker=sango\ninterval=5\n").unwrap();
        let device = StatusDevice::from_config(&conf, "ham").unwrap();
        assert!(device.cpu_fields.is_empty());
        assert!(device.memory_fields.is_empty());
    }

    #[test]
    fn parses_cpu_and_memory_field_lists() {
        let conf = Config::load_bytes(
            b"[gateway]\nname=ham\n[status]\nbroker=sango\ninterval=5\n\
              [status \"cpu\"]\ncpu_times=user, idle\n\
              [status \"memory\"]\nvirtual_memory=total,percent\n",
        )
        .unwrap();
        let device = StatusDevice::from_config(&conf, "ham").unwrap();
        assert_eq!(device.cpu_fields, vec![CpuField::User, CpuField::Idle]);
        assert_eq!(device.memory_fields, vec![MemoryField::Total, MemoryField::Percent]);
    }

    #[test]
    fn snapshot_topics_are_preformatted_and_bypass_the_regular_template() {
        let conf = Config::load_bytes(
            b"[gateway]\nname=ham\n[status]\nbroker=sango\ninterval=5\n\
              [status \"cpu\"]\ncpu_times=user\n\
              [status \"memory\"]\nvirtual_memory=percent\n",
        )
        .unwrap();
        let device = StatusDevice::from_config(&conf, "ham").unwrap();
        let metrics = FakeMetrics {
            cpu: CpuTimes { user: 42, ..Default::default() },
            mem: VirtualMemory { percent: 12.5, ..Default::default() },
        };
        let msgs = device.snapshot_messages(&metrics);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].topic.as_deref(), Some("$SYS/gateway/ham/cpu/cpu_times/user"));
        assert_eq!(msgs[0].body, b"42");
        assert_eq!(msgs[0].sender, crate::message::STATUS_SENDER);
        assert_eq!(msgs[1].topic.as_deref(), Some("$SYS/gateway/ham/memory/virtual_memory/percent"));
        assert_eq!(msgs[1].body, b"12.5");
    }

    #[test]
    fn field_not_in_configured_list_is_not_published() {
        let conf = Config::load_bytes(
            b"[gateway]\nname=ham\n[status]\nbroker=sango\ninterval=5\n[status \"cpu\"]\ncpu_times=idle\n",
        )
        .unwrap();
        let device = StatusDevice::from_config(&conf, "ham").unwrap();
        let metrics = FakeMetrics { cpu: CpuTimes::default(), mem: VirtualMemory::default() };
        let msgs = device.snapshot_messages(&metrics);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].topic.as_deref().unwrap().ends_with("/idle"));
    }
}
