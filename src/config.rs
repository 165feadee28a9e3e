//! Messenger configuration.
//!
//! Configuration is read from TOML. Every key is optional and falls back to
//! the default listed on the corresponding field.
//!
//! ```toml
//! msger_id = "127.0.0.1/7000"
//! node_listen_ports = ["TCP@127.0.0.1/7000", "RDMA@127.0.0.1/7100-7110"]
//! worker_num = 4
//! rdma_enable = true
//! ```

use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::msg::{MsgerId, TransportType};

/// Kind of the worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    /// One OS thread per worker, each running its own reactor.
    #[default]
    Thread,
}

/// A listen port specification: a transport, an IP, and a port range of
/// which the first free port is taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub ttype: TransportType,
    pub ip: IpAddr,
    pub ports: RangeInclusive<u16>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MsgConfig {
    /// Peer identity of this messenger, `ip/port`. Empty means the identity
    /// is taken from the first TCP listen port.
    pub msger_id: String,
    /// Listen ports, `TCP@127.0.0.1/7000` or `RDMA@127.0.0.1/7100-7110`.
    pub node_listen_ports: Vec<String>,

    pub worker_type: WorkerType,
    pub worker_num: usize,
    /// Whitespace-separated CPU ids, one per worker. Empty disables pinning.
    pub worker_cpu_map: String,

    pub rdma_enable: bool,
    /// Device name; empty opens the first device.
    pub rdma_device_name: String,
    pub rdma_port_num: u8,
    pub rdma_gid_index: u8,
    /// Upper bound of buffer units the pool may hand out; 0 means no limit.
    pub rdma_buffer_num: usize,
    /// Size of one transport chunk.
    pub rdma_buffer_size: usize,
    pub rdma_max_inline_data: u32,
    pub rdma_send_queue_len: u32,
    pub rdma_recv_queue_len: u32,
    pub rdma_enable_hugepage: bool,
    pub rdma_enable_srq: bool,
    pub rdma_cq_pair_num: usize,
    pub rdma_traffic_class: u8,
    pub rdma_service_level: u8,
    pub rdma_path_mtu: u32,
    pub rdma_mem_min_level: u32,
    pub rdma_mem_max_level: u32,
    /// Reap completions on completion-channel readiness rather than by
    /// polling every loop iteration.
    pub rdma_poll_event: bool,
}

impl Default for MsgConfig {
    fn default() -> Self {
        Self {
            msger_id: String::new(),
            node_listen_ports: Vec::new(),
            worker_type: WorkerType::Thread,
            worker_num: 4,
            worker_cpu_map: String::new(),
            rdma_enable: false,
            rdma_device_name: String::new(),
            rdma_port_num: 1,
            rdma_gid_index: 0,
            rdma_buffer_num: 0,
            rdma_buffer_size: 4224,
            rdma_max_inline_data: 128,
            rdma_send_queue_len: 64,
            rdma_recv_queue_len: 1024,
            rdma_enable_hugepage: true,
            rdma_enable_srq: true,
            rdma_cq_pair_num: 1,
            rdma_traffic_class: 0,
            rdma_service_level: 0,
            rdma_path_mtu: 4096,
            rdma_mem_min_level: 12,
            rdma_mem_max_level: 29,
            rdma_poll_event: true,
        }
    }
}

fn listen_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?i)(tcp|rdma)@([0-9a-f.:]+)/(\d{1,5})(?:-(\d{1,5}))?$")
            .expect("listen port pattern is valid")
    })
}

fn invalid(key: &'static str, why: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(key, why.into())
}

impl MsgConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: MsgConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_num == 0 {
            return Err(invalid("worker_num", "at least one worker is required"));
        }
        let cpus = self.cpu_map()?;
        if !cpus.is_empty() && cpus.len() != self.worker_num {
            return Err(invalid(
                "worker_cpu_map",
                format!("{} entries for {} workers", cpus.len(), self.worker_num),
            ));
        }
        self.msger()?;
        self.listen_specs()?;

        if !self.rdma_enable {
            return Ok(());
        }
        if !matches!(self.rdma_path_mtu, 256 | 512 | 1024 | 2048 | 4096) {
            return Err(invalid("rdma_path_mtu", format!("{} is not a valid MTU", self.rdma_path_mtu)));
        }
        let (min, max) = (self.rdma_mem_min_level, self.rdma_mem_max_level);
        if min < 4 || max < min || max - min >= 32 || max >= usize::BITS {
            return Err(invalid("rdma_mem_max_level", format!("levels {}..={} out of range", min, max)));
        }
        if self.rdma_max_inline_data < 64 {
            return Err(invalid("rdma_max_inline_data", "must be at least 64"));
        }
        if self.rdma_buffer_size == 0 || self.rdma_buffer_size > 1 << max {
            return Err(invalid(
                "rdma_buffer_size",
                format!("{} does not fit a {}-byte region", self.rdma_buffer_size, 1usize << max),
            ));
        }
        if self.rdma_send_queue_len == 0 || self.rdma_recv_queue_len == 0 {
            return Err(invalid("rdma_send_queue_len", "queue lengths must be positive"));
        }
        Ok(())
    }

    /// Parsed `msger_id`, `None` when empty.
    pub fn msger(&self) -> Result<Option<MsgerId>, ConfigError> {
        if self.msger_id.trim().is_empty() {
            return Ok(None);
        }
        self.msger_id
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid("msger_id", format!("{}", e)))
    }

    /// Parsed `node_listen_ports`.
    pub fn listen_specs(&self) -> Result<Vec<ListenSpec>, ConfigError> {
        self.node_listen_ports
            .iter()
            .map(|s| parse_listen_spec(s))
            .collect()
    }

    /// Parsed `worker_cpu_map`.
    pub fn cpu_map(&self) -> Result<Vec<usize>, ConfigError> {
        self.worker_cpu_map
            .split_whitespace()
            .map(|s| {
                s.parse()
                    .map_err(|_| invalid("worker_cpu_map", format!("`{}` is not a CPU id", s)))
            })
            .collect()
    }

    /// Number of RDMA completion queue pairs actually created: at most one per
    /// worker besides worker 0, and at least one.
    pub fn cq_pair_num(&self) -> usize {
        self.rdma_cq_pair_num
            .clamp(1, self.worker_num.saturating_sub(1).max(1))
    }
}

fn parse_listen_spec(s: &str) -> Result<ListenSpec, ConfigError> {
    let caps = listen_regex()
        .captures(s.trim())
        .ok_or_else(|| invalid("node_listen_ports", format!("`{}` is not `TYPE@ip/port[-port]`", s)))?;
    let ttype: TransportType = caps[1]
        .parse()
        .map_err(|_| invalid("node_listen_ports", format!("unknown transport in `{}`", s)))?;
    let ip: IpAddr = caps[2]
        .parse()
        .map_err(|_| invalid("node_listen_ports", format!("bad IP in `{}`", s)))?;
    let port = |m: &str| {
        m.parse::<u16>()
            .map_err(|_| invalid("node_listen_ports", format!("bad port in `{}`", s)))
    };
    let first = port(&caps[3])?;
    let last = match caps.get(4) {
        Some(m) => port(m.as_str())?,
        None => first,
    };
    if last < first {
        return Err(invalid("node_listen_ports", format!("empty port range in `{}`", s)));
    }
    Ok(ListenSpec {
        ttype,
        ip,
        ports: first..=last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn defaults_apply() -> Result<()> {
        let cfg = MsgConfig::from_toml_str("")?;
        assert_eq!(cfg, MsgConfig::default());
        assert_eq!(cfg.worker_num, 4);
        assert_eq!(cfg.rdma_buffer_size, 4224);
        assert_eq!(cfg.rdma_mem_max_level, 29);
        Ok(())
    }

    #[test]
    fn full_document() -> Result<()> {
        let cfg = MsgConfig::from_toml_str(
            r#"
            msger_id = "10.0.0.1/7000"
            node_listen_ports = ["TCP@10.0.0.1/7000", "rdma@10.0.0.1/7100-7110"]
            worker_num = 3
            worker_cpu_map = "2 4 6"
            rdma_enable = true
            rdma_cq_pair_num = 8
            rdma_path_mtu = 1024
            "#,
        )?;
        assert_eq!(cfg.msger()?, Some("10.0.0.1/7000".parse()?));
        let specs = cfg.listen_specs()?;
        assert_eq!(specs[0].ttype, TransportType::Tcp);
        assert_eq!(specs[0].ports, 7000..=7000);
        assert_eq!(specs[1].ttype, TransportType::Rdma);
        assert_eq!(specs[1].ports, 7100..=7110);
        assert_eq!(cfg.cpu_map()?, vec![2, 4, 6]);
        assert_eq!(cfg.cq_pair_num(), 2);
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad = [
            "worker_num = 0",
            "worker_num = 2\nworker_cpu_map = \"1\"",
            "node_listen_ports = [\"udp@1.2.3.4/5\"]",
            "node_listen_ports = [\"tcp@1.2.3.4/9-5\"]",
            "msger_id = \"nonsense\"",
            "rdma_enable = true\nrdma_path_mtu = 1500",
            "rdma_enable = true\nrdma_mem_min_level = 3",
            "rdma_enable = true\nrdma_mem_min_level = 12\nrdma_mem_max_level = 14\nrdma_buffer_size = 65536",
            "unknown_key = 1",
        ];
        for doc in bad {
            assert!(MsgConfig::from_toml_str(doc).is_err(), "accepted: {}", doc);
        }
    }
}
