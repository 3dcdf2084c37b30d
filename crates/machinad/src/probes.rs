//! Probe catalog: named read-only inspection commands, each paired
//! with a parser from raw text to a typed reading.
//!
//! Probes never mutate system state. A parser that cannot make sense
//! of the output reports the problem as a string; the runner turns
//! that into `ProbeError::ParseFailed` and the tick substitutes the
//! probe's fallback reading.

use machina_common::config::ProbeConfig;

/// One process row from the process list probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub command: String,
}

/// One listening socket from the open ports probe.
#[derive(Debug, Clone, PartialEq)]
pub struct PortEntry {
    pub protocol: String,
    pub address: String,
    pub port: u16,
}

/// Typed output of a probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeReading {
    /// Named numeric metrics, fed straight into metrics memory.
    Metrics(Vec<(String, f64)>),
    Processes(Vec<ProcessEntry>),
    Ports(Vec<PortEntry>),
    LogTail(Vec<String>),
}

impl ProbeReading {
    /// Metric samples this reading contributes to the tick.
    pub fn samples(&self) -> Vec<(String, f64)> {
        match self {
            ProbeReading::Metrics(m) => m.clone(),
            ProbeReading::Processes(p) => vec![("process_count".to_string(), p.len() as f64)],
            ProbeReading::Ports(p) => vec![("open_ports".to_string(), p.len() as f64)],
            ProbeReading::LogTail(lines) => {
                vec![("log_error_lines".to_string(), lines.len() as f64)]
            }
        }
    }
}

type Parser = fn(&str) -> Result<ProbeReading, String>;
type Fallback = fn() -> ProbeReading;

/// A named, timeout-bounded external inspection command plus the
/// parser for its output. Consumers can register their own.
#[derive(Clone)]
pub struct Probe {
    pub id: String,
    pub command: String,
    pub parser: Parser,
    /// Substituted when the probe times out, fails, or parses badly.
    pub fallback: Fallback,
}

impl Probe {
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        parser: Parser,
        fallback: Fallback,
    ) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            parser,
            fallback,
        }
    }
}

fn empty_metrics() -> ProbeReading {
    ProbeReading::Metrics(Vec::new())
}

fn empty_processes() -> ProbeReading {
    ProbeReading::Processes(Vec::new())
}

fn empty_ports() -> ProbeReading {
    ProbeReading::Ports(Vec::new())
}

fn empty_log_tail() -> ProbeReading {
    ProbeReading::LogTail(Vec::new())
}

/// The built-in probe set: the same heartbeat the original shell
/// collector took, each as a structured probe.
pub fn default_probes(cfg: &ProbeConfig) -> Vec<Probe> {
    vec![
        Probe::new(
            "load_average",
            "cat /proc/loadavg",
            parse_loadavg,
            empty_metrics,
        ),
        Probe::new("memory", "free -m", parse_free, empty_metrics),
        Probe::new("disk_root", "df -P /", parse_df_root, empty_metrics),
        Probe::new("open_ports", "ss -tuln", parse_ss, empty_ports),
        Probe::new(
            "top_processes",
            "ps aux --sort=-%cpu",
            parse_ps,
            empty_processes,
        ),
        Probe::new(
            "log_tail",
            format!(
                "journalctl -p err -n {} --no-pager --output=short",
                cfg.log_tail_lines
            ),
            parse_log_tail,
            empty_log_tail,
        ),
    ]
}

/// `/proc/loadavg`: "0.52 0.58 0.59 1/1262 12345"
pub fn parse_loadavg(raw: &str) -> Result<ProbeReading, String> {
    let mut fields = raw.split_whitespace();
    let mut metrics = Vec::new();
    for name in ["cpu_load_1m", "cpu_load_5m", "cpu_load_15m"] {
        let field = fields.next().ok_or("loadavg: too few fields")?;
        let value: f64 = field
            .parse()
            .map_err(|_| format!("loadavg: bad float {field:?}"))?;
        metrics.push((name.to_string(), value));
    }
    Ok(ProbeReading::Metrics(metrics))
}

/// `free -m`: the "Mem:" row carries total/used/free/.../available.
pub fn parse_free(raw: &str) -> Result<ProbeReading, String> {
    let mem_line = raw
        .lines()
        .find(|l| l.starts_with("Mem:"))
        .ok_or("free: no Mem: row")?;
    let fields: Vec<&str> = mem_line.split_whitespace().collect();
    if fields.len() < 3 {
        return Err("free: Mem: row too short".to_string());
    }

    let total: f64 = fields[1].parse().map_err(|_| "free: bad total")?;
    let used: f64 = fields[2].parse().map_err(|_| "free: bad used")?;
    // Column 7 is "available" on modern procps; fall back to free.
    let free: f64 = fields
        .get(6)
        .or_else(|| fields.get(3))
        .and_then(|f| f.parse().ok())
        .ok_or("free: bad available")?;

    let used_percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };
    Ok(ProbeReading::Metrics(vec![
        ("memory_total_mb".to_string(), total),
        ("memory_used_mb".to_string(), used),
        ("memory_free_mb".to_string(), free),
        ("memory_used_percent".to_string(), used_percent),
    ]))
}

/// `df -P /`: one data row, fifth column is the use percentage.
pub fn parse_df_root(raw: &str) -> Result<ProbeReading, String> {
    let row = raw.lines().nth(1).ok_or("df: no data row")?;
    let fields: Vec<&str> = row.split_whitespace().collect();
    let used = fields.get(4).ok_or("df: missing use% column")?;
    let percent: f64 = used
        .trim_end_matches('%')
        .parse()
        .map_err(|_| format!("df: bad percent {used:?}"))?;
    Ok(ProbeReading::Metrics(vec![(
        "disk_usage_root".to_string(),
        percent,
    )]))
}

/// `ss -tuln`: listening sockets, local address in the fifth column.
pub fn parse_ss(raw: &str) -> Result<ProbeReading, String> {
    let mut ports = Vec::new();
    for line in raw.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let protocol = fields[0].to_string();
        let local = fields[4];
        let Some((address, port)) = local.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        ports.push(PortEntry {
            protocol,
            address: address.to_string(),
            port,
        });
    }
    Ok(ProbeReading::Ports(ports))
}

/// `ps aux --sort=-%cpu`: keep the top rows, skipping the header.
pub fn parse_ps(raw: &str) -> Result<ProbeReading, String> {
    const TOP_N: usize = 15;
    let mut processes = Vec::new();
    for line in raw.lines().skip(1).take(TOP_N) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 11 {
            continue;
        }
        let Ok(pid) = fields[1].parse::<u32>() else {
            continue;
        };
        let cpu_percent = fields[2].parse().unwrap_or(0.0);
        let mem_percent = fields[3].parse().unwrap_or(0.0);
        processes.push(ProcessEntry {
            pid,
            cpu_percent,
            mem_percent,
            command: fields[10..].join(" "),
        });
    }
    if processes.is_empty() && raw.lines().count() > 1 {
        return Err("ps: no parseable rows".to_string());
    }
    Ok(ProbeReading::Processes(processes))
}

/// Error-priority journal tail; empty journals print a placeholder
/// line starting with "--" which is not an error.
pub fn parse_log_tail(raw: &str) -> Result<ProbeReading, String> {
    let lines = raw
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with("--"))
        .map(|l| l.to_string())
        .collect();
    Ok(ProbeReading::LogTail(lines))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loadavg() {
        let reading = parse_loadavg("0.52 0.58 0.59 1/1262 12345\n").unwrap();
        match reading {
            ProbeReading::Metrics(m) => {
                assert_eq!(m[0], ("cpu_load_1m".to_string(), 0.52));
                assert_eq!(m[2], ("cpu_load_15m".to_string(), 0.59));
            }
            other => panic!("unexpected reading {other:?}"),
        }
    }

    #[test]
    fn loadavg_garbage_is_parse_error() {
        assert!(parse_loadavg("not a loadavg").is_err());
        assert!(parse_loadavg("").is_err());
    }

    #[test]
    fn parses_free() {
        let raw = "\
               total        used        free      shared  buff/cache   available
Mem:           15843        6521        2210         812        7111        8173
Swap:           2047           0        2047
";
        let reading = parse_free(raw).unwrap();
        let samples = reading.samples();
        let free = samples.iter().find(|(n, _)| n == "memory_free_mb").unwrap();
        assert_eq!(free.1, 8173.0);
        let used_pct = samples
            .iter()
            .find(|(n, _)| n == "memory_used_percent")
            .unwrap();
        assert!((used_pct.1 - 41.16).abs() < 0.1);
    }

    #[test]
    fn parses_df_root() {
        let raw = "\
Filesystem     1024-blocks      Used Available Capacity Mounted on
/dev/nvme0n1p2   487652352 201234567 261543210      44% /
";
        let reading = parse_df_root(raw).unwrap();
        assert_eq!(
            reading.samples(),
            vec![("disk_usage_root".to_string(), 44.0)]
        );
    }

    #[test]
    fn parses_ss_listening_sockets() {
        let raw = "\
Netid State  Recv-Q Send-Q Local Address:Port Peer Address:Port
tcp   LISTEN 0      128          0.0.0.0:22        0.0.0.0:*
tcp   LISTEN 0      511        127.0.0.1:80        0.0.0.0:*
udp   UNCONN 0      0            0.0.0.0:68        0.0.0.0:*
";
        let reading = parse_ss(raw).unwrap();
        match &reading {
            ProbeReading::Ports(ports) => {
                assert_eq!(ports.len(), 3);
                assert_eq!(ports[0].port, 22);
                assert_eq!(ports[1].address, "127.0.0.1");
            }
            other => panic!("unexpected reading {other:?}"),
        }
        assert_eq!(reading.samples(), vec![("open_ports".to_string(), 3.0)]);
    }

    #[test]
    fn parses_ps_rows() {
        let raw = "\
USER  PID %CPU %MEM    VSZ   RSS TTY STAT START TIME COMMAND
root    1  0.0  0.1 171234 11500 ?   Ss   Jan01 1:23 /sbin/init
www    42 93.5  2.0 812345 65432 ?   R    Jan01 9:01 nginx: worker process
";
        let reading = parse_ps(raw).unwrap();
        match reading {
            ProbeReading::Processes(procs) => {
                assert_eq!(procs.len(), 2);
                assert_eq!(procs[1].pid, 42);
                assert_eq!(procs[1].cpu_percent, 93.5);
                assert_eq!(procs[1].command, "nginx: worker process");
            }
            other => panic!("unexpected reading {other:?}"),
        }
    }

    #[test]
    fn log_tail_skips_placeholder() {
        let raw = "-- No entries --\n";
        let reading = parse_log_tail(raw).unwrap();
        assert_eq!(reading, ProbeReading::LogTail(vec![]));

        let raw = "Jan 01 00:00:01 host kernel: BUG: something\n";
        let reading = parse_log_tail(raw).unwrap();
        assert_eq!(reading.samples(), vec![("log_error_lines".to_string(), 1.0)]);
    }

    #[test]
    fn default_probes_cover_heartbeat() {
        let probes = default_probes(&ProbeConfig::default());
        let ids: Vec<&str> = probes.iter().map(|p| p.id.as_str()).collect();
        assert!(ids.contains(&"load_average"));
        assert!(ids.contains(&"memory"));
        assert!(ids.contains(&"disk_root"));
        assert!(ids.contains(&"open_ports"));
        assert!(ids.contains(&"log_tail"));
    }
}
