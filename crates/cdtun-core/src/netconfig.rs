//! Declarative interface configuration via OS administrative tools.
//!
//! Address, MTU, and route programming shell out to the platform's native
//! tooling (`ip` on Linux, `ifconfig`/`route`/`netstat` on Darwin, the
//! PowerShell Net* cmdlets on Windows). Inputs are validated before any
//! command runs; an OS report of "already exists" is treated as success.

use std::io;
use std::net::Ipv6Addr;
use std::process::Command;

use tracing::{debug, info};

use crate::constants::{MAX_TUNNEL_MTU, MIN_TUNNEL_MTU};
use crate::error::{Error, Result};

/// RX/TX counters read back from the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

// =============================================================================
// Validation
// =============================================================================

/// Validate an IPv6 literal.
///
/// Accepts canonical, compressed, zone-id (`fe80::1%utun3`), and
/// IPv4-mapped (`::ffff:1.2.3.4`) forms.
pub fn validate_ipv6_literal(address: &str) -> Result<()> {
    let host = match address.split_once('%') {
        Some((host, zone)) if !host.is_empty() && !zone.is_empty() => host,
        Some(_) => {
            return Err(Error::invalid_argument(format!(
                "malformed zone id in address: {address}"
            )));
        }
        None => address,
    };

    host.parse::<Ipv6Addr>().map(|_| ()).map_err(|_| {
        Error::invalid_argument(format!("not an IPv6 address: {address}"))
    })
}

/// Validate an interface MTU.
pub fn validate_mtu(mtu: u32) -> Result<()> {
    if !(MIN_TUNNEL_MTU..=MAX_TUNNEL_MTU).contains(&mtu) {
        return Err(Error::invalid_argument(format!(
            "MTU must be between {MIN_TUNNEL_MTU} and {MAX_TUNNEL_MTU}, got {mtu}"
        )));
    }
    Ok(())
}

fn validate_route(cidr: &str) -> Result<()> {
    if cidr.trim().is_empty() {
        return Err(Error::invalid_argument("route must be a non-empty string"));
    }
    Ok(())
}

// =============================================================================
// Operations
// =============================================================================

/// Assign `address/64` to the interface and bring it up with the given MTU.
pub fn configure(interface: &str, address: &str, mtu: u32) -> Result<()> {
    validate_ipv6_literal(address)?;
    validate_mtu(mtu)?;

    apply_address(interface, address)?;
    apply_mtu(interface, mtu)?;
    info!(interface, address, mtu, "configured tunnel interface");
    Ok(())
}

/// Program a route for `cidr` through the interface.
pub fn add_route(interface: &str, cidr: &str) -> Result<()> {
    validate_route(cidr)?;
    route_command(interface, cidr, RouteOp::Add)?;
    debug!(interface, cidr, "route added");
    Ok(())
}

/// Remove a previously programmed route.
pub fn remove_route(interface: &str, cidr: &str) -> Result<()> {
    validate_route(cidr)?;
    route_command(interface, cidr, RouteOp::Remove)?;
    debug!(interface, cidr, "route removed");
    Ok(())
}

#[derive(Clone, Copy)]
enum RouteOp {
    Add,
    Remove,
}

// =============================================================================
// Command execution
// =============================================================================

const EXISTS_MARKERS: [&str; 3] = ["file exists", "already exists", "object already exists"];
const PERMISSION_MARKERS: [&str; 4] = [
    "permission denied",
    "operation not permitted",
    "access is denied",
    "requires elevation",
];

enum ToolOutcome {
    Applied,
    AlreadyExists,
}

fn run_tool(tool: &str, args: &[&str]) -> Result<ToolOutcome> {
    let output = match Command::new(tool).args(args).output() {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(Error::ToolingMissing { tool: tool.into() });
        }
        Err(err) => return Err(Error::Io(err)),
    };

    if output.status.success() {
        return Ok(ToolOutcome::Applied);
    }

    let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stdout));

    if is_already_exists(&text) {
        info!(tool, ?args, "already configured, treating as success");
        return Ok(ToolOutcome::AlreadyExists);
    }
    Err(classify_tool_failure(tool, args, &text))
}

fn is_already_exists(text: &str) -> bool {
    let lower = text.to_lowercase();
    EXISTS_MARKERS.iter().any(|m| lower.contains(m))
}

fn classify_tool_failure(tool: &str, args: &[&str], text: &str) -> Error {
    let lower = text.to_lowercase();
    if PERMISSION_MARKERS.iter().any(|m| lower.contains(m)) {
        return Error::PermissionDenied {
            message: format!("{tool} {}: {}", args.join(" "), text.trim()),
        };
    }
    Error::configuration(format!("{tool} {}: {}", args.join(" "), text.trim()))
}

fn capture_tool(tool: &str, args: &[&str]) -> Result<String> {
    let output = match Command::new(tool).args(args).output() {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(Error::ToolingMissing { tool: tool.into() });
        }
        Err(err) => return Err(Error::Io(err)),
    };
    if !output.status.success() {
        let text = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(classify_tool_failure(tool, args, &text));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// =============================================================================
// Platform command surfaces
// =============================================================================

#[cfg(target_os = "linux")]
fn apply_address(interface: &str, address: &str) -> Result<()> {
    let cidr = format!("{address}/64");
    run_tool("ip", &["-6", "addr", "add", &cidr, "dev", interface]).map(|_| ())
}

#[cfg(target_os = "linux")]
fn apply_mtu(interface: &str, mtu: u32) -> Result<()> {
    let mtu = mtu.to_string();
    run_tool("ip", &["link", "set", "dev", interface, "up", "mtu", &mtu]).map(|_| ())
}

#[cfg(target_os = "linux")]
fn route_command(interface: &str, cidr: &str, op: RouteOp) -> Result<()> {
    let verb = match op {
        RouteOp::Add => "add",
        RouteOp::Remove => "del",
    };
    run_tool("ip", &["-6", "route", verb, cidr, "dev", interface]).map(|_| ())
}

/// Read interface counters from `ip -s link show`.
#[cfg(target_os = "linux")]
pub fn link_stats(interface: &str) -> Result<LinkStats> {
    let output = capture_tool("ip", &["-s", "link", "show", interface])?;
    parse_ip_stats(&output)
}

#[cfg(target_os = "macos")]
fn apply_address(interface: &str, address: &str) -> Result<()> {
    run_tool(
        "ifconfig",
        &[interface, "inet6", address, "prefixlen", "64", "up"],
    )
    .map(|_| ())
}

#[cfg(target_os = "macos")]
fn apply_mtu(interface: &str, mtu: u32) -> Result<()> {
    let mtu = mtu.to_string();
    run_tool("ifconfig", &[interface, "mtu", &mtu]).map(|_| ())
}

#[cfg(target_os = "macos")]
fn route_command(interface: &str, cidr: &str, op: RouteOp) -> Result<()> {
    let verb = match op {
        RouteOp::Add => "add",
        RouteOp::Remove => "delete",
    };
    run_tool(
        "route",
        &["-n", verb, "-inet6", cidr, "-interface", interface],
    )
    .map(|_| ())
}

/// Read interface counters from `netstat -I <name> -b`.
#[cfg(target_os = "macos")]
pub fn link_stats(interface: &str) -> Result<LinkStats> {
    let output = capture_tool("netstat", &["-I", interface, "-b"])?;
    parse_netstat_stats(&output)
}

#[cfg(target_os = "windows")]
fn powershell(script: &str) -> Result<ToolOutcome> {
    run_tool("powershell", &["-NoProfile", "-Command", script])
}

#[cfg(target_os = "windows")]
fn apply_address(interface: &str, address: &str) -> Result<()> {
    powershell(&format!(
        "New-NetIPAddress -InterfaceAlias '{interface}' -IPAddress '{address}' -PrefixLength 64"
    ))
    .map(|_| ())
}

#[cfg(target_os = "windows")]
fn apply_mtu(interface: &str, mtu: u32) -> Result<()> {
    powershell(&format!(
        "Set-NetIPInterface -InterfaceAlias '{interface}' -AddressFamily IPv6 -NlMtuBytes {mtu}"
    ))
    .map(|_| ())
}

#[cfg(target_os = "windows")]
fn route_command(interface: &str, cidr: &str, op: RouteOp) -> Result<()> {
    let script = match op {
        RouteOp::Add => format!(
            "New-NetRoute -DestinationPrefix '{cidr}' -InterfaceAlias '{interface}'"
        ),
        RouteOp::Remove => format!(
            "Remove-NetRoute -DestinationPrefix '{cidr}' -InterfaceAlias '{interface}' -Confirm:$false"
        ),
    };
    powershell(&script).map(|_| ())
}

/// Read interface counters from `Get-NetAdapterStatistics`.
#[cfg(target_os = "windows")]
pub fn link_stats(interface: &str) -> Result<LinkStats> {
    let output = capture_tool(
        "powershell",
        &[
            "-NoProfile",
            "-Command",
            &format!(
                "Get-NetAdapterStatistics -Name '{interface}' | Format-List ReceivedBytes,ReceivedUnicastPackets,SentBytes,SentUnicastPackets"
            ),
        ],
    )?;
    parse_adapter_statistics(&output)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn apply_address(_interface: &str, _address: &str) -> Result<()> {
    Err(Error::PlatformUnsupported)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn apply_mtu(_interface: &str, _mtu: u32) -> Result<()> {
    Err(Error::PlatformUnsupported)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn route_command(_interface: &str, _cidr: &str, _op: RouteOp) -> Result<()> {
    Err(Error::PlatformUnsupported)
}

/// Interface counters are unavailable off the supported platforms.
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub fn link_stats(_interface: &str) -> Result<LinkStats> {
    Err(Error::PlatformUnsupported)
}

// =============================================================================
// Statistics parsing
// =============================================================================

/// Parse `ip -s link show` output: the line after the `RX:`/`TX:` headers
/// starts with the byte and packet counters.
#[cfg(any(target_os = "linux", test))]
fn parse_ip_stats(output: &str) -> Result<LinkStats> {
    fn counters_after<'a>(
        mut lines: impl Iterator<Item = &'a str>,
        header: &str,
    ) -> Option<(u64, u64)> {
        let _ = lines.find(|line| line.trim_start().starts_with(header))?;
        let data = lines.next()?;
        let mut fields = data.split_whitespace();
        let bytes = fields.next()?.parse().ok()?;
        let packets = fields.next()?.parse().ok()?;
        Some((bytes, packets))
    }

    let rx = counters_after(output.lines(), "RX:").ok_or(Error::StatsUnavailable)?;
    let tx = counters_after(output.lines(), "TX:").ok_or(Error::StatsUnavailable)?;
    Ok(LinkStats {
        rx_bytes: rx.0,
        rx_packets: rx.1,
        tx_bytes: tx.0,
        tx_packets: tx.1,
    })
}

/// Parse `netstat -I <name> -b` output by resolving the counter columns
/// from the header row.
#[cfg(any(target_os = "macos", test))]
fn parse_netstat_stats(output: &str) -> Result<LinkStats> {
    let mut lines = output.lines();
    let header: Vec<&str> = lines.next().ok_or(Error::StatsUnavailable)?.split_whitespace().collect();

    let col = |name: &str| header.iter().position(|&h| h == name);
    let (ipkts, ibytes, opkts, obytes) = match (col("Ipkts"), col("Ibytes"), col("Opkts"), col("Obytes")) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => return Err(Error::StatsUnavailable),
    };

    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != header.len() {
            continue;
        }
        let parse = |idx: usize| fields[idx].parse::<u64>().ok();
        if let (Some(rx_packets), Some(rx_bytes), Some(tx_packets), Some(tx_bytes)) =
            (parse(ipkts), parse(ibytes), parse(opkts), parse(obytes))
        {
            return Ok(LinkStats {
                rx_bytes,
                rx_packets,
                tx_bytes,
                tx_packets,
            });
        }
    }
    Err(Error::StatsUnavailable)
}

/// Parse `Get-NetAdapterStatistics | Format-List` output (`Name : value`
/// lines).
#[cfg(any(target_os = "windows", test))]
fn parse_adapter_statistics(output: &str) -> Result<LinkStats> {
    fn field(output: &str, name: &str) -> Option<u64> {
        output.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim() == name {
                value.trim().parse().ok()
            } else {
                None
            }
        })
    }

    match (
        field(output, "ReceivedBytes"),
        field(output, "ReceivedUnicastPackets"),
        field(output, "SentBytes"),
        field(output, "SentUnicastPackets"),
    ) {
        (Some(rx_bytes), Some(rx_packets), Some(tx_bytes), Some(tx_packets)) => Ok(LinkStats {
            rx_bytes,
            rx_packets,
            tx_bytes,
            tx_packets,
        }),
        _ => Err(Error::StatsUnavailable),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ipv6_forms() {
        for addr in [
            "fd00::2",
            "fd00:0000:0000:0000:0000:0000:0000:0002",
            "fe80::1%utun3",
            "fe80::1%eth0",
            "::ffff:192.0.2.1",
            "::1",
        ] {
            assert!(validate_ipv6_literal(addr).is_ok(), "{addr} should parse");
        }
    }

    #[test]
    fn rejects_non_ipv6() {
        for addr in ["not-an-ip", "10.0.0.1", "fd00::%", "%zone", "", "fd00::2%"] {
            assert!(
                matches!(validate_ipv6_literal(addr), Err(Error::InvalidArgument { .. })),
                "{addr} should be rejected"
            );
        }
    }

    #[test]
    fn mtu_range() {
        assert!(validate_mtu(1280).is_ok());
        assert!(validate_mtu(1500).is_ok());
        assert!(validate_mtu(65535).is_ok());

        let err = validate_mtu(100).unwrap_err();
        assert!(err.to_string().contains("MTU must be between 1280 and 65535"));
        assert!(validate_mtu(1279).is_err());
        assert!(validate_mtu(65536).is_err());
    }

    #[test]
    fn configure_validates_before_any_command() {
        // Neither call may reach the OS: both fail validation first.
        assert!(matches!(
            configure("tun0", "not-an-ip", 1500),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            configure("tun0", "fd00::3", 100),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn empty_route_rejected() {
        assert!(matches!(
            add_route("tun0", "  "),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            remove_route("tun0", ""),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn failure_classification() {
        assert!(matches!(
            classify_tool_failure("ip", &["-6", "addr", "add"], "RTNETLINK answers: Operation not permitted"),
            Error::PermissionDenied { .. }
        ));
        assert!(matches!(
            classify_tool_failure("ip", &["-6", "route", "add"], "RTNETLINK answers: Network is unreachable"),
            Error::ConfigurationFailed { .. }
        ));
    }

    #[test]
    fn exists_markers_match() {
        assert!(is_already_exists("RTNETLINK answers: File exists"));
        assert!(is_already_exists("route: writing to routing socket: File exists"));
        assert!(is_already_exists("The object already exists."));
        assert!(!is_already_exists("Network is unreachable"));
    }

    #[test]
    fn parses_ip_link_stats() {
        let output = "\
4: tun0: <POINTOPOINT,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UNKNOWN
    link/none
    RX:  bytes packets errors dropped  missed   mcast
        104814     927      0       0       0       0
    TX:  bytes packets errors dropped carrier collsns
         35835     375      0       0       0       0
";
        let stats = parse_ip_stats(output).unwrap();
        assert_eq!(stats.rx_bytes, 104814);
        assert_eq!(stats.rx_packets, 927);
        assert_eq!(stats.tx_bytes, 35835);
        assert_eq!(stats.tx_packets, 375);
    }

    #[test]
    fn ip_stats_missing_lines_are_unavailable() {
        assert!(matches!(
            parse_ip_stats("4: tun0: <UP> mtu 1500\n    link/none\n"),
            Err(Error::StatsUnavailable)
        ));
    }

    #[test]
    fn parses_netstat_stats() {
        let output = "\
Name       Mtu   Network       Address            Ipkts Ierrs     Ibytes    Opkts Oerrs     Obytes  Coll
utun3      1500  <Link#17>     utun3                927     0     104814      375     0      35835     0
";
        let stats = parse_netstat_stats(output).unwrap();
        assert_eq!(stats.rx_packets, 927);
        assert_eq!(stats.rx_bytes, 104814);
        assert_eq!(stats.tx_packets, 375);
        assert_eq!(stats.tx_bytes, 35835);
    }

    #[test]
    fn netstat_stats_without_counters_are_unavailable() {
        assert!(matches!(
            parse_netstat_stats("Name Mtu Network Address\n"),
            Err(Error::StatsUnavailable)
        ));
    }

    #[test]
    fn parses_adapter_statistics() {
        let output = "\

ReceivedBytes          : 104814
ReceivedUnicastPackets : 927
SentBytes              : 35835
SentUnicastPackets     : 375

";
        let stats = parse_adapter_statistics(output).unwrap();
        assert_eq!(stats.rx_bytes, 104814);
        assert_eq!(stats.tx_packets, 375);
    }

    #[test]
    fn adapter_statistics_missing_fields_are_unavailable() {
        assert!(matches!(
            parse_adapter_statistics("ReceivedBytes : 1\n"),
            Err(Error::StatsUnavailable)
        ));
    }
}
