//! Typed value validation. Every schema path names one of these types;
//! `list:T` splits on commas and checks each element as `T`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// The named security tiers a client device may be assigned to.
pub const RINGS: &[&str] = &[
    "unenrolled",
    "core",
    "standard",
    "devices",
    "guest",
    "quarantine",
    "internal",
    "wan",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValType {
    Int,
    Bool,
    Float,
    Duration,
    Time,
    Uuid,
    MacAddr,
    Nic,
    Ring,
    Ssid,
    Passphrase,
    IpAddr,
    Cidr,
    PrivateCidr,
    FwTarget,
    Hostname,
    DnsAddr,
    Port,
    IpOptPort,
    Proto,
    KeyMgmt,
    NicState,
    WifiBand,
    WifiWidth,
    TimeUnit,
    TriBool,
    NodeId,
    SshAddr,
    Text,
    Null,
    List(Box<ValType>),
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::List(inner) => write!(f, "list:{inner}"),
            other => f.write_str(other.base_name()),
        }
    }
}

impl ValType {
    fn base_name(&self) -> &'static str {
        match self {
            ValType::Int => "int",
            ValType::Bool => "bool",
            ValType::Float => "float",
            ValType::Duration => "duration",
            ValType::Time => "time",
            ValType::Uuid => "uuid",
            ValType::MacAddr => "macaddr",
            ValType::Nic => "nic",
            ValType::Ring => "ring",
            ValType::Ssid => "ssid",
            ValType::Passphrase => "passphrase",
            ValType::IpAddr => "ipaddr",
            ValType::Cidr => "cidr",
            ValType::PrivateCidr => "privatecidr",
            ValType::FwTarget => "fwtarget",
            ValType::Hostname => "hostname",
            ValType::DnsAddr => "dnsaddr",
            ValType::Port => "port",
            ValType::IpOptPort => "ipoptport",
            ValType::Proto => "proto",
            ValType::KeyMgmt => "keymgmt",
            ValType::NicState => "nicstate",
            ValType::WifiBand => "wifiband",
            ValType::WifiWidth => "wifiwidth",
            ValType::TimeUnit => "time_unit",
            ValType::TriBool => "tribool",
            ValType::NodeId => "nodeid",
            ValType::SshAddr => "sshaddr",
            ValType::Text => "text",
            ValType::Null => "null",
            ValType::List(_) => "list",
        }
    }

    /// Validates `value` against this type. Errors carry a short reason
    /// suitable for the wire `errmsg`.
    pub fn validate(&self, value: &str) -> Result<(), String> {
        match self {
            ValType::Int => value
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("'{value}' is not an integer")),
            ValType::Bool => match value {
                "true" | "false" => Ok(()),
                _ => Err(format!("'{value}' is not a bool")),
            },
            ValType::Float => value
                .parse::<f64>()
                .map(|_| ())
                .map_err(|_| format!("'{value}' is not a float")),
            ValType::Duration => humantime::parse_duration(value)
                .map(|_| ())
                .map_err(|_| format!("'{value}' is not a duration")),
            ValType::Time => OffsetDateTime::parse(value, &Rfc3339)
                .map(|_| ())
                .map_err(|_| format!("'{value}' is not an RFC 3339 time")),
            ValType::Uuid => uuid::Uuid::parse_str(value)
                .map(|_| ())
                .map_err(|_| format!("'{value}' is not a uuid")),
            ValType::MacAddr => validate_macaddr(value),
            ValType::Nic => validate_nic(value),
            ValType::Ring => {
                if RINGS.contains(&value) {
                    Ok(())
                } else {
                    Err(format!("'{value}' is not a ring"))
                }
            }
            ValType::Ssid => validate_ssid(value),
            ValType::Passphrase => validate_passphrase(value),
            ValType::IpAddr => value
                .parse::<IpAddr>()
                .map(|_| ())
                .map_err(|_| format!("'{value}' is not an IP address")),
            ValType::Cidr => parse_cidr(value).map(|_| ()),
            ValType::PrivateCidr => {
                let (addr, _) = parse_cidr(value)?;
                if addr.is_private() {
                    Ok(())
                } else {
                    Err(format!("'{value}' is not an RFC 1918 subnet"))
                }
            }
            ValType::FwTarget => validate_fwtarget(value),
            ValType::Hostname => validate_hostname(value, false),
            ValType::DnsAddr => {
                if value.parse::<IpAddr>().is_ok() {
                    Ok(())
                } else {
                    validate_hostname(value, true)
                }
            }
            ValType::Port => match value.parse::<u16>() {
                Ok(port) if port > 0 => Ok(()),
                _ => Err(format!("'{value}' is not a port")),
            },
            ValType::IpOptPort => validate_ip_opt_port(value),
            ValType::Proto => match value {
                "tcp" | "udp" => Ok(()),
                _ => Err(format!("'{value}' is not a protocol")),
            },
            ValType::KeyMgmt => match value {
                "wpa-psk" | "wpa-eap" | "none" => Ok(()),
                _ => Err(format!("'{value}' is not a key management mode")),
            },
            ValType::NicState => match value {
                "up" | "down" | "disabled" => Ok(()),
                _ => Err(format!("'{value}' is not a nic state")),
            },
            ValType::WifiBand => match value {
                "2.4GHz" | "5GHz" => Ok(()),
                _ => Err(format!("'{value}' is not a wifi band")),
            },
            ValType::WifiWidth => match value {
                "20" | "40" | "80" => Ok(()),
                _ => Err(format!("'{value}' is not a channel width")),
            },
            ValType::TimeUnit => match value {
                "seconds" | "minutes" | "hours" | "days" => Ok(()),
                _ => Err(format!("'{value}' is not a time unit")),
            },
            ValType::TriBool => match value {
                "true" | "false" | "unknown" => Ok(()),
                _ => Err(format!("'{value}' is not a tribool")),
            },
            ValType::NodeId => validate_nodeid(value),
            ValType::SshAddr => validate_sshaddr(value),
            ValType::Text => validate_text(value),
            ValType::Null => Err("property accepts no value".to_owned()),
            ValType::List(inner) => {
                if value.trim().is_empty() {
                    return Err("empty list".to_owned());
                }
                for element in value.split(',') {
                    inner.validate(element.trim())?;
                }
                Ok(())
            }
        }
    }

    /// Canonical values each type accepts. Used at schema load to detect
    /// sibling key types whose accept-sets overlap.
    pub fn samples(&self) -> Vec<String> {
        match self {
            ValType::Int => vec!["42".into()],
            ValType::Bool => vec!["true".into()],
            ValType::Float => vec!["2.5".into()],
            ValType::Duration => vec!["90s".into()],
            ValType::Time => vec!["2021-06-01T00:00:00Z".into()],
            ValType::Uuid => vec!["b5b1d1e2-92ab-4bf6-9c26-23071475efc0".into()],
            ValType::MacAddr => vec!["00:40:54:00:00:01".into()],
            ValType::Nic => vec!["wlan0".into()],
            ValType::Ring => vec!["standard".into()],
            ValType::Ssid => vec!["examplewifi".into()],
            ValType::Passphrase => vec!["hunter2hunter2".into()],
            ValType::IpAddr => vec!["10.1.2.3".into()],
            ValType::Cidr => vec!["10.1.2.0/24".into()],
            ValType::PrivateCidr => vec!["192.168.9.0/24".into()],
            ValType::FwTarget => vec!["00:40:54:00:00:01/53".into()],
            ValType::Hostname => vec!["printer-7".into()],
            ValType::DnsAddr => vec!["ns1.example.com".into()],
            ValType::Port => vec!["8080".into()],
            ValType::IpOptPort => vec!["10.1.2.3:53".into()],
            ValType::Proto => vec!["tcp".into()],
            ValType::KeyMgmt => vec!["wpa-psk".into()],
            ValType::NicState => vec!["up".into()],
            ValType::WifiBand => vec!["5GHz".into()],
            ValType::WifiWidth => vec!["40".into()],
            ValType::TimeUnit => vec!["minutes".into()],
            ValType::TriBool => vec!["unknown".into()],
            ValType::NodeId => vec!["gateway-001122334455".into()],
            ValType::SshAddr => vec!["admin@10.1.2.3:22".into()],
            ValType::Text => vec!["free-text".into()],
            ValType::Null => Vec::new(),
            ValType::List(inner) => inner.samples(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown value type '{0}'")]
pub struct UnknownType(String);

impl FromStr for ValType {
    type Err = UnknownType;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        if let Some(inner) = source.strip_prefix("list:") {
            return Ok(ValType::List(Box::new(inner.parse()?)));
        }
        Ok(match source {
            "int" => ValType::Int,
            "bool" => ValType::Bool,
            "float" => ValType::Float,
            "duration" => ValType::Duration,
            "time" => ValType::Time,
            "uuid" => ValType::Uuid,
            "macaddr" => ValType::MacAddr,
            "nic" => ValType::Nic,
            "ring" => ValType::Ring,
            "ssid" => ValType::Ssid,
            "passphrase" => ValType::Passphrase,
            "ipaddr" => ValType::IpAddr,
            "cidr" => ValType::Cidr,
            "privatecidr" => ValType::PrivateCidr,
            "fwtarget" => ValType::FwTarget,
            "hostname" => ValType::Hostname,
            "dnsaddr" => ValType::DnsAddr,
            "port" => ValType::Port,
            "ipoptport" => ValType::IpOptPort,
            "proto" => ValType::Proto,
            "keymgmt" => ValType::KeyMgmt,
            "nicstate" => ValType::NicState,
            "wifiband" => ValType::WifiBand,
            "wifiwidth" => ValType::WifiWidth,
            "time_unit" => ValType::TimeUnit,
            "tribool" => ValType::TriBool,
            "nodeid" => ValType::NodeId,
            "sshaddr" => ValType::SshAddr,
            "text" => ValType::Text,
            "null" => ValType::Null,
            other => return Err(UnknownType(other.to_owned())),
        })
    }
}

fn is_printable_ascii(value: &str) -> bool {
    value.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

fn validate_macaddr(value: &str) -> Result<(), String> {
    let octets: Vec<&str> = value.split(':').collect();
    let ok = octets.len() == 6
        && octets.iter().all(|o| {
            o.len() == 2
                && o.chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        });
    if ok {
        Ok(())
    } else {
        Err(format!("'{value}' is not a lowercase MAC address"))
    }
}

fn validate_nic(value: &str) -> Result<(), String> {
    let ok = !value.is_empty()
        && value.len() <= 16
        && value.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && value.ends_with(|c: char| c.is_ascii_digit())
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(format!("'{value}' is not a nic name"))
    }
}

fn validate_ssid(value: &str) -> Result<(), String> {
    if value.is_empty() || value.len() > 32 {
        return Err(format!("SSID must be 1-32 bytes, got {}", value.len()));
    }
    if !is_printable_ascii(value) {
        return Err("SSID contains non-printable characters".to_owned());
    }
    Ok(())
}

fn validate_passphrase(value: &str) -> Result<(), String> {
    if value.len() == 64 {
        if value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(());
        }
        return Err("64-character passphrase must be hex".to_owned());
    }
    if (8..=63).contains(&value.len()) && is_printable_ascii(value) {
        return Ok(());
    }
    Err("passphrase must be 64 hex digits or 8-63 printable characters".to_owned())
}

pub(crate) fn parse_cidr(value: &str) -> Result<(Ipv4Addr, u32), String> {
    let (addr, prefix) = value
        .split_once('/')
        .ok_or_else(|| format!("'{value}' is not a CIDR"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| format!("'{value}' is not a CIDR"))?;
    let prefix: u32 = prefix
        .parse()
        .map_err(|_| format!("'{value}' is not a CIDR"))?;
    if prefix > 32 {
        return Err(format!("'{value}' has an illegal prefix length"));
    }
    Ok((addr, prefix))
}

fn validate_fwtarget(value: &str) -> Result<(), String> {
    let (mac, port) = match value.split_once('/') {
        Some((mac, port)) => (mac, Some(port)),
        None => (value, None),
    };
    validate_macaddr(mac)?;
    if let Some(port) = port {
        ValType::Port.validate(port)?;
    }
    Ok(())
}

fn validate_hostname(value: &str, allow_dots: bool) -> Result<(), String> {
    if value.eq_ignore_ascii_case("localhost") {
        return Err("'localhost' is reserved".to_owned());
    }
    if value.is_empty() || value.len() > 253 {
        return Err(format!("'{value}' is not a hostname"));
    }

    let labels: Vec<&str> = if allow_dots {
        value.split('.').collect()
    } else {
        vec![value]
    };

    for label in labels {
        let ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !ok {
            return Err(format!("'{value}' is not a valid hostname"));
        }
    }
    Ok(())
}

fn validate_ip_opt_port(value: &str) -> Result<(), String> {
    let (ip, port) = match value.rsplit_once(':') {
        // A lone IPv4 address also contains no colon; an IPv6 address
        // would, so only split when the tail parses as a port.
        Some((ip, port)) if port.parse::<u16>().is_ok() => (ip, Some(port)),
        _ => (value, None),
    };
    ip.parse::<Ipv4Addr>()
        .map_err(|_| format!("'{value}' is not ip[:port]"))?;
    if let Some(port) = port {
        ValType::Port.validate(port)?;
    }
    Ok(())
}

fn validate_nodeid(value: &str) -> Result<(), String> {
    let ok = !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
    if ok {
        Ok(())
    } else {
        Err(format!("'{value}' is not a node id"))
    }
}

fn validate_sshaddr(value: &str) -> Result<(), String> {
    let rest = match value.split_once('@') {
        Some((user, rest)) if !user.is_empty() => rest,
        Some(_) => return Err(format!("'{value}' is not an ssh address")),
        None => value,
    };
    validate_ip_opt_port(rest).map_err(|_| format!("'{value}' is not an ssh address"))
}

fn validate_text(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("empty value".to_owned());
    }
    if !is_printable_ascii(value) {
        return Err("value contains non-printable characters".to_owned());
    }
    Ok(())
}
