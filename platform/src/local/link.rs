//! Link-layer device management through iproute2.
//!
//! Builds `ip` command arguments for creating tap devices and bridges and
//! runs them synchronously. Every function here must be called from inside
//! the target namespace (see [`super::netns::Namespace::run`]).

use std::process::Command;

use serde::Deserialize;
use thiserror::Error;

/// Errors from `ip` invocations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// `ip` could not be executed.
    #[error("failed to run ip: {0}")]
    Spawn(#[from] std::io::Error),

    /// `ip` returned non-zero exit code.
    #[error("`ip {args}` exited with {code}: {stderr}")]
    Failed {
        /// Arguments passed to ip.
        args: String,
        /// Exit code.
        code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// The named link exists but is not a bridge.
    #[error("{name} is not a bridge (kind: {kind})")]
    NotBridge {
        /// Link name.
        name: String,
        /// Kind reported by the kernel.
        kind: String,
    },

    /// `ip -json` output could not be parsed.
    #[error("unexpected ip output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A tap device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunTap {
    /// Interface name.
    pub name: String,
}

/// A bridge device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    /// Interface name.
    pub name: String,
}

/// `ip tuntap add dev <name> mode tap`
pub fn tap_add_args(name: &str) -> Vec<String> {
    vec![
        "tuntap".into(),
        "add".into(),
        "dev".into(),
        name.into(),
        "mode".into(),
        "tap".into(),
    ]
}

/// `ip link set dev <name> up`
pub fn link_up_args(name: &str) -> Vec<String> {
    vec![
        "link".into(),
        "set".into(),
        "dev".into(),
        name.into(),
        "up".into(),
    ]
}

/// `ip -details -json link show dev <name>`
pub fn link_show_args(name: &str) -> Vec<String> {
    vec![
        "-details".into(),
        "-json".into(),
        "link".into(),
        "show".into(),
        "dev".into(),
        name.into(),
    ]
}

/// `ip link set dev <link> master <bridge>`
pub fn set_master_args(link: &str, bridge: &str) -> Vec<String> {
    vec![
        "link".into(),
        "set".into(),
        "dev".into(),
        link.into(),
        "master".into(),
        bridge.into(),
    ]
}

/// `ip link add name <name> type bridge`
pub fn bridge_add_args(name: &str) -> Vec<String> {
    vec![
        "link".into(),
        "add".into(),
        "name".into(),
        name.into(),
        "type".into(),
        "bridge".into(),
    ]
}

/// `ip addr add <cidr> dev <name>`
pub fn addr_add_args(name: &str, cidr: &str) -> Vec<String> {
    vec![
        "addr".into(),
        "add".into(),
        cidr.into(),
        "dev".into(),
        name.into(),
    ]
}

/// `ip link del dev <name>`
pub fn link_del_args(name: &str) -> Vec<String> {
    vec!["link".into(), "del".into(), "dev".into(), name.into()]
}

/// Run `ip` with `args`, returning stdout.
fn ip(args: &[String]) -> Result<String, LinkError> {
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(LinkError::Failed {
            args: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Create a tap device called `name`.
pub fn add_tap(name: &str) -> Result<TunTap, LinkError> {
    ip(&tap_add_args(name))?;
    Ok(TunTap { name: name.into() })
}

/// Bring a link up.
pub fn set_up(name: &str) -> Result<(), LinkError> {
    ip(&link_up_args(name)).map(drop)
}

/// Look a bridge up by name.
pub fn bridge_by_name(name: &str) -> Result<Bridge, LinkError> {
    let json = ip(&link_show_args(name))?;
    parse_bridge(name, &json)
}

/// Enslave `link` to `bridge`.
pub fn set_master(link: &TunTap, bridge: &Bridge) -> Result<(), LinkError> {
    ip(&set_master_args(&link.name, &bridge.name)).map(drop)
}

/// Create a bridge, give it `cidr` and bring it up.
pub fn add_bridge(name: &str, cidr: &str) -> Result<Bridge, LinkError> {
    ip(&bridge_add_args(name))?;
    ip(&addr_add_args(name, cidr))?;
    set_up(name)?;
    Ok(Bridge { name: name.into() })
}

/// Delete a link.
pub fn delete(name: &str) -> Result<(), LinkError> {
    ip(&link_del_args(name)).map(drop)
}

#[derive(Debug, Deserialize)]
struct LinkShow {
    ifname: String,
    #[serde(default)]
    linkinfo: Option<LinkInfo>,
}

#[derive(Debug, Deserialize)]
struct LinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

/// Parse `ip -details -json link show` output and check the link is a bridge.
fn parse_bridge(name: &str, json: &str) -> Result<Bridge, LinkError> {
    let links: Vec<LinkShow> = serde_json::from_str(json)?;
    let link = links
        .into_iter()
        .find(|l| l.ifname == name)
        .ok_or_else(|| LinkError::NotBridge {
            name: name.into(),
            kind: "missing".into(),
        })?;

    match link.linkinfo.and_then(|info| info.info_kind) {
        Some(kind) if kind == "bridge" => Ok(Bridge { name: link.ifname }),
        kind => Err(LinkError::NotBridge {
            name: name.into(),
            kind: kind.unwrap_or_else(|| "none".into()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_add_builds_ip_args() {
        assert_eq!(
            tap_add_args("tap0"),
            vec!["tuntap", "add", "dev", "tap0", "mode", "tap"]
        );
    }

    #[test]
    fn set_master_builds_ip_args() {
        assert_eq!(
            set_master_args("tap0", "br0"),
            vec!["link", "set", "dev", "tap0", "master", "br0"]
        );
    }

    #[test]
    fn addr_add_builds_ip_args() {
        assert_eq!(
            addr_add_args("br0", "10.0.0.1/24"),
            vec!["addr", "add", "10.0.0.1/24", "dev", "br0"]
        );
    }

    #[test]
    fn parse_bridge_accepts_bridge_kind() {
        let json = r#"[{"ifindex":3,"ifname":"br0","flags":["UP"],"linkinfo":{"info_kind":"bridge","info_data":{}}}]"#;
        assert_eq!(
            parse_bridge("br0", json).unwrap(),
            Bridge { name: "br0".into() }
        );
    }

    #[test]
    fn parse_bridge_rejects_other_kinds() {
        let json = r#"[{"ifindex":4,"ifname":"tap0","linkinfo":{"info_kind":"tun"}}]"#;
        match parse_bridge("tap0", json) {
            Err(LinkError::NotBridge { kind, .. }) => assert_eq!(kind, "tun"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_bridge_rejects_plain_links() {
        let json = r#"[{"ifindex":1,"ifname":"lo"}]"#;
        assert!(matches!(
            parse_bridge("lo", json),
            Err(LinkError::NotBridge { .. })
        ));
    }

    #[test]
    fn parse_bridge_rejects_garbage() {
        assert!(matches!(
            parse_bridge("br0", "not json"),
            Err(LinkError::Parse(_))
        ));
    }
}
