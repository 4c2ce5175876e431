//! Per-instance guest networking: a tap device plus NAT rules.
//!
//! Everything installed is tagged with the instance id and owned by a
//! [`NetworkGuard`]; dropping the guard removes it again.

use std::net::Ipv4Addr;
use std::process::Command;

use rand::Rng;
use uuid::Uuid;

use firebox_core::error::{BoxError, Result};

/// Linux interface names are limited to 15 bytes.
const TAP_PREFIX: &str = "fbx";

/// Runs host networking tools.
pub trait HostCommand: Send + Sync {
    /// Run `program` with `args`, returning stdout, or stderr on failure.
    fn run(&self, program: &str, args: &[String]) -> std::result::Result<String, String>;
}

/// Runs tools as real host processes.
pub struct SystemCommand;

impl HostCommand for SystemCommand {
    fn run(&self, program: &str, args: &[String]) -> std::result::Result<String, String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| format!("failed to run {}: {}", program, e))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

/// Addressing for one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNetwork {
    pub instance_id: Uuid,
    pub tap_device: String,
    pub guest_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub guest_mac: String,
}

impl GuestNetwork {
    /// Allocate addressing for a new instance.
    ///
    /// Without `fixed_ip` the guest gets a random host address (2..=254) of
    /// a random /24 inside 172.16.0.0/12. The gateway is `.1` of the same /24.
    pub fn allocate(fixed_ip: Option<Ipv4Addr>) -> Result<Self> {
        let instance_id = Uuid::new_v4();
        let guest_ip = fixed_ip.unwrap_or_else(random_guest_ip);
        let [a, b, c, _] = guest_ip.octets();
        let gateway_ip = Ipv4Addr::new(a, b, c, 1);
        if gateway_ip == guest_ip {
            return Err(BoxError::NetworkSetupError(format!(
                "Guest address {} collides with its gateway",
                guest_ip
            )));
        }
        Ok(Self {
            tap_device: tap_name(&instance_id),
            guest_mac: guest_mac(guest_ip),
            instance_id,
            guest_ip,
            gateway_ip,
        })
    }

    /// Comment attached to every firewall rule of this instance.
    pub fn rule_tag(&self) -> String {
        format!("firebox-{}", self.instance_id)
    }
}

fn tap_name(id: &Uuid) -> String {
    let hex = id.simple().to_string();
    format!("{}{}", TAP_PREFIX, &hex[..8])
}

fn random_guest_ip() -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    Ipv4Addr::new(
        172,
        rng.gen_range(16..=31),
        rng.gen_range(0..=255),
        rng.gen_range(2..=254),
    )
}

/// Locally administered MAC derived from the guest address.
pub fn guest_mac(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("06:00:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d)
}

/// Interface of the default route, from `ip route show default` output.
pub fn parse_default_route(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        if words.next() != Some("default") {
            return None;
        }
        let mut words = words.skip_while(|w| *w != "dev");
        words.next()?;
        words.next().map(str::to_string)
    })
}

/// Host uplink: the default route's interface.
pub fn detect_uplink(host: &dyn HostCommand) -> Result<String> {
    let output = host
        .run("ip", &strings(&["route", "show", "default"]))
        .map_err(BoxError::NetworkSetupError)?;
    parse_default_route(&output).ok_or_else(|| {
        BoxError::NetworkSetupError(
            "No default route found; set FIREBOX_UPLINK to the uplink interface".to_string(),
        )
    })
}

/// One iptables rule, independent of whether it is being added or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl FirewallRule {
    /// iptables arguments; `action` is `-A` or `-D`.
    pub fn args(&self, action: &str, tag: &str) -> Vec<String> {
        let mut args = strings(&["-t", self.table, action, self.chain]);
        args.extend(self.spec.iter().cloned());
        args.extend(strings(&["-m", "comment", "--comment", tag]));
        args
    }
}

/// Rules giving the guest outbound NAT and inbound forwarding, in install order.
pub fn firewall_rules(net: &GuestNetwork, uplink: &str) -> Vec<FirewallRule> {
    let guest = net.guest_ip.to_string();
    let tap = net.tap_device.as_str();
    vec![
        FirewallRule {
            table: "nat",
            chain: "POSTROUTING",
            spec: strings(&["-o", uplink, "-j", "MASQUERADE"]),
        },
        FirewallRule {
            table: "filter",
            chain: "FORWARD",
            spec: strings(&[
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ]),
        },
        FirewallRule {
            table: "filter",
            chain: "FORWARD",
            spec: strings(&["-i", tap, "-o", uplink, "-j", "ACCEPT"]),
        },
        FirewallRule {
            table: "nat",
            chain: "PREROUTING",
            spec: strings(&["-i", uplink, "-j", "DNAT", "--to-destination", guest.as_str()]),
        },
    ]
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Installed tap device and firewall rules, removed on drop.
pub struct NetworkGuard<'a> {
    host: &'a dyn HostCommand,
    network: GuestNetwork,
    tap_created: bool,
    installed: Vec<FirewallRule>,
}

impl<'a> NetworkGuard<'a> {
    /// Create the tap device and install the rules.
    ///
    /// # Errors
    ///
    /// Returns `NetworkSetupError` after removing whatever was installed.
    pub fn setup(host: &'a dyn HostCommand, network: GuestNetwork, uplink: &str) -> Result<Self> {
        let mut guard = Self {
            host,
            network,
            tap_created: false,
            installed: Vec::new(),
        };
        // Dropping `guard` on error undoes the partial setup.
        guard.create_tap()?;
        guard.install_rules(uplink)?;

        tracing::info!(
            tap = %guard.network.tap_device,
            guest_ip = %guard.network.guest_ip,
            uplink = %uplink,
            rules = guard.installed.len(),
            "Guest network ready"
        );
        Ok(guard)
    }

    pub fn network(&self) -> &GuestNetwork {
        &self.network
    }

    fn create_tap(&mut self) -> Result<()> {
        let tap = self.network.tap_device.clone();
        self.ip(&["tuntap", "add", &tap, "mode", "tap"])?;
        self.tap_created = true;
        self.ip(&[
            "addr",
            "add",
            &format!("{}/24", self.network.gateway_ip),
            "dev",
            &tap,
        ])?;
        self.ip(&["link", "set", &tap, "up"])
    }

    fn install_rules(&mut self, uplink: &str) -> Result<()> {
        let tag = self.network.rule_tag();
        for rule in firewall_rules(&self.network, uplink) {
            self.host
                .run("iptables", &rule.args("-A", &tag))
                .map_err(|e| {
                    BoxError::NetworkSetupError(format!(
                        "Failed to add {} {} rule: {}",
                        rule.table, rule.chain, e
                    ))
                })?;
            self.installed.push(rule);
        }
        Ok(())
    }

    fn ip(&self, args: &[&str]) -> Result<()> {
        self.host
            .run("ip", &strings(args))
            .map(|_| ())
            .map_err(|e| BoxError::NetworkSetupError(format!("ip {}: {}", args.join(" "), e)))
    }
}

impl Drop for NetworkGuard<'_> {
    fn drop(&mut self) {
        let tag = self.network.rule_tag();
        while let Some(rule) = self.installed.pop() {
            if let Err(e) = self.host.run("iptables", &rule.args("-D", &tag)) {
                tracing::warn!(chain = rule.chain, error = %e, "Failed to remove firewall rule");
            }
        }
        if self.tap_created {
            let args = strings(&["link", "del", &self.network.tap_device]);
            if let Err(e) = self.host.run("ip", &args) {
                tracing::warn!(tap = %self.network.tap_device, error = %e, "Failed to remove tap device");
            }
            self.tap_created = false;
        }
        tracing::debug!(tap = %self.network.tap_device, "Guest network torn down");
    }
}
