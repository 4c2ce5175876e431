//! Kernel command line.

use std::net::Ipv4Addr;

/// Arguments every guest boots with.
pub const BASE_BOOT_ARGS: &str = "console=ttyS0 noapic reboot=k panic=1 pci=off \
random.trust_cpu=on i8042.noaux i8042.nomux i8042.nopnp i8042.dumbkbd tsc=reliable \
ipv6.disable=1";

/// Inputs to the kernel command line.
#[derive(Debug, Clone)]
pub struct BootArgs {
    pub loglevel: u8,
    pub guest_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    /// Generated init found inside the image, if any
    pub init: Option<String>,
    /// Appended verbatim
    pub extra: String,
}

impl BootArgs {
    /// Render the command line: baseline, loglevel, static addressing,
    /// `init=` and then the extra arguments.
    pub fn render(&self) -> String {
        let mut args = vec![
            BASE_BOOT_ARGS.to_string(),
            format!("loglevel={}", self.loglevel),
            format!(
                "ip={}::{}:255.255.255.0::eth0:off",
                self.guest_ip, self.gateway_ip
            ),
        ];
        if let Some(init) = &self.init {
            args.push(format!("init={}", init));
        }
        let extra = self.extra.trim();
        if !extra.is_empty() {
            args.push(extra.to_string());
        }
        args.join(" ")
    }
}
