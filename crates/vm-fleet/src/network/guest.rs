/// Guest-facing network identity, baked into the base snapshot.
///
/// Identical for every VM: each one lives in its own namespace, so the
/// fixed addresses never collide. Changing any value here invalidates
/// existing snapshots.
pub struct GuestNetwork {
    /// TAP device name inside the namespace (must match the VM config).
    pub tap_name: &'static str,
    /// Guest MAC (locally administered, same for all VMs).
    pub guest_mac: &'static str,
    /// Guest IP inside the VM.
    pub guest_ip: &'static str,
    /// Gateway IP (the TAP device in the namespace).
    pub gateway_ip: &'static str,
    /// Netmask in dotted decimal, for kernel boot args.
    pub netmask: &'static str,
    /// CIDR prefix length, for `ip` commands.
    pub prefix_len: u8,
}

pub const GUEST_NETWORK: GuestNetwork = GuestNetwork {
    tap_name: "vm0-tap",
    guest_mac: "02:00:00:00:00:01",
    guest_ip: "192.168.241.2",
    gateway_ip: "192.168.241.1",
    netmask: "255.255.255.248",
    prefix_len: 29,
};

/// Kernel boot args configuring the guest NIC on a cold boot.
pub fn generate_guest_boot_args() -> String {
    format!(
        "ip={}::{}:{}:vm0-guest:eth0:off",
        GUEST_NETWORK.guest_ip, GUEST_NETWORK.gateway_ip, GUEST_NETWORK.netmask,
    )
}
