//! Pre-warmed pool of network namespaces for Firecracker VMs.
//!
//! Every VM boots with the same fixed guest network (see
//! [`GUEST_NETWORK`]); isolation comes from giving each VM its own
//! namespace, connected to the host by a veth pair with a unique /30.
//!
//! ```text
//! ┌─────────────────────┐  ┌─────────────────────┐
//! │   vm0-ns-00-00      │  │   vm0-ns-00-01      │
//! │ ┌─────────────────┐ │  │ ┌─────────────────┐ │
//! │ │       VM        │ │  │ │       VM        │ │
//! │ │  192.168.241.2  │ │  │ │  192.168.241.2  │ │  ← same fixed IP
//! │ └────────┬────────┘ │  │ └────────┬────────┘ │
//! │     vm0-tap (gw)    │  │     vm0-tap (gw)    │
//! │          │ veth0    │  │          │ veth0    │
//! │      10.200.0.2     │  │      10.200.0.6     │  ← unique /30
//! └──────────┼──────────┘  └──────────┼──────────┘
//!     vm0-ve-00-00            vm0-ve-00-01
//!      10.200.0.1              10.200.0.5
//! ```
//!
//! Ownership is coordinated through the on-disk [`NetnsRegistry`]: each
//! runner claims an index under the registry lock, records every
//! namespace it creates, and prunes what dead runners left behind. No
//! `ip`/`iptables` command ever runs while the lock is held.

use std::collections::VecDeque;

use tracing::{error, info, warn};

use crate::command::{Privilege, exec_command, exec_command_ignore_errors, sudo};
use crate::error::{FleetError, Result};
use crate::registry::netns::{
    MAX_NAMESPACES, NamespaceEntry, NetnsRegistry, hex_index,
};

use super::GUEST_NETWORK;

/// Namespace name prefix: `vm0-ns-{runnerIdx}-{nsIdx}`.
pub const NS_PREFIX: &str = "vm0-ns-";
/// Host-side veth device prefix: `vm0-ve-{runnerIdx}-{nsIdx}`.
const HOST_PREFIX: &str = "vm0-ve-";
/// Peer-side device name inside every namespace.
const PEER_DEVICE: &str = "veth0";
/// First two octets shared by all veth addresses.
const IP_PREFIX: &str = "10.200";

/// A pooled network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct PooledNetns {
    /// Namespace name (e.g. `vm0-ns-00-0a`).
    pub name: String,
    /// Host-side veth device (e.g. `vm0-ve-00-0a`).
    pub host_device: String,
}

pub struct NetnsPoolConfig {
    /// Runner name recorded in the registry (diagnostics only).
    pub runner_name: String,
    /// Number of namespaces to pre-create.
    pub size: usize,
    /// When set, tcp/80+443 from each namespace is redirected to this port.
    pub proxy_port: Option<u16>,
    /// Directory holding `netns-registry.json` and its lock.
    pub runtime_dir: std::path::PathBuf,
}

// ---------------------------------------------------------------------------
// Naming & IP plan (pure functions)
// ---------------------------------------------------------------------------

fn make_ns_name(runner_idx: &str, ns_idx: &str) -> String {
    format!("{NS_PREFIX}{runner_idx}-{ns_idx}")
}

fn make_host_device(runner_idx: &str, ns_idx: &str) -> String {
    format!("{HOST_PREFIX}{runner_idx}-{ns_idx}")
}

/// Deterministic /30 for a `(runner, namespace)` pair, so a reboot
/// reproduces the same plan:
///
/// ```text
///   octet3      = runner_idx × 4 + ns_idx / 64
///   octet4_base = (ns_idx % 64) × 4
///   host_ip     = 10.200.{octet3}.{octet4_base + 1}
///   ns_ip       = 10.200.{octet3}.{octet4_base + 2}
/// ```
///
/// 64 runners × 256 namespaces × 4 addresses = exactly `10.200.0.0/16`.
fn veth_ip_pair(runner_idx: u32, ns_idx: u32) -> (String, String) {
    let octet3 = runner_idx * 4 + ns_idx / 64;
    let octet4_base = (ns_idx % 64) * 4;
    let host_ip = format!("{IP_PREFIX}.{octet3}.{}", octet4_base + 1);
    let ns_ip = format!("{IP_PREFIX}.{octet3}.{}", octet4_base + 2);
    (host_ip, ns_ip)
}

/// Parse `vm0-ns-{rr}-{nn}` into its two hex indices.
///
/// Total over arbitrary input: anything that is not exactly the pool's
/// naming scheme returns `None`.
pub(crate) fn parse_ns_name(name: &str) -> Option<(&str, &str)> {
    let suffix = name.strip_prefix(NS_PREFIX)?;
    let (runner_idx, ns_idx) = suffix.split_once('-')?;
    if !is_hex2(runner_idx) || !is_hex2(ns_idx) {
        return None;
    }
    Some((runner_idx, ns_idx))
}

fn is_hex2(s: &str) -> bool {
    s.len() == 2
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// ---------------------------------------------------------------------------
// Kernel operations
// ---------------------------------------------------------------------------

/// Whether a host-side link named `device` exists.
pub(crate) async fn tap_exists(device: &str) -> bool {
    exec_command(&format!("ip link show {device}"), Privilege::User)
        .await
        .is_ok()
}

/// Build one namespace: netns, TAP with the fixed gateway, veth pair,
/// routes, NAT. Host-side iptables rules carry the namespace name as a
/// comment so they can be deleted by name later.
async fn build_namespace(
    name: &str,
    host_device: &str,
    host_ip: &str,
    ns_ip: &str,
    proxy_port: Option<u16>,
    default_iface: &str,
) -> Result<()> {
    let gw = GUEST_NETWORK.gateway_ip;
    let prefix = GUEST_NETWORK.prefix_len;
    let tap = GUEST_NETWORK.tap_name;

    // Namespace with the fixed TAP acting as the guest's gateway.
    sudo!("ip netns add {name}")?;
    sudo!("ip netns exec {name} ip tuntap add {tap} mode tap")?;
    sudo!("ip netns exec {name} ip addr add {gw}/{prefix} dev {tap}")?;
    sudo!("ip netns exec {name} ip link set {tap} up")?;
    sudo!("ip netns exec {name} ip link set lo up")?;

    // Veth pair bridging namespace and host, one /30 per namespace.
    sudo!("ip link add {host_device} type veth peer name {PEER_DEVICE} netns {name}")?;
    sudo!("ip netns exec {name} ip addr add {ns_ip}/30 dev {PEER_DEVICE}")?;
    sudo!("ip netns exec {name} ip link set {PEER_DEVICE} up")?;
    sudo!("ip addr add {host_ip}/30 dev {host_device}")?;
    sudo!("ip link set {host_device} up")?;

    // Routing out of the namespace, NAT for the guest subnet.
    sudo!("ip netns exec {name} ip route add default via {host_ip}")?;
    sudo!(
        "ip netns exec {name} iptables -t nat -A POSTROUTING -s {gw}/{prefix} -o {PEER_DEVICE} -j MASQUERADE"
    )?;
    sudo!("ip netns exec {name} sysctl -w net.ipv4.ip_forward=1")?;

    // Host side: NAT to the default interface plus stateful forwarding,
    // every rule tagged with the namespace name.
    sudo!(
        "iptables -t nat -A POSTROUTING -s {ns_ip}/30 -o {default_iface} -j MASQUERADE -m comment --comment \"{name}\""
    )?;
    sudo!(
        "iptables -A FORWARD -i {host_device} -o {default_iface} -j ACCEPT -m comment --comment \"{name}\""
    )?;
    sudo!(
        "iptables -A FORWARD -i {default_iface} -o {host_device} -m state --state RELATED,ESTABLISHED -j ACCEPT -m comment --comment \"{name}\""
    )?;

    if let Some(port) = proxy_port {
        for dport in [80, 443] {
            sudo!(
                "iptables -t nat -A PREROUTING -s {ns_ip}/30 -p tcp --dport {dport} -j REDIRECT --to-port {port} -m comment --comment \"{name}\""
            )?;
        }
    }

    Ok(())
}

async fn default_interface() -> Result<String> {
    let route = exec_command("ip route get 8.8.8.8", Privilege::User).await?;
    route
        .split_whitespace()
        .skip_while(|&w| w != "dev")
        .nth(1)
        .map(String::from)
        .ok_or_else(|| FleetError::Network(format!("no default interface in: {route}")))
}

/// Delete every iptables rule in `table` whose serialized form contains
/// `comment`. Replaying `-A` lines as `-D` makes this idempotent even if
/// some rules are already gone.
async fn delete_iptables_by_comment_from(table: &str, comment: &str) {
    let listed = exec_command(
        &format!("iptables-save -t {table} | grep -F -- \"{comment}\" || true"),
        Privilege::Sudo,
    )
    .await;
    let Ok(rules) = listed else {
        return;
    };
    // Sequential: the xtables lock serializes same-table writes anyway.
    for line in rules.lines().filter(|line| line.starts_with("-A ")) {
        let rule = line.replacen("-A ", "-D ", 1);
        exec_command_ignore_errors(&format!("iptables -t {table} {rule}"), Privilege::Sudo).await;
    }
}

pub(crate) async fn delete_iptables_by_comment(comment: &str) {
    let ((), ()) = tokio::join!(
        delete_iptables_by_comment_from("nat", comment),
        delete_iptables_by_comment_from("filter", comment),
    );
}

/// Tear down a namespace's kernel state: tagged iptables rules, the veth
/// pair, the namespace itself.
async fn delete_namespace_resources(ns_name: &str, host_device: &str) {
    delete_iptables_by_comment(ns_name).await;
    let link_del_cmd = format!("ip link del {host_device}");
    let netns_del_cmd = format!("ip netns del {ns_name}");
    tokio::join!(
        exec_command_ignore_errors(&link_del_cmd, Privilege::Sudo),
        exec_command_ignore_errors(&netns_del_cmd, Privilege::Sudo),
    );
    info!(name = %ns_name, "namespace deleted");
}

/// Delete the kernel artefacts of every dead runner, then prune their
/// registry entries.
///
/// Lock discipline: the dead set is computed under the lock, kernel
/// deletion happens with the lock released, and the final prune re-checks
/// PID liveness (PIDs can be reused while we were deleting).
pub(crate) async fn reap_dead_runners(registry: &NetnsRegistry) -> Vec<u32> {
    let dead = match registry.dead_runners().await {
        Ok(dead) => dead,
        Err(e) => {
            error!(error = %e, "failed to scan for dead runners");
            return Vec::new();
        }
    };
    if dead.is_empty() {
        return Vec::new();
    }

    info!(count = dead.len(), "found dead runner entries, cleaning up");
    let mut set = tokio::task::JoinSet::new();
    for (runner_index, entry) in &dead {
        let runner_key = hex_index(*runner_index);
        for (ns_key, ns) in &entry.namespaces {
            let ns_name = make_ns_name(&runner_key, ns_key);
            let veth = ns.veth_host.clone();
            set.spawn(async move {
                delete_namespace_resources(&ns_name, &veth).await;
            });
        }
    }
    while set.join_next().await.is_some() {}

    let indices: Vec<u32> = dead.iter().map(|(index, _)| *index).collect();
    match registry.remove_dead_runners(&indices).await {
        Ok(removed) => removed,
        Err(e) => {
            error!(error = %e, "failed to prune dead runner entries");
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// NetnsPool
// ---------------------------------------------------------------------------

/// Runner-scoped pool of pre-warmed namespaces.
pub struct NetnsPool {
    active: bool,
    queue: VecDeque<PooledNetns>,
    next_ns_index: u32,
    runner_index: u32,
    proxy_port: Option<u16>,
    default_iface: String,
    registry: NetnsRegistry,
}

impl NetnsPool {
    /// Initialize the pool: prune dead runners, claim a runner index, and
    /// pre-warm `config.size` namespaces in parallel.
    ///
    /// A single namespace failing to build is logged and skipped — the
    /// pool stays functional with whatever it managed to create.
    pub async fn create(config: NetnsPoolConfig) -> Result<Self> {
        let registry = NetnsRegistry::new(&config.runtime_dir);

        reap_dead_runners(&registry).await;

        let runner_index = registry.register_runner(&config.runner_name).await?;
        info!(
            index = runner_index,
            size = config.size,
            "initializing namespace pool"
        );

        // Host-level forwarding, needed once per host (idempotent).
        sudo!("sysctl -w net.ipv4.ip_forward=1")?;

        let default_iface = default_interface().await?;

        let mut pool = Self {
            active: true,
            queue: VecDeque::with_capacity(config.size),
            next_ns_index: 0,
            runner_index,
            proxy_port: config.proxy_port,
            default_iface,
            registry,
        };

        if config.size > 0 {
            let mut set = tokio::task::JoinSet::new();
            for _ in 0..config.size {
                let ns_index = pool.next_ns_index;
                pool.next_ns_index += 1;
                set.spawn(create_single_namespace(
                    pool.registry.clone(),
                    pool.runner_index,
                    ns_index,
                    pool.proxy_port,
                    pool.default_iface.clone(),
                ));
            }
            while let Some(result) = set.join_next().await {
                match result {
                    Ok(Ok(ns)) => pool.queue.push_back(ns),
                    Ok(Err(e)) => error!(error = %e, "failed to create namespace"),
                    Err(e) => error!(error = %e, "namespace creation task panicked"),
                }
            }
        }

        if pool.queue.len() < config.size {
            warn!(
                requested = config.size,
                created = pool.queue.len(),
                "pool pre-warm finished short"
            );
        }
        info!(available = pool.queue.len(), "namespace pool ready");
        Ok(pool)
    }

    /// Take a namespace from the pool, creating one on demand when empty.
    pub async fn acquire(&mut self) -> Result<PooledNetns> {
        if let Some(ns) = self.queue.pop_front() {
            info!(name = %ns.name, remaining = self.queue.len(), "acquired namespace");
            return Ok(ns);
        }

        info!("pool exhausted, creating namespace on demand");
        let ns_index = self.next_ns_index;
        if ns_index >= MAX_NAMESPACES {
            return Err(FleetError::NamespaceLimit {
                max: MAX_NAMESPACES,
            });
        }
        self.next_ns_index += 1;
        create_single_namespace(
            self.registry.clone(),
            self.runner_index,
            ns_index,
            self.proxy_port,
            self.default_iface.clone(),
        )
        .await
    }

    /// Return a namespace.
    ///
    /// After teardown the namespace is deleted instead of pooled. A
    /// namespace that does not carry this runner's prefix is deleted too —
    /// pooling it would hand out someone else's /30. Duplicate releases
    /// are ignored.
    pub async fn release(&mut self, ns: PooledNetns) -> Result<()> {
        let owned = parse_ns_name(&ns.name)
            .is_some_and(|(runner_idx, _)| runner_idx == hex_index(self.runner_index));

        if !self.active || !owned {
            delete_namespace_resources(&ns.name, &ns.host_device).await;
            if owned && let Some((_, ns_idx)) = parse_ns_name(&ns.name)
                && let Ok(ns_index) = u32::from_str_radix(ns_idx, 16)
            {
                let _ = self.registry.remove_namespace(self.runner_index, ns_index).await;
            }
            return Ok(());
        }

        if self.queue.iter().any(|pooled| pooled.name == ns.name) {
            info!(name = %ns.name, "namespace already pooled, ignoring release");
            return Ok(());
        }

        info!(name = %ns.name, available = self.queue.len() + 1, "namespace released");
        self.queue.push_back(ns);
        Ok(())
    }

    /// Tear the pool down: delete all pooled namespaces in parallel, then
    /// drop this runner's registry entry under a single lock.
    ///
    /// Namespaces still acquired are not touched here; the next runner's
    /// reap pass collects them.
    pub async fn cleanup(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        info!(count = self.queue.len(), "cleaning up namespace pool");
        let mut set = tokio::task::JoinSet::new();
        for ns in self.queue.drain(..) {
            set.spawn(async move {
                delete_namespace_resources(&ns.name, &ns.host_device).await;
            });
        }
        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "namespace deletion task panicked");
            }
        }

        self.registry.remove_runner(self.runner_index).await?;
        info!("namespace pool cleanup complete");
        Ok(())
    }

    /// The registry index claimed by this pool.
    pub fn runner_index(&self) -> u32 {
        self.runner_index
    }
}

impl Drop for NetnsPool {
    fn drop(&mut self) {
        if self.active {
            warn!(
                queued = self.queue.len(),
                "NetnsPool dropped without cleanup()"
            );
        }
    }
}

/// Build one namespace and record it in the registry.
///
/// Free function so it can run on a `JoinSet`. Kernel objects are created
/// first and the registry write happens after, under its own lock; if the
/// write fails the kernel objects are rolled back.
async fn create_single_namespace(
    registry: NetnsRegistry,
    runner_index: u32,
    ns_index: u32,
    proxy_port: Option<u16>,
    default_iface: String,
) -> Result<PooledNetns> {
    if ns_index >= MAX_NAMESPACES {
        return Err(FleetError::NamespaceLimit {
            max: MAX_NAMESPACES,
        });
    }

    let runner_key = hex_index(runner_index);
    let ns_key = hex_index(ns_index);
    let name = make_ns_name(&runner_key, &ns_key);
    let host_device = make_host_device(&runner_key, &ns_key);
    let (host_ip, ns_ip) = veth_ip_pair(runner_index, ns_index);

    info!(name = %name, "creating namespace");
    if let Err(e) = build_namespace(
        &name,
        &host_device,
        &host_ip,
        &ns_ip,
        proxy_port,
        &default_iface,
    )
    .await
    {
        error!(name = %name, error = %e, "namespace build failed, rolling back");
        delete_namespace_resources(&name, &host_device).await;
        return Err(e);
    }

    let entry = NamespaceEntry {
        veth_host: host_device.clone(),
        host_ip,
        ns_ip,
    };
    if let Err(e) = registry.record_namespace(runner_index, ns_index, entry).await {
        error!(name = %name, error = %e, "registry record failed, rolling back");
        delete_namespace_resources(&name, &host_device).await;
        return Err(e);
    }

    info!(name = %name, "namespace created");
    Ok(PooledNetns { name, host_device })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ns_and_device_names_fit_ifnamsiz() {
        // Kernel interface names cap at 15 chars.
        let name = make_ns_name("3f", "ff");
        let device = make_host_device("3f", "ff");
        assert_eq!(name, "vm0-ns-3f-ff");
        assert_eq!(device, "vm0-ve-3f-ff");
        assert!(name.len() <= 15);
        assert!(device.len() <= 15);
    }

    #[test]
    fn veth_plan_first_and_second_namespace() {
        assert_eq!(
            veth_ip_pair(0, 0),
            ("10.200.0.1".to_string(), "10.200.0.2".to_string())
        );
        assert_eq!(
            veth_ip_pair(0, 1),
            ("10.200.0.5".to_string(), "10.200.0.6".to_string())
        );
    }

    #[test]
    fn veth_plan_crosses_octet3_at_64_namespaces() {
        assert_eq!(
            veth_ip_pair(0, 64),
            ("10.200.1.1".to_string(), "10.200.1.2".to_string())
        );
    }

    #[test]
    fn veth_plan_second_runner_starts_at_octet3_4() {
        assert_eq!(
            veth_ip_pair(1, 0),
            ("10.200.4.1".to_string(), "10.200.4.2".to_string())
        );
    }

    #[test]
    fn veth_plan_max_indices_stay_in_16() {
        assert_eq!(
            veth_ip_pair(63, 255),
            ("10.200.255.253".to_string(), "10.200.255.254".to_string())
        );
    }

    #[test]
    fn veth_plan_is_pairwise_disjoint_across_all_runners() {
        let mut seen = std::collections::HashSet::new();
        for runner in 0..crate::registry::netns::MAX_RUNNERS {
            for ns in 0..MAX_NAMESPACES {
                let (host, peer) = veth_ip_pair(runner, ns);
                assert!(seen.insert(host.clone()), "dup host IP {host}");
                assert!(seen.insert(peer.clone()), "dup ns IP {peer}");
            }
        }
        // 64 × 256 × 2 addresses actually assigned
        assert_eq!(seen.len(), 32768);
    }

    #[test]
    fn veth_plan_slash30_alignment() {
        // Subnet base divisible by 4; host = base+1, ns = base+2.
        for runner in [0, 1, 31, 63] {
            for ns in [0, 1, 63, 64, 127, 255] {
                let (host, peer) = veth_ip_pair(runner, ns);
                let host_o4: u32 = host.rsplit('.').next().unwrap().parse().unwrap();
                let peer_o4: u32 = peer.rsplit('.').next().unwrap().parse().unwrap();
                assert_eq!(host_o4 % 4, 1, "runner={runner} ns={ns}");
                assert_eq!(peer_o4, host_o4 + 1);
            }
        }
    }

    #[test]
    fn parse_ns_name_accepts_pool_names() {
        assert_eq!(parse_ns_name("vm0-ns-00-0a"), Some(("00", "0a")));
        assert_eq!(parse_ns_name("vm0-ns-3f-ff"), Some(("3f", "ff")));
    }

    #[test]
    fn parse_ns_name_rejects_foreign_names() {
        assert_eq!(parse_ns_name("other-00-0a"), None);
        assert_eq!(parse_ns_name("vm0-ns-000a"), None);
        assert_eq!(parse_ns_name("vm0-ns--0a"), None);
        assert_eq!(parse_ns_name("vm0-ns-00-"), None);
        assert_eq!(parse_ns_name("vm0-ns-"), None);
        // Uppercase hex is not produced by this pool.
        assert_eq!(parse_ns_name("vm0-ns-0A-00"), None);
        // Extra segments could overflow IFNAMSIZ via the derived device name.
        assert_eq!(parse_ns_name("vm0-ns-00-0a-x"), None);
    }

    #[test]
    fn names_roundtrip_through_parser() {
        let name = make_ns_name(&hex_index(5), &hex_index(42));
        let (runner_idx, ns_idx) = parse_ns_name(&name).unwrap();
        assert_eq!((runner_idx, ns_idx), ("05", "2a"));
        assert_eq!(make_host_device(runner_idx, ns_idx), "vm0-ve-05-2a");
    }

    fn bare_pool(dir: &std::path::Path, runner_index: u32) -> NetnsPool {
        NetnsPool {
            active: true,
            queue: VecDeque::new(),
            next_ns_index: 1,
            runner_index,
            proxy_port: None,
            default_iface: "eth0".into(),
            registry: NetnsRegistry::new(dir),
        }
    }

    #[tokio::test]
    async fn duplicate_release_leaves_pool_size_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = bare_pool(dir.path(), 0);
        let ns = PooledNetns {
            name: "vm0-ns-00-00".into(),
            host_device: "vm0-ve-00-00".into(),
        };

        pool.release(ns.clone()).await.unwrap();
        assert_eq!(pool.queue.len(), 1);
        pool.release(ns).await.unwrap();
        assert_eq!(pool.queue.len(), 1);

        // Drain before drop so the Drop warning path stays quiet.
        pool.active = false;
        pool.queue.clear();
    }

    #[tokio::test]
    async fn acquire_returns_pooled_namespace_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = bare_pool(dir.path(), 0);
        let ns = PooledNetns {
            name: "vm0-ns-00-00".into(),
            host_device: "vm0-ve-00-00".into(),
        };
        pool.release(ns.clone()).await.unwrap();

        let acquired = pool.acquire().await.unwrap();
        assert_eq!(acquired, ns);
        assert!(pool.queue.is_empty());

        pool.active = false;
    }
}
