//! Host bridge for the legacy bridged (non-namespace) path.
//!
//! One bridge per host; runner-scoped iptables rules are tagged
//! `vm0:runner:<name>` so each runner can remove exactly its own rules.

use crate::command::{Privilege, exec_command, exec_command_ignore_errors, sudo};
use crate::error::Result;

use super::pool::delete_iptables_by_comment;

pub const BRIDGE_NAME: &str = "vm0-br0";
const BRIDGE_CIDR: &str = "172.16.0.1/24";

/// The iptables comment tag for a runner's bridge rules.
pub fn runner_comment(runner_name: &str) -> String {
    format!("vm0:runner:{runner_name}")
}

/// Create the shared bridge (idempotent) and this runner's NAT rules.
pub async fn setup_host_bridge(runner_name: &str) -> Result<()> {
    if exec_command(&format!("ip link show {BRIDGE_NAME}"), Privilege::User)
        .await
        .is_err()
    {
        sudo!("ip link add {BRIDGE_NAME} type bridge")?;
    }
    // Address add fails when already assigned; that's the idempotent case.
    exec_command_ignore_errors(
        &format!("ip addr add {BRIDGE_CIDR} dev {BRIDGE_NAME}"),
        Privilege::Sudo,
    )
    .await;
    sudo!("ip link set {BRIDGE_NAME} up")?;

    // Replace rather than stack this runner's rules across restarts.
    let comment = runner_comment(runner_name);
    delete_iptables_by_comment(&comment).await;
    sudo!(
        "iptables -t nat -A POSTROUTING -s 172.16.0.0/24 ! -o {BRIDGE_NAME} -j MASQUERADE -m comment --comment \"{comment}\""
    )?;
    sudo!(
        "iptables -A FORWARD -i {BRIDGE_NAME} -j ACCEPT -m comment --comment \"{comment}\""
    )?;
    sudo!(
        "iptables -A FORWARD -o {BRIDGE_NAME} -m state --state RELATED,ESTABLISHED -j ACCEPT -m comment --comment \"{comment}\""
    )?;
    Ok(())
}

/// Remove this runner's tagged rules. The bridge itself is shared between
/// runners and stays.
pub async fn teardown_host_bridge(runner_name: &str) {
    delete_iptables_by_comment(&runner_comment(runner_name)).await;
}
