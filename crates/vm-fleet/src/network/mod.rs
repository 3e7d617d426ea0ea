mod bridge;
mod guest;
mod pool;

pub use bridge::{BRIDGE_NAME, runner_comment, setup_host_bridge, teardown_host_bridge};
pub use guest::{GUEST_NETWORK, GuestNetwork, generate_guest_boot_args};
pub use pool::{NS_PREFIX, NetnsPool, NetnsPoolConfig, PooledNetns};
pub(crate) use pool::{reap_dead_runners, tap_exists};
