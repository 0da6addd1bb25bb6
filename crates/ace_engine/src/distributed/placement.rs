//! src/distributed/placement.rs
//!
//! Startup placement of workers onto local devices.
//!
//! Only the process with local rank 0 on each node places. Accelerator
//! devices are handed out first, one per local rank in platform-major
//! order; every local rank left over runs serial. On the master's node the
//! master itself occupies local rank 0 and receives no placement.

use log::info;

use crate::comm::Communicator;
use crate::device::{devices, AcceleratorPlatform};
use crate::error::AceResult;
use crate::protocol::{self, StartMessage};

/// Computes `(local_rank, start message)` pairs for one node.
pub fn plan_placement(
    platform: &dyn AcceleratorPlatform,
    local_size: usize,
    hosts_master: bool,
    use_accelerators: bool,
) -> Vec<(usize, StartMessage)> {
    let mut rank = usize::from(hosts_master);
    let mut plan = Vec::with_capacity(local_size.saturating_sub(rank));

    if use_accelerators {
        for (p, d) in devices(platform) {
            if rank >= local_size {
                return plan;
            }
            plan.push((rank, StartMessage::accelerated(p, d)));
            rank += 1;
        }
    }
    while rank < local_size {
        plan.push((rank, StartMessage::serial()));
        rank += 1;
    }
    plan
}

/// Sends the node's placement if this process is local rank 0.
///
/// Returns the number of start messages sent.
pub fn send_placement(
    comm: &dyn Communicator,
    platform: &dyn AcceleratorPlatform,
    use_accelerators: bool,
) -> AceResult<usize> {
    if comm.local_rank() != 0 {
        return Ok(0);
    }
    let plan = plan_placement(platform, comm.local_size(), comm.is_master(), use_accelerators);
    for (local_rank, start) in &plan {
        info!(
            "rank {} places local rank {} on {:?} {}:{}",
            comm.rank(),
            local_rank,
            start.resource,
            start.platform,
            start.device
        );
        comm.send_local(*local_rank, protocol::encode(start)?)?;
    }
    Ok(plan.len())
}
