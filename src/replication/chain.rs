//! Chain routing decision table (spec.md §4.F, "Routing decisions").
//!
//! A pure function over chain position and subspace-change state, kept
//! separate from `ReplicationManager` so the table in spec.md §4.F can be
//! read off this file almost verbatim.

use crate::ids::VirtualServerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward `CHAIN_OP` to the given next hop.
    ForwardOp(VirtualServerId),
    /// Forward `CHAIN_SUBSPACE` to the given next hop (still inside the
    /// old region's chain).
    ForwardSubspace(VirtualServerId),
    /// We are the terminal position for this op; mark it acked locally
    /// and send `CHAIN_ACK` back up the chain.
    Ack,
}

/// `chain` is this node's own region's chain, head first. `position` is
/// this node's index within it. `is_subspace_change` and `in_old_region`
/// together identify which row of spec.md §4.F's table applies;
/// `next_region_head` is the head of the op's destination region when one
/// is known (only meaningful at the tail of the old region, or when this
/// node already belongs to the new region's chain).
pub fn decide_route(
    chain: &[VirtualServerId],
    position: usize,
    is_subspace_change: bool,
    in_old_region: bool,
    next_region_head: Option<VirtualServerId>,
) -> RouteDecision {
    let is_tail = position + 1 >= chain.len();

    if !is_tail {
        return if is_subspace_change && in_old_region {
            RouteDecision::ForwardSubspace(chain[position + 1])
        } else {
            RouteDecision::ForwardOp(chain[position + 1])
        };
    }

    // Tail of our own chain.
    if is_subspace_change && in_old_region {
        return match next_region_head {
            Some(head) => RouteDecision::ForwardOp(head),
            None => RouteDecision::Ack,
        };
    }
    match next_region_head {
        Some(head) if !is_subspace_change => RouteDecision::ForwardOp(head),
        _ => RouteDecision::Ack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vs(n: u64) -> VirtualServerId {
        VirtualServerId::new(n)
    }

    #[test]
    fn mid_chain_same_region_forwards_op() {
        let chain = [vs(1), vs(2), vs(3)];
        assert_eq!(decide_route(&chain, 0, false, false, None), RouteDecision::ForwardOp(vs(2)));
    }

    #[test]
    fn tail_no_next_acks() {
        let chain = [vs(1), vs(2), vs(3)];
        assert_eq!(decide_route(&chain, 2, false, false, None), RouteDecision::Ack);
    }

    #[test]
    fn tail_of_old_region_crossing_forwards_into_new_region_head() {
        let chain = [vs(1), vs(2)];
        assert_eq!(
            decide_route(&chain, 1, true, true, Some(vs(9))),
            RouteDecision::ForwardOp(vs(9))
        );
    }

    #[test]
    fn mid_chain_old_region_crossing_forwards_subspace() {
        let chain = [vs(1), vs(2), vs(3)];
        assert_eq!(
            decide_route(&chain, 0, true, true, None),
            RouteDecision::ForwardSubspace(vs(2))
        );
    }

    #[test]
    fn mid_chain_new_region_forwards_op_normally() {
        let chain = [vs(9), vs(10)];
        assert_eq!(
            decide_route(&chain, 0, true, false, None),
            RouteDecision::ForwardOp(vs(10))
        );
    }
}
