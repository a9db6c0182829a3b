//! Batch reconciliation of the ring.
//!
//! Each function is meant to run inside [`DoublyBuffered::modify`]: it rebuilds `bg` from the
//! foreground `fg` on its first application and records how many servers changed in `replay`.
//! The second application finds `replay` set and copies the new foreground, so both copies end up
//! with the same node sequence.
//!
//! [`DoublyBuffered::modify`]: crate::DoublyBuffered::modify

use std::cmp::Ordering;

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::hashring::HashRing;
use crate::node::{sort_positions, RingNode, ServerId};

/// The virtual nodes built for one server, sorted.
#[derive(Debug, Clone)]
pub(crate) struct Replicas {
    pub(crate) server: ServerId,
    pub(crate) nodes: Vec<RingNode>,
}

fn replayed(bg: &mut HashRing, fg: &HashRing, replay: &mut Option<usize>) -> Option<usize> {
    replay.map(|changed| {
        bg.clone_from(fg);
        changed
    })
}

/// Merges the replicas of every server not yet on the ring. Returns the number of servers added.
///
/// A position already on the ring keeps its node, and inside the batch the smallest server wins a
/// shared position. Accepted servers left without any position are pushed to `unplaced` on the
/// first application.
pub(crate) fn add_batch(
    bg: &mut HashRing,
    fg: &HashRing,
    batch: &[Replicas],
    replay: &mut Option<usize>,
    unplaced: &mut Vec<ServerId>,
) -> usize {
    if let Some(added) = replayed(bg, fg, replay) {
        return added;
    }
    let present = fg.servers();
    let mut accepted: FxHashSet<&ServerId> = FxHashSet::default();
    let mut order = Vec::new();
    let mut incoming = Vec::new();
    for replicas in batch {
        if replicas.nodes.is_empty()
            || present.contains(&replicas.server)
            || !accepted.insert(&replicas.server)
        {
            continue;
        }
        order.push(&replicas.server);
        incoming.extend(replicas.nodes.iter().cloned());
    }
    if accepted.is_empty() {
        *replay = Some(0);
        return 0;
    }
    sort_positions(&mut incoming);

    bg.refill(|out| merge_into(out, fg.nodes(), &incoming));
    let dropped = fg.len() + incoming.len() - bg.len();
    if dropped > 0 {
        debug!(dropped, "virtual nodes collided with existing positions");
    }
    let placed = bg.servers();
    unplaced.extend(
        order
            .into_iter()
            .filter(|server| !placed.contains(*server))
            .cloned(),
    );
    let added = bg.server_count() - fg.server_count();
    *replay = Some(added);
    added
}

/// Drops every node of the given servers. Returns the number of servers that were on the ring.
pub(crate) fn remove_batch(
    bg: &mut HashRing,
    fg: &HashRing,
    servers: &FxHashSet<&ServerId>,
    replay: &mut Option<usize>,
) -> usize {
    if let Some(removed) = replayed(bg, fg, replay) {
        return removed;
    }
    let mut removed: FxHashSet<&ServerId> = FxHashSet::default();
    bg.refill(|out| {
        out.extend(
            fg.nodes()
                .iter()
                .filter(|&node| {
                    if servers.contains(node.server()) {
                        removed.insert(node.server());
                        false
                    } else {
                        true
                    }
                })
                .cloned(),
        )
    });
    *replay = Some(removed.len());
    removed.len()
}

/// Drops every node of `server`. Returns `1` if it was on the ring, `0` otherwise.
pub(crate) fn remove(
    bg: &mut HashRing,
    fg: &HashRing,
    server: &ServerId,
    replay: &mut Option<usize>,
) -> usize {
    if let Some(removed) = replayed(bg, fg, replay) {
        return removed;
    }
    if !fg.contains_server(server) {
        *replay = Some(0);
        return 0;
    }
    bg.refill(|out| {
        out.extend(
            fg.nodes()
                .iter()
                .filter(|node| node.server() != server)
                .cloned(),
        )
    });
    *replay = Some(1);
    1
}

/// Swaps in a complete, sorted node sequence. Returns `1` if the layout changed.
pub(crate) fn replace(
    bg: &mut HashRing,
    fg: &HashRing,
    nodes: &[RingNode],
    replay: &mut Option<usize>,
) -> usize {
    if let Some(changed) = replayed(bg, fg, replay) {
        return changed;
    }
    bg.refill(|out| out.extend_from_slice(nodes));
    let changed = usize::from(!bg.same_layout(fg));
    *replay = Some(changed);
    changed
}

/// Sorted union of two sorted sequences. On equal positions the existing node wins.
fn merge_into(out: &mut Vec<RingNode>, existing: &[RingNode], incoming: &[RingNode]) {
    out.reserve(existing.len() + incoming.len());
    let (mut i, mut j) = (0, 0);
    while i < existing.len() && j < incoming.len() {
        match existing[i].cmp(&incoming[j]) {
            Ordering::Less => {
                out.push(existing[i].clone());
                i += 1;
            }
            Ordering::Greater => {
                out.push(incoming[j].clone());
                j += 1;
            }
            Ordering::Equal => {
                out.push(existing[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&existing[i..]);
    out.extend_from_slice(&incoming[j..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashring::tests::{assert_ring_invariants, node};

    fn replicas(id: u64, addr: &str, hashes: &[u32]) -> Replicas {
        let mut nodes: Vec<RingNode> = hashes.iter().map(|h| node(*h, id, addr)).collect();
        nodes.sort();
        Replicas {
            server: ServerId::new(id),
            nodes,
        }
    }

    /// Runs `f` the way the container does: first against an equal background, then replayed.
    fn apply<F>(ring: &HashRing, mut f: F) -> (HashRing, usize)
    where
        F: FnMut(&mut HashRing, &HashRing) -> usize,
    {
        let mut bg = ring.clone();
        let changed = f(&mut bg, ring);
        if changed == 0 {
            return (ring.clone(), 0);
        }
        let mut old = ring.clone();
        let replayed = f(&mut old, &bg);
        assert_eq!(changed, replayed);
        assert!(old.same_layout(&bg));
        (bg, changed)
    }

    fn add(ring: &HashRing, batch: &[Replicas]) -> (HashRing, usize) {
        let (ring, added, _) = add_reporting(ring, batch);
        (ring, added)
    }

    fn add_reporting(ring: &HashRing, batch: &[Replicas]) -> (HashRing, usize, Vec<ServerId>) {
        let mut replay = None;
        let mut unplaced = Vec::new();
        let (ring, added) = apply(ring, |bg, fg| {
            add_batch(bg, fg, batch, &mut replay, &mut unplaced)
        });
        (ring, added, unplaced)
    }

    #[test]
    fn adding_a_batch_works() {
        let (ring, added) = add(
            &HashRing::new(),
            &[
                replicas(1, "10.0.0.1:80", &[10, 300, 700]),
                replicas(2, "10.0.0.2:80", &[20, 400, 800]),
            ],
        );
        assert_eq!(added, 2);
        assert_eq!(ring.len(), 6);
        assert_eq!(ring.server_count(), 2);
        assert_ring_invariants(&ring);
    }

    #[test]
    fn adding_a_present_server_is_a_no_op() {
        let batch = [replicas(1, "10.0.0.1:80", &[10, 300])];
        let (ring, _) = add(&HashRing::new(), &batch);
        let (again, added) = add(&ring, &batch);
        assert_eq!(added, 0);
        assert!(again.same_layout(&ring));
    }

    #[test]
    fn duplicate_servers_in_one_batch_count_once() {
        let batch = [
            replicas(1, "10.0.0.1:80", &[10, 300]),
            replicas(1, "10.0.0.1:80", &[10, 300]),
        ];
        let (ring, added) = add(&HashRing::new(), &batch);
        assert_eq!(added, 1);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn servers_without_replicas_are_skipped() {
        let batch = [
            Replicas {
                server: ServerId::new(1),
                nodes: Vec::new(),
            },
            replicas(2, "10.0.0.2:80", &[5]),
        ];
        let (ring, added) = add(&HashRing::new(), &batch);
        assert_eq!(added, 1);
        assert!(!ring.contains_server(&ServerId::new(1)));
    }

    #[test]
    fn colliding_positions_keep_the_existing_node() {
        let (ring, _) = add(&HashRing::new(), &[replicas(1, "10.0.0.1:80", &[10, 20])]);
        // Same address under another id lands on the same position as server 1.
        let (ring, added) = add(&ring, &[replicas(2, "10.0.0.1:80", &[20, 30])]);
        assert_eq!(added, 1);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.get(20).unwrap().server(), &ServerId::new(1));
        assert_ring_invariants(&ring);
    }

    #[test]
    fn servers_shadowed_by_existing_positions_are_reported() {
        let (ring, _) = add(&HashRing::new(), &[replicas(1, "10.0.0.1:80", &[10, 20])]);
        let (after, added, unplaced) = add_reporting(
            &ring,
            &[
                replicas(2, "10.0.0.1:80", &[10, 20]),
                replicas(3, "10.0.0.3:80", &[30]),
            ],
        );
        assert_eq!(added, 1);
        assert_eq!(unplaced, vec![ServerId::new(2)]);
        assert!(!after.contains_server(&ServerId::new(2)));

        let (after, added, unplaced) =
            add_reporting(&ring, &[replicas(2, "10.0.0.1:80", &[10, 20])]);
        assert_eq!(added, 0);
        assert_eq!(unplaced, vec![ServerId::new(2)]);
        assert!(after.same_layout(&ring));
    }

    #[test]
    fn batch_order_does_not_decide_shared_positions() {
        let one = replicas(1, "10.0.0.1:80", &[10, 20]);
        let two = replicas(2, "10.0.0.1:80", &[20, 30]);
        let (forward, _) = add(&HashRing::new(), &[one.clone(), two.clone()]);
        let (backward, _) = add(&HashRing::new(), &[two, one]);
        assert_eq!(forward, backward);
        assert_eq!(forward.get(20).unwrap().server(), &ServerId::new(1));
        assert_ring_invariants(&forward);
    }

    #[test]
    fn removing_a_batch_works() {
        let (ring, _) = add(
            &HashRing::new(),
            &[
                replicas(1, "10.0.0.1:80", &[10, 300]),
                replicas(2, "10.0.0.2:80", &[20, 400]),
                replicas(3, "10.0.0.3:80", &[30, 500]),
            ],
        );
        let one = ServerId::new(1);
        let three = ServerId::new(3);
        let absent = ServerId::new(9);
        let targets: FxHashSet<&ServerId> = [&one, &three, &absent].into_iter().collect();
        let mut replay = None;
        let (ring, removed) = apply(&ring, |bg, fg| remove_batch(bg, fg, &targets, &mut replay));
        assert_eq!(removed, 2);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.server_count(), 1);
        assert_ring_invariants(&ring);
    }

    #[test]
    fn removing_an_absent_server_is_a_no_op() {
        let (ring, _) = add(&HashRing::new(), &[replicas(1, "10.0.0.1:80", &[10])]);
        let mut replay = None;
        let (after, removed) = apply(&ring, |bg, fg| {
            remove(bg, fg, &ServerId::new(2), &mut replay)
        });
        assert_eq!(removed, 0);
        assert!(after.same_layout(&ring));
    }

    #[test]
    fn removing_a_single_server_works() {
        let (ring, _) = add(
            &HashRing::new(),
            &[
                replicas(1, "10.0.0.1:80", &[10, 300]),
                replicas(2, "10.0.0.2:80", &[20, 400]),
            ],
        );
        let mut replay = None;
        let (ring, removed) = apply(&ring, |bg, fg| {
            remove(bg, fg, &ServerId::new(1), &mut replay)
        });
        assert_eq!(removed, 1);
        assert!(!ring.contains_server(&ServerId::new(1)));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn replacing_reports_layout_changes() {
        let (ring, _) = add(&HashRing::new(), &[replicas(1, "10.0.0.1:80", &[10, 300])]);
        let same = ring.nodes().to_vec();
        let mut replay = None;
        let (_, changed) = apply(&ring, |bg, fg| replace(bg, fg, &same, &mut replay));
        assert_eq!(changed, 0);

        let moved = replicas(1, "10.0.0.1:80", &[15, 305]).nodes;
        let mut replay = None;
        let (ring, changed) = apply(&ring, |bg, fg| replace(bg, fg, &moved, &mut replay));
        assert_eq!(changed, 1);
        assert_eq!(ring.nodes()[0].hash(), 15);
    }
}
