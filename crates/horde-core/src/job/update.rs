//! Moving a live job onto an extended graph.

use super::Job;
use crate::graph::{Graph, NodeRef};
use crate::{Error, Result};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tracing::debug;

impl Job {
    /// Re-targets the job from `old` to `new`.
    ///
    /// Every node of the old graph must still exist, and nodes that shared a
    /// group must still share one. Existing batches keep their states, steps
    /// and leases; nodes that are new to the graph get steps.
    pub fn update_graph(&mut self, old: &Graph, new: &Graph) -> Result<()> {
        if self.graph_hash != old.hash {
            return Err(Error::GraphMismatch {
                expected: self.graph_hash.clone(),
                actual: old.hash.clone(),
            });
        }

        let new_by_name: HashMap<String, NodeRef> = new
            .nodes()
            .map(|(node_ref, node)| (node.name.to_lowercase(), node_ref))
            .collect();

        let mut node_map: HashMap<NodeRef, NodeRef> = HashMap::new();
        let mut group_map: HashMap<usize, usize> = HashMap::new();
        for (old_ref, node) in old.nodes() {
            let new_ref = *new_by_name
                .get(&node.name.to_lowercase())
                .ok_or_else(|| Error::NodeRemoved(node.name.clone()))?;
            match group_map.entry(old_ref.group_idx) {
                Entry::Occupied(entry) if *entry.get() != new_ref.group_idx => {
                    return Err(Error::GroupSplit(old_ref.group_idx));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(entry) => {
                    entry.insert(new_ref.group_idx);
                }
            }
            node_map.insert(old_ref, new_ref);
        }

        // Work out every new index before touching the job so a failure
        // leaves it unchanged.
        let mut renumbered = Vec::with_capacity(self.batches.len());
        for batch in &self.batches {
            let group_idx = *group_map.get(&batch.group_idx).ok_or_else(|| {
                Error::Internal(format!("batch {} refers to an unknown group", batch.id))
            })?;
            let node_indices = batch
                .steps
                .iter()
                .map(|step| {
                    node_map
                        .get(&batch.node_ref(step))
                        .map(|node_ref| node_ref.node_idx)
                        .ok_or_else(|| {
                            Error::Internal(format!("step {} refers to an unknown node", step.id))
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            renumbered.push((group_idx, node_indices));
        }

        for (batch, (group_idx, node_indices)) in self.batches.iter_mut().zip(renumbered) {
            batch.group_idx = group_idx;
            for (step, node_idx) in batch.steps.iter_mut().zip(node_indices) {
                step.node_idx = node_idx;
            }
        }
        self.graph_hash = new.hash.clone();

        let known: HashSet<NodeRef> = node_map.into_values().collect();
        let added: Vec<NodeRef> = new.node_refs().filter(|node_ref| !known.contains(node_ref)).collect();
        for node_ref in &added {
            self.place_step(*node_ref);
        }
        debug!(job_id = %self.id, added = added.len(), graph = %new.hash, "Updated job graph");

        self.refresh(new);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_nodes_join_unclaimed_batches() {
        let old = chain_graph();
        let mut job = Job::new(NewJob::default(), &old).unwrap();

        let new = Graph::from_parts(
            vec![
                group("Win64", vec![node("Step1", &[], &[])]),
                group(
                    "Win64",
                    vec![
                        node("Step2", &[(0, 0)], &[]),
                        node("Step3", &[(1, 0)], &[]),
                        node("Step4", &[(1, 1)], &[]),
                    ],
                ),
            ],
            vec![],
            vec![],
        );
        job.update_graph(&old, &new).unwrap();

        assert_eq!(job.graph_hash, new.hash);
        assert_eq!(job.batches.len(), 2);
        assert_eq!(job.batches[1].steps.len(), 3);
        assert_eq!(job.batches[1].steps[2].node_idx, 2);
    }

    #[test]
    fn test_claimed_batches_never_receive_steps() {
        let old = chain_graph();
        let mut job = Job::new(NewJob::default(), &old).unwrap();
        let batch_id = job.batches[0].id;
        let lease = LeaseAssignment::new(AgentId::new("agent"));
        let lease_id = lease.lease_id;
        job.assign_lease(batch_id, lease, &old).unwrap();

        // Extra node in the first group, and groups re-ordered behind a new one.
        let new = Graph::from_parts(
            vec![
                group("Linux", vec![node("Lint", &[], &[])]),
                group("Win64", vec![node("Step1", &[], &[]), node("Extra", &[], &[])]),
                group(
                    "Win64",
                    vec![node("Step2", &[(1, 0)], &[]), node("Step3", &[(2, 0)], &[])],
                ),
            ],
            vec![],
            vec![],
        );
        job.update_graph(&old, &new).unwrap();

        assert_eq!(job.batches.len(), 4);
        assert_eq!(job.batches[0].group_idx, 1);
        assert_eq!(job.batches[0].state, JobStepBatchState::Starting);
        assert_eq!(job.batches[0].lease_id, Some(lease_id));
        assert_eq!(job.batches[0].steps.len(), 1);
        assert_eq!(job.batches[1].group_idx, 2);
        assert_eq!(job.batches[2].group_idx, 0);
        assert_eq!(job.batches[3].group_idx, 1);
        assert_eq!(job.batches[3].steps[0].node_idx, 1);
    }

    #[test]
    fn test_removed_node_is_rejected() {
        let old = chain_graph();
        let mut job = Job::new(NewJob::default(), &old).unwrap();
        let before = job.clone();

        let new = Graph::from_parts(
            vec![group("Win64", vec![node("Step1", &[], &[])])],
            vec![],
            vec![],
        );
        let err = job.update_graph(&old, &new).unwrap_err();
        assert!(matches!(err, Error::NodeRemoved(name) if name == "Step2"));
        assert_eq!(job, before);
    }

    #[test]
    fn test_split_group_is_rejected() {
        let old = chain_graph();
        let mut job = Job::new(NewJob::default(), &old).unwrap();

        let new = Graph::from_parts(
            vec![
                group("Win64", vec![node("Step1", &[], &[])]),
                group("Win64", vec![node("Step2", &[(0, 0)], &[])]),
                group("Win64", vec![node("Step3", &[(1, 0)], &[])]),
            ],
            vec![],
            vec![],
        );
        assert!(matches!(
            job.update_graph(&old, &new),
            Err(Error::GroupSplit(1))
        ));
    }

    #[test]
    fn test_stale_base_graph_is_rejected() {
        let old = chain_graph();
        let mut job = Job::new(NewJob::default(), &old).unwrap();

        let err = job.update_graph(&Graph::empty(), &old).unwrap_err();
        assert!(matches!(err, Error::GraphMismatch { .. }));
    }
}
