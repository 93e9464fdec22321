//! Token movement, parallel forks and joins
//!
//! A fork records a [`ForkFrame`] with the number of branches it started.
//! Branch tokens carry the frame ids they belong to; a join parks arriving
//! tokens in the innermost frame and releases a single merged token once
//! every branch that can still arrive has arrived. A branch that ends
//! elsewhere lowers the frame's outstanding count instead.

use serde_json::json;
use uuid::Uuid;

use crate::definition::{CompiledWorkflow, NodeIndex};
use crate::instance::{ExecutionToken, ForkFrame, HistoryEntry, HistoryEventType, WorkflowInstance};

/// Move `token_id` onto `target`, parking it if `target` joins its fork
pub(crate) fn arrive(
    inst: &mut WorkflowInstance,
    compiled: &CompiledWorkflow,
    token_id: Uuid,
    target: NodeIndex,
) {
    let target_node = compiled.node(target);
    let Some(token) = inst.token_mut(token_id) else {
        return;
    };

    let frame_id = match token.innermost_fork() {
        Some(frame_id) if target_node.is_join() => frame_id,
        _ => {
            token.move_to(target_node.id());
            return;
        }
    };

    inst.remove_token(token_id);
    let Some(frame) = inst.forks.iter_mut().find(|f| f.id == frame_id) else {
        return;
    };
    frame.join_node.get_or_insert_with(|| target_node.id().to_string());
    frame.arrived.push(token_id);

    if frame.is_satisfied() {
        release_join(inst, frame_id);
    }
}

/// Split `token_id` into one token per target inside a new fork frame
pub(crate) fn fork(
    inst: &mut WorkflowInstance,
    compiled: &CompiledWorkflow,
    token_id: Uuid,
    targets: &[NodeIndex],
) {
    let Some(parent) = inst.remove_token(token_id) else {
        return;
    };

    let frame = ForkFrame::new(parent.node_id.clone(), targets.len() as u32, parent.forks.clone());
    let frame_id = frame.id;
    inst.forks.push(frame);

    let mut fork_entry = HistoryEntry::new(HistoryEventType::BranchForked).output(json!({
        "branches": targets.iter().map(|t| compiled.node(*t).id()).collect::<Vec<_>>(),
    }));
    if let Some((_, node)) = compiled.node_by_id(&parent.node_id) {
        fork_entry = fork_entry.activity(&node.model);
    }
    inst.record(fork_entry);

    for target in targets {
        let mut branch = parent.sibling(parent.node_id.clone());
        branch.forks.push(frame_id);
        let branch_id = branch.id;
        inst.tokens.push(branch);
        arrive(inst, compiled, branch_id, *target);
    }
}

/// Start an extra branch at `target` alongside `from`
///
/// Used by non-interrupting boundary events; the branch joins the same fork
/// frame as the host token.
pub(crate) fn spawn_branch(
    inst: &mut WorkflowInstance,
    compiled: &CompiledWorkflow,
    from: &ExecutionToken,
    target: NodeIndex,
) {
    if let Some(frame_id) = from.innermost_fork() {
        if let Some(frame) = inst.forks.iter_mut().find(|f| f.id == frame_id) {
            frame.outstanding += 1;
        }
    }
    let branch = from.sibling(from.node_id.clone());
    let branch_id = branch.id;
    inst.tokens.push(branch);
    arrive(inst, compiled, branch_id, target);
}

/// Retire a token that reached an end node
pub(crate) fn end_token(inst: &mut WorkflowInstance, token_id: Uuid) {
    inst.clear_token_bookmarks(token_id);
    let Some(token) = inst.remove_token(token_id) else {
        return;
    };
    if let Some(frame_id) = token.innermost_fork() {
        branch_finished(inst, frame_id);
    }
}

fn branch_finished(inst: &mut WorkflowInstance, frame_id: Uuid) {
    let Some(frame) = inst.forks.iter_mut().find(|f| f.id == frame_id) else {
        return;
    };
    frame.outstanding = frame.outstanding.saturating_sub(1);

    if frame.outstanding == 0 && frame.arrived.is_empty() {
        // Every branch ended without joining: the fork as a whole is one
        // finished branch of its parent
        let parent = frame.parent_forks.last().copied();
        inst.forks.retain(|f| f.id != frame_id);
        if let Some(parent) = parent {
            branch_finished(inst, parent);
        }
    } else if frame.is_satisfied() {
        release_join(inst, frame_id);
    }
}

fn release_join(inst: &mut WorkflowInstance, frame_id: Uuid) {
    let Some(index) = inst.forks.iter().position(|f| f.id == frame_id) else {
        return;
    };
    let frame = inst.forks.remove(index);
    let Some(join_node) = frame.join_node else {
        return;
    };

    let mut merged = ExecutionToken::new(join_node.clone());
    merged.forks = frame.parent_forks;
    inst.tokens.push(merged);

    let mut entry = HistoryEntry::new(HistoryEventType::BranchJoined).output(json!({
        "arrived": frame.arrived.len(),
    }));
    entry.activity_id = Some(join_node);
    inst.record(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ExecutionResult, ExecutorRegistry};
    use crate::definition::{Edge, Node, WorkflowDefinition};
    use crate::instance::{TokenState, Variables};

    fn diamond(branches: usize) -> CompiledWorkflow {
        let mut def = WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(Node::parallel("fork"))
            .with_node(Node::parallel("join"))
            .with_node(Node::end("end"))
            .with_node(Node::end("early"))
            .with_edge(Edge::new("start", "fork"))
            .with_edge(Edge::new("join", "end"));
        for i in 0..branches {
            let id = format!("b{}", i);
            def = def
                .with_node(Node::task(&id, "work"))
                .with_edge(Edge::new("fork", &id))
                .with_edge(Edge::new(&id, "join"));
        }
        let mut executors = ExecutorRegistry::new();
        executors.register_fn("work", |_| async { Ok(ExecutionResult::done()) });
        CompiledWorkflow::compile(def, &executors).unwrap()
    }

    fn forked(compiled: &CompiledWorkflow, branches: usize) -> WorkflowInstance {
        let mut inst = WorkflowInstance::new("wf", 1, Variables::new());
        let token = ExecutionToken::new("fork");
        let token_id = token.id;
        inst.tokens.push(token);
        let targets: Vec<NodeIndex> = (0..branches)
            .map(|i| compiled.index_of(&format!("b{}", i)).unwrap())
            .collect();
        fork(&mut inst, compiled, token_id, &targets);
        inst
    }

    #[test]
    fn test_fork_creates_branch_tokens() {
        let compiled = diamond(3);
        let inst = forked(&compiled, 3);

        assert_eq!(inst.tokens.len(), 3);
        assert_eq!(inst.forks.len(), 1);
        assert_eq!(inst.forks[0].outstanding, 3);
        assert!(inst.tokens.iter().all(|t| t.forks == vec![inst.forks[0].id]));
        assert!(inst.tokens.iter().all(|t| t.state == TokenState::Ready));
    }

    #[test]
    fn test_join_waits_for_all_branches_in_any_order() {
        let compiled = diamond(3);
        let join = compiled.index_of("join").unwrap();

        for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let mut inst = forked(&compiled, 3);
            let ids: Vec<Uuid> = inst.tokens.iter().map(|t| t.id).collect();

            for (n, i) in order.iter().enumerate() {
                arrive(&mut inst, &compiled, ids[*i], join);
                if n < 2 {
                    assert_eq!(inst.forks.len(), 1, "join released early");
                    assert!(inst.tokens.iter().all(|t| t.node_id != "join"));
                }
            }

            assert!(inst.forks.is_empty());
            assert_eq!(inst.tokens.len(), 1);
            assert_eq!(inst.tokens[0].node_id, "join");
            assert!(inst.tokens[0].forks.is_empty());
        }
    }

    #[test]
    fn test_branch_ending_early_lowers_outstanding() {
        let compiled = diamond(2);
        let join = compiled.index_of("join").unwrap();
        let mut inst = forked(&compiled, 2);
        let ids: Vec<Uuid> = inst.tokens.iter().map(|t| t.id).collect();

        arrive(&mut inst, &compiled, ids[0], join);
        assert_eq!(inst.forks.len(), 1);

        end_token(&mut inst, ids[1]);
        assert!(inst.forks.is_empty());
        assert_eq!(inst.tokens.len(), 1);
        assert_eq!(inst.tokens[0].node_id, "join");
    }

    #[test]
    fn test_all_branches_ending_removes_frame() {
        let compiled = diamond(2);
        let mut inst = forked(&compiled, 2);
        let ids: Vec<Uuid> = inst.tokens.iter().map(|t| t.id).collect();

        end_token(&mut inst, ids[0]);
        end_token(&mut inst, ids[1]);
        assert!(inst.forks.is_empty());
        assert!(inst.tokens.is_empty());
    }

    #[test]
    fn test_spawned_branch_counts_toward_join() {
        let compiled = diamond(2);
        let join = compiled.index_of("join").unwrap();
        let early = compiled.index_of("early").unwrap();
        let mut inst = forked(&compiled, 2);
        let host = inst.tokens[0].clone();

        spawn_branch(&mut inst, &compiled, &host, early);
        assert_eq!(inst.forks[0].outstanding, 3);
        let spawned = inst.tokens.last().unwrap().id;

        let ids: Vec<Uuid> = inst.tokens.iter().take(2).map(|t| t.id).collect();
        arrive(&mut inst, &compiled, ids[0], join);
        arrive(&mut inst, &compiled, ids[1], join);
        assert_eq!(inst.forks.len(), 1, "spawned branch still outstanding");

        end_token(&mut inst, spawned);
        assert!(inst.forks.is_empty());
        assert_eq!(inst.tokens.len(), 1);
    }

    #[test]
    fn test_arrive_outside_fork_moves_token() {
        let compiled = diamond(2);
        let join = compiled.index_of("join").unwrap();
        let mut inst = WorkflowInstance::new("wf", 1, Variables::new());
        let token = ExecutionToken::new("b0");
        let id = token.id;
        inst.tokens.push(token);

        arrive(&mut inst, &compiled, id, join);
        assert_eq!(inst.token(id).unwrap().node_id, "join");
    }
}
