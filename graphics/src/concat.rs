//! Concatenation of stage command buffers into a frame's primary buffer.
//!
//! Stages are walked in declared order. Consecutive stages that share a
//! render pass form a run: the pass is begun for the first member, advanced
//! with `NextSubpass` for every later member and ended at the run boundary.
//! A run is always begun, even when none of its stages drew anything, so the
//! clears a pass declares happen every frame.
//!
//! Only stages that recorded at least one draw have their secondary buffer
//! executed. A copy request is emitted outside any render pass, right before
//! the run of the stage that carries it begins.

use crate::handle::RenderPassHandle;

/// What the planner needs to know about one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStage {
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    pub draws: u32,
    pub has_copy: bool,
}

/// One step of the primary command buffer. Indices refer to the planned stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassOp {
    Copy(usize),
    BeginRenderPass(usize),
    NextSubpass,
    Execute(usize),
    EndRenderPass,
}

/// Plan the primary command buffer of a frame.
pub fn plan(stages: &[PlanStage]) -> Vec<PassOp> {
    let mut ops = Vec::with_capacity(stages.len() * 3);
    let mut previous: Option<&PlanStage> = None;

    for (index, stage) in stages.iter().enumerate() {
        let continues_run = previous.is_some_and(|prev| {
            prev.render_pass == stage.render_pass
                && stage.subpass == prev.subpass + 1
                && !stage.has_copy
        });

        if continues_run {
            ops.push(PassOp::NextSubpass);
        } else {
            if previous.is_some() {
                ops.push(PassOp::EndRenderPass);
            }
            debug_assert_eq!(
                stage.subpass, 0,
                "stage {index} starts a render pass at subpass {}",
                stage.subpass
            );
            if stage.has_copy {
                ops.push(PassOp::Copy(index));
            }
            ops.push(PassOp::BeginRenderPass(index));
        }

        if stage.draws > 0 {
            ops.push(PassOp::Execute(index));
        }
        previous = Some(stage);
    }

    if previous.is_some() {
        ops.push(PassOp::EndRenderPass);
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(pass: u64, subpass: u32, draws: u32) -> PlanStage {
        PlanStage {
            render_pass: RenderPassHandle::from_raw(pass),
            subpass,
            draws,
            has_copy: false,
        }
    }

    fn count(ops: &[PassOp], wanted: fn(&PassOp) -> bool) -> usize {
        ops.iter().filter(|op| wanted(op)).count()
    }

    #[test]
    fn test_empty_frame() {
        assert!(plan(&[]).is_empty());
    }

    #[test]
    fn test_single_stage() {
        assert_eq!(
            plan(&[stage(1, 0, 4)]),
            vec![
                PassOp::BeginRenderPass(0),
                PassOp::Execute(0),
                PassOp::EndRenderPass
            ]
        );
    }

    #[test]
    fn test_zero_draw_stage_still_clears() {
        assert_eq!(
            plan(&[stage(1, 0, 0)]),
            vec![PassOp::BeginRenderPass(0), PassOp::EndRenderPass]
        );
    }

    #[test]
    fn test_shared_pass_advances_subpasses() {
        let ops = plan(&[stage(1, 0, 2), stage(1, 1, 0), stage(1, 2, 5)]);
        assert_eq!(
            ops,
            vec![
                PassOp::BeginRenderPass(0),
                PassOp::Execute(0),
                PassOp::NextSubpass,
                PassOp::NextSubpass,
                PassOp::Execute(2),
                PassOp::EndRenderPass,
            ]
        );
    }

    #[test]
    fn test_copy_precedes_its_pass() {
        let mut post = stage(2, 0, 1);
        post.has_copy = true;
        let ops = plan(&[stage(1, 0, 1), post]);
        assert_eq!(
            ops,
            vec![
                PassOp::BeginRenderPass(0),
                PassOp::Execute(0),
                PassOp::EndRenderPass,
                PassOp::Copy(1),
                PassOp::BeginRenderPass(1),
                PassOp::Execute(1),
                PassOp::EndRenderPass,
            ]
        );
    }

    #[test]
    fn test_passes_begun_equal_runs() {
        // Runs: [a0 a1] [b0] [c0 c1 c2] [d0]
        let stages = [
            stage(1, 0, 1),
            stage(1, 1, 0),
            stage(2, 0, 0),
            stage(3, 0, 3),
            stage(3, 1, 0),
            stage(3, 2, 1),
            stage(4, 0, 0),
        ];
        let ops = plan(&stages);
        let begun = count(&ops, |op| matches!(op, PassOp::BeginRenderPass(_)));
        let ended = count(&ops, |op| matches!(op, PassOp::EndRenderPass));
        let advanced = count(&ops, |op| matches!(op, PassOp::NextSubpass));
        let executed = count(&ops, |op| matches!(op, PassOp::Execute(_)));

        assert_eq!(begun, 4);
        assert_eq!(ended, 4);
        assert_eq!(advanced, stages.len() - begun);
        assert_eq!(executed, stages.iter().filter(|s| s.draws > 0).count());
    }

    #[test]
    fn test_executes_follow_declared_order() {
        let stages: Vec<_> = (0..6).map(|i| stage(i, 0, 1)).collect();
        let executed: Vec<usize> = plan(&stages)
            .into_iter()
            .filter_map(|op| match op {
                PassOp::Execute(index) => Some(index),
                _ => None,
            })
            .collect();
        assert_eq!(executed, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_passes_are_balanced() {
        let stages = [stage(1, 0, 0), stage(1, 1, 2), stage(2, 0, 1), stage(1, 0, 1)];
        let mut open = false;
        for op in plan(&stages) {
            match op {
                PassOp::BeginRenderPass(_) => {
                    assert!(!open, "render pass begun while another is open");
                    open = true;
                }
                PassOp::EndRenderPass => {
                    assert!(open, "render pass ended while none is open");
                    open = false;
                }
                PassOp::Copy(_) => assert!(!open, "copy inside a render pass"),
                PassOp::NextSubpass | PassOp::Execute(_) => assert!(open),
            }
        }
        assert!(!open);
    }
}
