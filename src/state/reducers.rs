//! Explicit reducer table for `ResearchState`
//!
//! Every mutation of shared state is expressed as a [`StateUpdate`] and
//! applied by [`apply_update`]. Each reducer is pure and total: it never
//! panics on an empty or absent prior value. The reducers touched during
//! fan-out (`MergeFanout`, `Counter`) are commutative and associative, which
//! is the property fan-in correctness depends on.

use super::{FanoutPartial, Message, Phase, PlanStep, ResearchState, TaskDescriptor};
use serde::{Deserialize, Serialize};

/// Counter fields addressable by the `counter` reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterField {
    DecisionCalls,
    ToolCalls,
}

/// Increment-or-reset operation for counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterOp {
    Add(u64),
    Reset,
}

/// A named update to one field of `ResearchState`.
///
/// `Replace*` variants are last-write-wins and only ever issued by the step
/// controller, which is the single logical writer outside fan-out, so no
/// race exists for them.
#[derive(Debug, Clone)]
pub enum StateUpdate {
    /// `append`: concatenate onto the conversation history.
    AppendMessages(Vec<Message>),
    /// `merge_set`: union one fan-out partial into `fanout_results`, keyed
    /// by branch index. A duplicate branch is ignored, which makes the
    /// merge idempotent as well as commutative.
    MergeFanout(FanoutPartial),
    /// The reset sentinel: clear `fanout_results` once fan-in is consumed.
    ResetFanout,
    ReplacePhase(Phase),
    ReplaceResumePhase(Option<Phase>),
    ReplacePlan(Vec<PlanStep>),
    ReplaceStepIndex(usize),
    ReplacePendingTasks(Vec<TaskDescriptor>),
    ReplaceFeedback(Option<String>),
    Counter(CounterField, CounterOp),
}

/// Apply one update to the state. Pure in the sense that the result depends
/// only on the prior state and the update.
pub fn apply_update(state: &mut ResearchState, update: StateUpdate) {
    match update {
        StateUpdate::AppendMessages(messages) => {
            state.conversation.extend(messages);
        }
        StateUpdate::MergeFanout(partial) => {
            if !state
                .fanout_results
                .iter()
                .any(|existing| existing.branch == partial.branch)
            {
                state.fanout_results.push(partial);
                // Keep branch order canonical so fan-in output is
                // reproducible regardless of task completion order.
                state.fanout_results.sort_by_key(|r| r.branch);
            }
        }
        StateUpdate::ResetFanout => {
            state.fanout_results.clear();
        }
        StateUpdate::ReplacePhase(phase) => {
            state.phase = phase;
        }
        StateUpdate::ReplaceResumePhase(phase) => {
            state.resume_phase = phase;
        }
        StateUpdate::ReplacePlan(plan) => {
            state.plan = plan;
        }
        StateUpdate::ReplaceStepIndex(index) => {
            state.current_step_index = index;
        }
        StateUpdate::ReplacePendingTasks(tasks) => {
            state.pending_tasks = tasks;
        }
        StateUpdate::ReplaceFeedback(feedback) => {
            state.last_feedback = feedback;
        }
        StateUpdate::Counter(field, op) => {
            let counter = match field {
                CounterField::DecisionCalls => &mut state.usage.decision_calls,
                CounterField::ToolCalls => &mut state.usage.tool_calls,
            };
            match op {
                CounterOp::Add(delta) => *counter = counter.saturating_add(delta),
                CounterOp::Reset => *counter = 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MessageRole;

    fn partial(branch: u32, finding: &str) -> FanoutPartial {
        FanoutPartial {
            branch,
            theme: format!("theme-{branch}"),
            findings: vec![finding.to_string()],
            sources: Vec::new(),
            failed: false,
            failure: None,
        }
    }

    #[test]
    fn test_append_preserves_order() {
        let mut state = ResearchState::new("r", "u", "t");
        apply_update(
            &mut state,
            StateUpdate::AppendMessages(vec![Message::new(MessageRole::User, "a")]),
        );
        apply_update(
            &mut state,
            StateUpdate::AppendMessages(vec![Message::new(MessageRole::Assistant, "b")]),
        );
        let contents: Vec<_> = state.conversation.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
    }

    #[test]
    fn test_merge_fanout_is_commutative() {
        let partials = vec![partial(0, "zero"), partial(1, "one"), partial(2, "two")];

        // All six arrival orders of three branches converge to the same
        // merged sequence.
        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2],
            vec![0, 2, 1],
            vec![1, 0, 2],
            vec![1, 2, 0],
            vec![2, 0, 1],
            vec![2, 1, 0],
        ];

        let mut merged: Option<Vec<FanoutPartial>> = None;
        for order in orders {
            let mut state = ResearchState::new("r", "u", "t");
            for idx in order {
                apply_update(&mut state, StateUpdate::MergeFanout(partials[idx].clone()));
            }
            match &merged {
                None => merged = Some(state.fanout_results.clone()),
                Some(expected) => assert_eq!(&state.fanout_results, expected),
            }
        }
    }

    #[test]
    fn test_merge_fanout_ignores_duplicate_branch() {
        let mut state = ResearchState::new("r", "u", "t");
        apply_update(&mut state, StateUpdate::MergeFanout(partial(0, "first")));
        apply_update(&mut state, StateUpdate::MergeFanout(partial(0, "second")));
        assert_eq!(state.fanout_results.len(), 1);
        assert_eq!(state.fanout_results[0].findings, vec!["first"]);
    }

    #[test]
    fn test_reset_fanout_clears_results() {
        let mut state = ResearchState::new("r", "u", "t");
        apply_update(&mut state, StateUpdate::MergeFanout(partial(0, "x")));
        apply_update(&mut state, StateUpdate::ResetFanout);
        assert!(state.fanout_results.is_empty());
    }

    #[test]
    fn test_reset_fanout_total_on_empty_state() {
        let mut state = ResearchState::new("r", "u", "t");
        apply_update(&mut state, StateUpdate::ResetFanout);
        assert!(state.fanout_results.is_empty());
    }

    #[test]
    fn test_counter_add_and_reset() {
        let mut state = ResearchState::new("r", "u", "t");
        apply_update(
            &mut state,
            StateUpdate::Counter(CounterField::ToolCalls, CounterOp::Add(2)),
        );
        apply_update(
            &mut state,
            StateUpdate::Counter(CounterField::ToolCalls, CounterOp::Add(3)),
        );
        assert_eq!(state.usage.tool_calls, 5);
        apply_update(
            &mut state,
            StateUpdate::Counter(CounterField::ToolCalls, CounterOp::Reset),
        );
        assert_eq!(state.usage.tool_calls, 0);
    }

    #[test]
    fn test_counter_saturates_instead_of_overflowing() {
        let mut state = ResearchState::new("r", "u", "t");
        apply_update(
            &mut state,
            StateUpdate::Counter(CounterField::DecisionCalls, CounterOp::Add(u64::MAX)),
        );
        apply_update(
            &mut state,
            StateUpdate::Counter(CounterField::DecisionCalls, CounterOp::Add(1)),
        );
        assert_eq!(state.usage.decision_calls, u64::MAX);
    }

    #[test]
    fn test_replace_phase_last_write_wins() {
        let mut state = ResearchState::new("r", "u", "t");
        apply_update(&mut state, StateUpdate::ReplacePhase(Phase::Acting));
        apply_update(&mut state, StateUpdate::ReplacePhase(Phase::Evaluating));
        assert_eq!(state.phase, Phase::Evaluating);
    }
}
