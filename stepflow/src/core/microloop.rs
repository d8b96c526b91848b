//! Bounded producer/critic iteration.
//!
//! A critic paired with a producer via `loop_with` is observed after every
//! pass. The loop continues only while the critic is unverified, says more
//! iteration can help, reports a new failure signature, and the iteration
//! limit has not been reached.

use serde::{Deserialize, Serialize};

use crate::core::signature::FailureSignature;
use crate::core::types::Review;
use crate::flow::StepDef;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroloopPolicy {
    pub default_limit: u32,
    pub high_cost_limit: u32,
    /// Step categories that get `high_cost_limit`.
    pub high_cost_categories: Vec<String>,
}

impl Default for MicroloopPolicy {
    fn default() -> Self {
        Self {
            default_limit: 3,
            high_cost_limit: 5,
            high_cost_categories: vec!["code-build".to_string()],
        }
    }
}

impl MicroloopPolicy {
    /// Iteration limit for a pair. The critic's explicit override wins, then
    /// a high-cost category on either step.
    pub fn limit_for(&self, critic: &StepDef, producer: Option<&StepDef>) -> u32 {
        if let Some(limit) = critic.policy.microloop_limit {
            return limit;
        }
        let high_cost = std::iter::once(critic)
            .chain(producer)
            .filter_map(|step| step.category.as_ref())
            .any(|category| self.high_cost_categories.contains(category));
        if high_cost {
            self.high_cost_limit
        } else {
            self.default_limit
        }
    }
}

/// Progress of the active microloop, persisted in the run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroloopState {
    pub producer: String,
    pub critic: String,
    /// Critic passes observed so far.
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_signature: Option<String>,
    /// True when the last two passes produced the same signature.
    #[serde(default)]
    pub repeated: bool,
}

impl MicroloopState {
    /// State after one more critic pass. A state for a different pair is
    /// discarded.
    pub fn next_pass(
        previous: Option<&MicroloopState>,
        producer: &str,
        critic: &str,
        signature: &FailureSignature,
    ) -> Self {
        let key = signature.key();
        match previous.filter(|state| state.producer == producer && state.critic == critic) {
            Some(state) => Self {
                producer: producer.to_string(),
                critic: critic.to_string(),
                iterations: state.iterations.saturating_add(1),
                repeated: state.last_signature.as_deref() == Some(key.as_str()),
                last_signature: Some(key),
            },
            None => Self {
                producer: producer.to_string(),
                critic: critic.to_string(),
                iterations: 1,
                last_signature: Some(key),
                repeated: false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroloopExit {
    Verified,
    RepeatedSignature,
    NoFurtherHelp,
    LimitReached,
}

impl MicroloopExit {
    pub fn reason(self) -> &'static str {
        match self {
            MicroloopExit::Verified => "critic verified the work",
            MicroloopExit::RepeatedSignature => "same critic findings on consecutive passes",
            MicroloopExit::NoFurtherHelp => "critic reports further iteration cannot help",
            MicroloopExit::LimitReached => "microloop iteration limit reached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroloopVerdict {
    Continue,
    Exit(MicroloopExit),
}

/// Decide whether the pair iterates again, given the state after this pass.
pub fn evaluate(state: &MicroloopState, review: &Review, limit: u32) -> MicroloopVerdict {
    if review.verified {
        return MicroloopVerdict::Exit(MicroloopExit::Verified);
    }
    if state.repeated {
        return MicroloopVerdict::Exit(MicroloopExit::RepeatedSignature);
    }
    if !review.can_further_iteration_help {
        return MicroloopVerdict::Exit(MicroloopExit::NoFurtherHelp);
    }
    if state.iterations >= limit {
        return MicroloopVerdict::Exit(MicroloopExit::LimitReached);
    }
    MicroloopVerdict::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::step;

    fn unverified() -> Review {
        Review {
            verified: false,
            can_further_iteration_help: true,
        }
    }

    fn pass(previous: Option<&MicroloopState>, text: &str) -> MicroloopState {
        MicroloopState::next_pass(
            previous,
            "build",
            "review",
            &FailureSignature::new("critic/high", text),
        )
    }

    #[test]
    fn three_distinct_issues_exit_on_third_pass_with_limit_three() {
        let first = pass(None, "issue one");
        assert_eq!(evaluate(&first, &unverified(), 3), MicroloopVerdict::Continue);
        let second = pass(Some(&first), "issue two");
        assert_eq!(evaluate(&second, &unverified(), 3), MicroloopVerdict::Continue);
        let third = pass(Some(&second), "issue three");
        assert_eq!(
            evaluate(&third, &unverified(), 3),
            MicroloopVerdict::Exit(MicroloopExit::LimitReached)
        );
    }

    #[test]
    fn repeated_signature_stops_early() {
        let first = pass(None, "same issue");
        let second = pass(Some(&first), "same issue");
        assert!(second.repeated);
        assert_eq!(
            evaluate(&second, &unverified(), 5),
            MicroloopVerdict::Exit(MicroloopExit::RepeatedSignature)
        );
    }

    #[test]
    fn verified_wins_over_everything() {
        let first = pass(None, "x");
        let second = pass(Some(&first), "x");
        let review = Review {
            verified: true,
            can_further_iteration_help: false,
        };
        assert_eq!(
            evaluate(&second, &review, 1),
            MicroloopVerdict::Exit(MicroloopExit::Verified)
        );
    }

    #[test]
    fn critic_saying_no_help_exits() {
        let first = pass(None, "x");
        let review = Review {
            verified: false,
            can_further_iteration_help: false,
        };
        assert_eq!(
            evaluate(&first, &review, 3),
            MicroloopVerdict::Exit(MicroloopExit::NoFurtherHelp)
        );
    }

    #[test]
    fn high_cost_category_gets_larger_limit() {
        let policy = MicroloopPolicy::default();
        let mut producer = step("build");
        let mut critic = step("review");
        assert_eq!(policy.limit_for(&critic, Some(&producer)), 3);
        producer.category = Some("code-build".to_string());
        assert_eq!(policy.limit_for(&critic, Some(&producer)), 5);
        critic.policy.microloop_limit = Some(2);
        assert_eq!(policy.limit_for(&critic, Some(&producer)), 2);
    }

    #[test]
    fn state_for_other_pair_is_discarded() {
        let other = MicroloopState::next_pass(
            None,
            "draft",
            "proofread",
            &FailureSignature::new("critic/low", "typo"),
        );
        let fresh = pass(Some(&other), "typo");
        assert_eq!(fresh.iterations, 1);
        assert!(!fresh.repeated);
    }
}
