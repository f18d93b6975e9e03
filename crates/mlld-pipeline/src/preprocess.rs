// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stage-list preprocessing.
//!
//! The raw stage sequence mixes real executable calls with built-in effects.
//! Preprocessing attaches each run of effects to the real stage that follows
//! it (pre-effects), attaches trailing effects to the last real stage
//! (post-effects), and synthesizes an identity stage when there are no real
//! stages at all. When the seed value is retryable and came from a source
//! command, that command is prepended so stage 0 can be retried like any
//! other stage.

use mlld_core::ast::{ExecInvocation, Node};

use crate::format::RESERVED_EFFECTS;

// ── Types ───────────────────────────────────────────────────────────────

/// A built-in effect attached to a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectStage {
    /// `show`, `log`, or `output`.
    pub name: String,
    /// Effect arguments (message or target), uninterpolated.
    pub args: Vec<Vec<Node>>,
}

/// One executable unit of a prepared pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStage {
    /// The call to run; `None` marks the implicit identity stage.
    pub call: Option<ExecInvocation>,
    /// Effects run with the stage's input, before execution.
    pub pre_effects: Vec<EffectStage>,
    /// Effects run with the stage's output, after execution.
    pub post_effects: Vec<EffectStage>,
}

impl PreparedStage {
    /// The stage's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.call.as_ref().map_or("identity", |c| c.name.as_str())
    }

    /// Returns `true` for the synthesized identity stage.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.call.is_none()
    }

    fn real(call: ExecInvocation, pre_effects: Vec<EffectStage>) -> Self {
        Self {
            call: Some(call),
            pre_effects,
            post_effects: Vec::new(),
        }
    }

    fn identity(pre_effects: Vec<EffectStage>) -> Self {
        Self {
            call: None,
            pre_effects,
            post_effects: Vec::new(),
        }
    }
}

// ── Preprocessing ───────────────────────────────────────────────────────

/// Returns `true` if a stage call is a built-in effect.
#[must_use]
pub fn is_effect(call: &ExecInvocation) -> bool {
    RESERVED_EFFECTS.contains(&call.name.as_str())
}

/// Prepare a raw stage sequence.
#[must_use]
pub fn preprocess(stages: &[ExecInvocation]) -> Vec<PreparedStage> {
    let mut prepared: Vec<PreparedStage> = Vec::new();
    let mut pending: Vec<EffectStage> = Vec::new();

    for stage in stages {
        if is_effect(stage) {
            pending.push(EffectStage {
                name: stage.name.clone(),
                args: stage.args.clone(),
            });
        } else {
            prepared.push(PreparedStage::real(
                stage.clone(),
                std::mem::take(&mut pending),
            ));
        }
    }

    if prepared.is_empty() {
        // Effects only (or nothing): exactly one identity stage.
        prepared.push(PreparedStage::identity(pending));
    } else if let Some(last) = prepared.last_mut() {
        last.post_effects = pending;
    }

    prepared
}

/// Prepare a stage sequence, prepending the seed's source command when the
/// seed is retryable and the pipeline does not already start with it.
#[must_use]
pub fn preprocess_with_source(
    source: Option<&ExecInvocation>,
    seed_is_retryable: bool,
    stages: &[ExecInvocation],
) -> Vec<PreparedStage> {
    let mut prepared = preprocess(stages);
    if seed_is_retryable {
        if let Some(source) = source {
            let already_first = prepared
                .first()
                .and_then(|s| s.call.as_ref())
                .is_some_and(|c| c.name == source.name);
            if !already_first {
                prepared.insert(0, PreparedStage::real(source.clone(), Vec::new()));
            }
        }
    }
    prepared
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str) -> ExecInvocation {
        ExecInvocation::new(name)
    }

    #[test]
    fn leading_effects_attach_to_the_next_real_stage() {
        let prepared = preprocess(&[call("log"), call("validate"), call("render")]);
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].name(), "validate");
        assert_eq!(prepared[0].pre_effects.len(), 1);
        assert_eq!(prepared[0].pre_effects[0].name, "log");
        assert!(prepared[1].pre_effects.is_empty());
    }

    #[test]
    fn trailing_effects_attach_to_the_last_real_stage() {
        let prepared = preprocess(&[call("validate"), call("show"), call("output")]);
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].post_effects.len(), 2);
        assert_eq!(prepared[0].post_effects[0].name, "show");
        assert_eq!(prepared[0].post_effects[1].name, "output");
    }

    #[test]
    fn effects_only_pipeline_gets_exactly_one_identity_stage() {
        let prepared = preprocess(&[call("show"), call("log")]);
        assert_eq!(prepared.len(), 1);
        assert!(prepared[0].is_identity());
        assert_eq!(prepared[0].pre_effects.len(), 2);
    }

    #[test]
    fn empty_pipeline_still_yields_one_identity_stage() {
        let prepared = preprocess(&[]);
        assert_eq!(prepared.len(), 1);
        assert!(prepared[0].is_identity());
        assert!(prepared[0].pre_effects.is_empty());
    }

    #[test]
    fn sandwiched_effects_preserve_relative_order() {
        let prepared = preprocess(&[
            call("a"),
            call("log"),
            call("show"),
            call("b"),
            call("output"),
        ]);
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].name(), "a");
        assert!(prepared[0].pre_effects.is_empty());
        let pre: Vec<_> = prepared[1].pre_effects.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(pre, vec!["log", "show"]);
        let post: Vec<_> = prepared[1].post_effects.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(post, vec!["output"]);
    }

    #[test]
    fn retryable_seed_prepends_its_source() {
        let source = call("fetch");
        let prepared =
            preprocess_with_source(Some(&source), true, &[call("validate")]);
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].name(), "fetch");
        assert_eq!(prepared[1].name(), "validate");
    }

    #[test]
    fn source_is_not_duplicated_when_already_first() {
        let source = call("fetch");
        let prepared =
            preprocess_with_source(Some(&source), true, &[call("fetch"), call("validate")]);
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].name(), "fetch");
    }

    #[test]
    fn non_retryable_seed_gets_no_source_stage() {
        let source = call("fetch");
        let prepared = preprocess_with_source(Some(&source), false, &[call("validate")]);
        assert_eq!(prepared.len(), 1);
    }
}
