//! # Effect Outcomes
//!
//! Every call into effectful code evaluates to an [`Outcome`]: either a final
//! value, or a pending effect request carrying an opaque continuation. The
//! caller (a handler, the trampoline driver, or the host runner) consumes the
//! outcome immediately; an outcome never outlives a single resumption step.
//!
//! The type is generic over the value representation `V` and the continuation
//! reference `K` so the reference interpreter, the machine and the host runner
//! can share it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Resumption discipline of an effect operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResumeKind {
    /// The continuation may be invoked any number of times (multi-shot).
    #[default]
    Resume = 0,
    /// The continuation must be invoked exactly once, in tail position.
    Tail = 1,
}

impl ResumeKind {
    /// The wire encoding of this kind.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a wire value.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ResumeKind::Resume),
            1 => Some(ResumeKind::Tail),
            _ => None,
        }
    }

    /// Whether this is the one-shot, tail-position discipline.
    pub fn is_tail(self) -> bool {
        matches!(self, ResumeKind::Tail)
    }
}

impl fmt::Display for ResumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeKind::Resume => f.write_str("resume"),
            ResumeKind::Tail => f.write_str("tail"),
        }
    }
}

/// A pending effect request.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRequest<V, K> {
    /// 64-bit hash identifying the owning effect.
    pub effect_id: u64,
    /// Index of the operation within its effect.
    pub op_id: u32,
    /// Human-readable `Effect.op` label.
    pub label: String,
    /// Resumption discipline of the operation.
    pub resume_kind: ResumeKind,
    /// Evaluated operation arguments.
    pub args: Vec<V>,
    /// Opaque reference used to resume the suspended computation.
    pub continuation: K,
}

/// The two-case result of running effectful code.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<V, K> {
    /// The computation finished with a value.
    Value(V),
    /// The computation is suspended on an effect request.
    Effect(EffectRequest<V, K>),
}

impl<V, K> Outcome<V, K> {
    /// Whether this outcome is a final value.
    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    /// The final value, if any.
    pub fn into_value(self) -> Option<V> {
        match self {
            Outcome::Value(v) => Some(v),
            Outcome::Effect(_) => None,
        }
    }

    /// The pending request, if any.
    pub fn as_effect(&self) -> Option<&EffectRequest<V, K>> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Effect(req) => Some(req),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_kind_wire_roundtrip() {
        assert_eq!(ResumeKind::from_u32(ResumeKind::Tail.as_u32()), Some(ResumeKind::Tail));
        assert_eq!(ResumeKind::from_u32(ResumeKind::Resume.as_u32()), Some(ResumeKind::Resume));
        assert_eq!(ResumeKind::from_u32(7), None);
    }

    #[test]
    fn test_outcome_accessors() {
        let done: Outcome<i32, ()> = Outcome::Value(3);
        assert!(done.is_value());
        assert!(done.as_effect().is_none());
        assert_eq!(done.into_value(), Some(3));

        let pending: Outcome<i32, u64> = Outcome::Effect(EffectRequest {
            effect_id: 1,
            op_id: 0,
            label: "Async.await".to_string(),
            resume_kind: ResumeKind::Resume,
            args: vec![4],
            continuation: 9,
        });
        assert!(!pending.is_value());
        assert_eq!(pending.as_effect().map(|r| r.continuation), Some(9));
    }
}
