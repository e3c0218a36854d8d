//! Types in the program graph.
//!
//! Types arrive fully resolved from the front end. Generic operation
//! parameters appear as [`Type::Param`] and are substituted per perform
//! site by the handler checker.

use std::fmt;

use rill_runtime::wire::ValueTag;
use serde::{Deserialize, Serialize};

/// A resolved type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Unit,
    Bool,
    I32,
    I64,
    F32,
    F64,
    Tuple(Vec<Type>),
    /// A function or closure type.
    Fn { params: Vec<Type>, ret: Box<Type> },
    /// A captured continuation: resumes with `param`, yields `ret`.
    Continuation { param: Box<Type>, ret: Box<Type> },
    /// The `n`th generic parameter of an effect operation.
    Param(u32),
}

impl Type {
    pub fn func(params: Vec<Type>, ret: Type) -> Self {
        Type::Fn {
            params,
            ret: Box::new(ret),
        }
    }

    pub fn continuation(param: Type, ret: Type) -> Self {
        Type::Continuation {
            param: Box::new(param),
            ret: Box::new(ret),
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Type::Unit)
    }

    /// Whether the type is a scalar a machine local can hold directly.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Type::Unit | Type::Bool | Type::I32 | Type::I64 | Type::F32 | Type::F64
        )
    }

    /// The wire tag for values of this type, if it can cross the host boundary.
    pub fn value_tag(&self) -> Option<ValueTag> {
        match self {
            Type::Unit => Some(ValueTag::None),
            Type::Bool | Type::I32 => Some(ValueTag::I32),
            Type::I64 => Some(ValueTag::I64),
            Type::F32 => Some(ValueTag::F32),
            Type::F64 => Some(ValueTag::F64),
            _ => None,
        }
    }

    /// Whether the type mentions a generic parameter.
    pub fn is_generic(&self) -> bool {
        match self {
            Type::Param(_) => true,
            Type::Tuple(items) => items.iter().any(Type::is_generic),
            Type::Fn { params, ret } => params.iter().any(Type::is_generic) || ret.is_generic(),
            Type::Continuation { param, ret } => param.is_generic() || ret.is_generic(),
            _ => false,
        }
    }

    /// Replace `Param(i)` with `args[i]`. Parameters without an argument
    /// are left in place.
    pub fn substitute(&self, args: &[Type]) -> Type {
        match self {
            Type::Param(i) => args.get(*i as usize).cloned().unwrap_or_else(|| self.clone()),
            Type::Tuple(items) => Type::Tuple(items.iter().map(|t| t.substitute(args)).collect()),
            Type::Fn { params, ret } => Type::Fn {
                params: params.iter().map(|t| t.substitute(args)).collect(),
                ret: Box::new(ret.substitute(args)),
            },
            Type::Continuation { param, ret } => Type::Continuation {
                param: Box::new(param.substitute(args)),
                ret: Box::new(ret.substitute(args)),
            },
            other => other.clone(),
        }
    }

    /// Structural match where a generic parameter on either side matches
    /// anything.
    pub fn matches(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Param(_), _) | (_, Type::Param(_)) => true,
            (Type::Tuple(a), Type::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.matches(y))
            }
            (Type::Fn { params: pa, ret: ra }, Type::Fn { params: pb, ret: rb }) => {
                pa.len() == pb.len() && pa.iter().zip(pb).all(|(x, y)| x.matches(y)) && ra.matches(rb)
            }
            (
                Type::Continuation { param: pa, ret: ra },
                Type::Continuation { param: pb, ret: rb },
            ) => pa.matches(pb) && ra.matches(rb),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unit => f.write_str("()"),
            Type::Bool => f.write_str("bool"),
            Type::I32 => f.write_str("i32"),
            Type::I64 => f.write_str("i64"),
            Type::F32 => f.write_str("f32"),
            Type::F64 => f.write_str("f64"),
            Type::Tuple(items) => {
                f.write_str("(")?;
                for (i, ty) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{ty}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Type::Fn { params, ret } => {
                f.write_str("fn(")?;
                for (i, ty) in params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{ty}")?;
                }
                write!(f, ") -> {ret}")
            }
            Type::Continuation { param, ret } => write!(f, "cont({param}) -> {ret}"),
            Type::Param(i) => write!(f, "T{i}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_nested() {
        let ty = Type::func(vec![Type::Param(0), Type::I32], Type::Tuple(vec![Type::Param(1)]));
        let out = ty.substitute(&[Type::I64, Type::Bool]);
        assert_eq!(out, Type::func(vec![Type::I64, Type::I32], Type::Tuple(vec![Type::Bool])));
        assert!(ty.is_generic());
        assert!(!out.is_generic());
    }

    #[test]
    fn test_matches_treats_params_as_wildcards() {
        assert!(Type::Param(0).matches(&Type::F64));
        assert!(Type::I32.matches(&Type::I32));
        assert!(!Type::I32.matches(&Type::I64));
    }

    #[test]
    fn test_display_and_tags() {
        assert_eq!(Type::func(vec![Type::I32], Type::Unit).to_string(), "fn(i32) -> ()");
        assert_eq!(Type::Param(2).to_string(), "T2");
        assert_eq!(Type::Bool.value_tag(), Some(ValueTag::I32));
        assert_eq!(Type::Tuple(vec![]).value_tag(), None);
    }
}
