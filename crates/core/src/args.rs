//! # Call Payloads
//!
//! Layers and foreign models are called with an [`ArgsKwargs`]: positional
//! values plus named values. Each value is a [`Value`] tree whose leaves are
//! either tensors of some type `T` or plain scalars.
//!
//! The same structure carries gradients back: the gradient payload passed to a
//! backprop callback must mirror the forward output, position for position and
//! key for key.

use std::collections::BTreeMap;

use crate::error::CoreError;

/// A node in a call payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<T> {
    Tensor(T),
    List(Vec<Value<T>>),
    Map(BTreeMap<String, Value<T>>),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
}

impl<T> Value<T> {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::None => "none",
        }
    }

    pub fn as_tensor(&self) -> Option<&T> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Result<T, CoreError> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(CoreError::UnexpectedValue {
                expected: "tensor",
                got: other.kind(),
            }),
        }
    }

    /// Rebuild the tree, replacing every tensor leaf.
    pub fn map_tensors<U>(self, f: &mut impl FnMut(T) -> Value<U>) -> Value<U> {
        match self {
            Value::Tensor(t) => f(t),
            Value::List(items) => Value::List(items.into_iter().map(|v| v.map_tensors(f)).collect()),
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.map_tensors(f)))
                    .collect(),
            ),
            Value::Int(i) => Value::Int(i),
            Value::Float(x) => Value::Float(x),
            Value::Bool(b) => Value::Bool(b),
            Value::None => Value::None,
        }
    }

    /// Like [`Value::map_tensors`], leaving `self` in place.
    pub fn map_tensors_ref<U>(&self, f: &mut impl FnMut(&T) -> Value<U>) -> Value<U> {
        match self {
            Value::Tensor(t) => f(t),
            Value::List(items) => Value::List(items.iter().map(|v| v.map_tensors_ref(f)).collect()),
            Value::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.map_tensors_ref(f)))
                    .collect(),
            ),
            Value::Int(i) => Value::Int(*i),
            Value::Float(x) => Value::Float(*x),
            Value::Bool(b) => Value::Bool(*b),
            Value::None => Value::None,
        }
    }

    /// Fallible version of [`Value::map_tensors`]; stops at the first error.
    pub fn try_map_tensors<U, E>(
        self,
        f: &mut impl FnMut(T) -> Result<Value<U>, E>,
    ) -> Result<Value<U>, E> {
        Ok(match self {
            Value::Tensor(t) => f(t)?,
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| v.try_map_tensors(f))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| v.try_map_tensors(f).map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Int(i) => Value::Int(i),
            Value::Float(x) => Value::Float(x),
            Value::Bool(b) => Value::Bool(b),
            Value::None => Value::None,
        })
    }

    /// Collect references to every tensor leaf, depth first.
    pub fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Value::Tensor(t) => out.push(t),
            Value::List(items) => items.iter().for_each(|v| v.collect_tensors(out)),
            Value::Map(entries) => entries.values().for_each(|v| v.collect_tensors(out)),
            _ => {}
        }
    }

    /// Walk `self` and `other` together, pairing tensor leaves.
    ///
    /// `other` may carry `None` where `self` has a tensor (no gradient for that
    /// output); any other disagreement is a structure mismatch.
    pub fn zip_tensors<'a, U>(
        &'a self,
        other: &'a Value<U>,
        path: &str,
        out: &mut Vec<(&'a T, &'a U)>,
    ) -> Result<(), CoreError> {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => {
                out.push((a, b));
                Ok(())
            }
            (Value::Tensor(_), Value::None) => Ok(()),
            (Value::List(a), Value::List(b)) => {
                if a.len() != b.len() {
                    return Err(CoreError::structure(format!(
                        "{path}: {} items vs {} gradients",
                        a.len(),
                        b.len()
                    )));
                }
                for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
                    x.zip_tensors(y, &format!("{path}[{i}]"), out)?;
                }
                Ok(())
            }
            (Value::Map(a), Value::Map(b)) => zip_maps(a, b, path, out),
            (Value::Tensor(_), other) => Err(CoreError::structure(format!(
                "{path}: expected tensor gradient, got {}",
                other.kind()
            ))),
            (_, Value::Tensor(_)) => Err(CoreError::structure(format!(
                "{path}: gradient given for a {} output",
                self.kind()
            ))),
            // Non-tensor leaves carry no gradient; whatever sits opposite is ignored.
            _ => Ok(()),
        }
    }
}

fn zip_maps<'a, T, U>(
    a: &'a BTreeMap<String, Value<T>>,
    b: &'a BTreeMap<String, Value<U>>,
    path: &str,
    out: &mut Vec<(&'a T, &'a U)>,
) -> Result<(), CoreError> {
    if let Some(extra) = b.keys().find(|k| !a.contains_key(*k)) {
        return Err(CoreError::structure(format!(
            "{path}: gradient for unknown key `{extra}`"
        )));
    }
    for (key, value) in a {
        match b.get(key) {
            Some(grad) => value.zip_tensors(grad, &format!("{path}.{key}"), out)?,
            None => {
                let mut leaves = Vec::new();
                value.collect_tensors(&mut leaves);
                if !leaves.is_empty() {
                    return Err(CoreError::structure(format!(
                        "{path}: missing gradient for key `{key}`"
                    )));
                }
            }
        }
    }
    Ok(())
}

impl<T> From<T> for Value<T> {
    fn from(tensor: T) -> Self {
        Value::Tensor(tensor)
    }
}

/// Positional and named values for a call.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgsKwargs<T> {
    pub args: Vec<Value<T>>,
    pub kwargs: BTreeMap<String, Value<T>>,
}

impl<T> Default for ArgsKwargs<T> {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }
}

impl<T> ArgsKwargs<T> {
    pub fn new(args: Vec<Value<T>>, kwargs: BTreeMap<String, Value<T>>) -> Self {
        Self { args, kwargs }
    }

    /// Positional tensors only.
    pub fn from_tensors(tensors: impl IntoIterator<Item = T>) -> Self {
        Self {
            args: tensors.into_iter().map(Value::Tensor).collect(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Builder-style named value.
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value<T>>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Normalize a model output into a payload.
    ///
    /// A list becomes the positional values, a map becomes the named values,
    /// and anything else (notably a bare tensor) becomes a single positional value.
    pub fn from_output(output: Value<T>) -> Self {
        match output {
            Value::List(items) => Self {
                args: items,
                kwargs: BTreeMap::new(),
            },
            Value::Map(entries) => Self {
                args: Vec::new(),
                kwargs: entries,
            },
            single => Self {
                args: vec![single],
                kwargs: BTreeMap::new(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.args.len() + self.kwargs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Every tensor leaf, positional values first.
    pub fn tensors(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.args.iter().for_each(|v| v.collect_tensors(&mut out));
        self.kwargs.values().for_each(|v| v.collect_tensors(&mut out));
        out
    }

    pub fn map_tensors<U>(self, mut f: impl FnMut(T) -> Value<U>) -> ArgsKwargs<U> {
        ArgsKwargs {
            args: self.args.into_iter().map(|v| v.map_tensors(&mut f)).collect(),
            kwargs: self
                .kwargs
                .into_iter()
                .map(|(k, v)| (k, v.map_tensors(&mut f)))
                .collect(),
        }
    }

    pub fn map_tensors_ref<U>(&self, mut f: impl FnMut(&T) -> Value<U>) -> ArgsKwargs<U> {
        ArgsKwargs {
            args: self.args.iter().map(|v| v.map_tensors_ref(&mut f)).collect(),
            kwargs: self
                .kwargs
                .iter()
                .map(|(k, v)| (k.clone(), v.map_tensors_ref(&mut f)))
                .collect(),
        }
    }

    pub fn try_map_tensors<U, E>(
        self,
        mut f: impl FnMut(T) -> Result<Value<U>, E>,
    ) -> Result<ArgsKwargs<U>, E> {
        Ok(ArgsKwargs {
            args: self
                .args
                .into_iter()
                .map(|v| v.try_map_tensors(&mut f))
                .collect::<Result<_, _>>()?,
            kwargs: self
                .kwargs
                .into_iter()
                .map(|(k, v)| v.try_map_tensors(&mut f).map(|v| (k, v)))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Pair the tensor leaves of an output payload with a gradient payload.
    pub fn zip_tensors<'a, U>(
        &'a self,
        grads: &'a ArgsKwargs<U>,
    ) -> Result<Vec<(&'a T, &'a U)>, CoreError> {
        if self.args.len() != grads.args.len() {
            return Err(CoreError::structure(format!(
                "{} positional outputs vs {} positional gradients",
                self.args.len(),
                grads.args.len()
            )));
        }
        let mut out = Vec::new();
        for (i, (value, grad)) in self.args.iter().zip(grads.args.iter()).enumerate() {
            value.zip_tensors(grad, &format!("args[{i}]"), &mut out)?;
        }
        zip_maps(&self.kwargs, &grads.kwargs, "kwargs", &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> ArgsKwargs<u32> {
        ArgsKwargs::new(
            vec![
                Value::Tensor(1),
                Value::List(vec![Value::Tensor(2), Value::Int(7)]),
            ],
            BTreeMap::new(),
        )
        .with_kwarg("mask", 3)
        .with_kwarg("scale", Value::Float(0.5))
    }

    #[test]
    fn test_tensors_order() {
        let payload = nested();
        assert_eq!(payload.tensors(), vec![&1, &2, &3]);
        assert_eq!(payload.len(), 4);
    }

    #[test]
    fn test_map_tensors_keeps_scalars() {
        let mapped = nested().map_tensors(|t| Value::Tensor(t * 10));
        assert_eq!(mapped.tensors(), vec![&10, &20, &30]);
        assert_eq!(mapped.kwargs["scale"], Value::Float(0.5));
        assert_eq!(mapped.args[1], Value::List(vec![Value::Tensor(20), Value::Int(7)]));
    }

    #[test]
    fn test_map_tensors_ref_leaves_source() {
        let payload = nested();
        let shared = payload.map_tensors_ref(|t| Value::Tensor(*t + 100));
        assert_eq!(shared.tensors(), vec![&101, &102, &103]);
        assert_eq!(payload.tensors(), vec![&1, &2, &3]);
    }

    #[test]
    fn test_try_map_stops_on_error() {
        let result: Result<ArgsKwargs<u32>, String> = nested().try_map_tensors(|t| {
            if t == 2 {
                Err("boom".to_string())
            } else {
                Ok(Value::Tensor(t))
            }
        });
        assert_eq!(result.unwrap_err(), "boom");
    }

    #[test]
    fn test_from_output_normalizes_bare_value() {
        let single: ArgsKwargs<u32> = ArgsKwargs::from_output(Value::Tensor(5));
        assert_eq!(single.args, vec![Value::Tensor(5)]);
        assert!(single.kwargs.is_empty());

        let list = ArgsKwargs::from_output(Value::List(vec![Value::Tensor(1), Value::Tensor(2)]));
        assert_eq!(list.args.len(), 2);

        let mut entries = BTreeMap::new();
        entries.insert("logits".to_string(), Value::Tensor(9));
        let map = ArgsKwargs::from_output(Value::Map(entries));
        assert!(map.args.is_empty());
        assert_eq!(map.kwargs["logits"], Value::Tensor(9));
    }

    #[test]
    fn test_zip_pairs_leaves() {
        let outputs = nested();
        let grads: ArgsKwargs<&str> = ArgsKwargs::new(
            vec![
                Value::Tensor("d1"),
                Value::List(vec![Value::None, Value::None]),
            ],
            BTreeMap::new(),
        )
        .with_kwarg("mask", "d3");
        let pairs = outputs.zip_tensors(&grads).unwrap();
        assert_eq!(pairs, vec![(&1, &"d1"), (&3, &"d3")]);
    }

    #[test]
    fn test_zip_rejects_arity_mismatch() {
        let outputs: ArgsKwargs<u32> = ArgsKwargs::from_tensors([1, 2]);
        let grads: ArgsKwargs<u32> = ArgsKwargs::from_tensors([1]);
        assert!(matches!(
            outputs.zip_tensors(&grads),
            Err(CoreError::StructureMismatch { .. })
        ));
    }

    #[test]
    fn test_zip_rejects_missing_and_unknown_keys() {
        let outputs: ArgsKwargs<u32> = ArgsKwargs::default().with_kwarg("a", 1);
        let missing: ArgsKwargs<u32> = ArgsKwargs::default();
        assert!(outputs.zip_tensors(&missing).is_err());

        let unknown: ArgsKwargs<u32> = ArgsKwargs::default().with_kwarg("a", 1).with_kwarg("b", 2);
        assert!(outputs.zip_tensors(&unknown).is_err());
    }

    #[test]
    fn test_zip_rejects_gradient_for_scalar() {
        let outputs: ArgsKwargs<u32> = ArgsKwargs::new(vec![Value::Int(3)], BTreeMap::new());
        let grads: ArgsKwargs<u32> = ArgsKwargs::from_tensors([1]);
        assert!(outputs.zip_tensors(&grads).is_err());
    }
}
