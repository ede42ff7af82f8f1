//! # Backward Pass - Reverse-Mode Autodiff
//!
//! Every operation on a trainable tensor appends a tape entry to its result.
//! [`backward`] walks those entries from the given outputs back to the leaves:
//!
//! 1. Collect every tensor reachable from the outputs into a DAG
//! 2. Seed the outputs with the caller's gradients
//! 3. Visit nodes in reverse topological order, applying each op's VJP
//! 4. Accumulate into `.grad` of every leaf that `requires_grad`
//!
//! Gradients accumulate across calls until cleared, so two backward passes
//! without a `zero_grad` in between sum their contributions.
//!
//! Grad mode is a per-thread switch; [`no_grad`] turns it off for a closure
//! and restores it on every exit path, including unwinding.

use std::cell::Cell;
use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{DiffError, Result};
use crate::ops::Buffer;
use crate::tensor::Tensor;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether operations currently record onto the tape.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

struct GradModeGuard {
    prev: bool,
}

impl GradModeGuard {
    fn set(enabled: bool) -> Self {
        let prev = GRAD_ENABLED.with(|g| g.replace(enabled));
        Self { prev }
    }
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|g| g.set(self.prev));
    }
}

/// Run `f` with gradient tracking disabled.
pub fn no_grad<R>(f: impl FnOnce() -> R) -> R {
    let _guard = GradModeGuard::set(false);
    f()
}

/// Run `f` with gradient tracking enabled, even inside [`no_grad`].
pub fn enable_grad<R>(f: impl FnOnce() -> R) -> R {
    let _guard = GradModeGuard::set(true);
    f()
}

/// Backpropagate from `outputs`, seeding each with the matching entry of `grads`.
pub fn backward(outputs: &[Tensor], grads: &[Tensor]) -> Result<()> {
    if outputs.len() != grads.len() {
        return Err(DiffError::GradCount {
            outputs: outputs.len(),
            grads: grads.len(),
        });
    }
    for (index, (output, grad)) in outputs.iter().zip(grads).enumerate() {
        if !output.requires_grad() {
            return Err(DiffError::NoGradFn { index });
        }
        if output.shape() != grad.shape() {
            return Err(DiffError::ShapeMismatch {
                op: "backward seed",
                left: output.shape(),
                right: grad.shape(),
            });
        }
    }

    let (dag, index) = build_dag(outputs);

    let mut pending: HashMap<NodeIndex, Buffer> = HashMap::new();
    for (output, grad) in outputs.iter().zip(grads) {
        accumulate(&mut pending, index[&output.id()], grad.buffer())?;
    }

    // Edges point from inputs to results, so reverse topological order
    // visits every result before the tensors it was computed from.
    let order = toposort(&dag, None).map_err(|_| DiffError::Format("cycle in autograd tape".into()))?;
    for node in order.into_iter().rev() {
        let Some(grad) = pending.remove(&node) else {
            continue;
        };
        let tensor = &dag[node];
        match tensor.grad_fn() {
            Some(grad_fn) => {
                let input_grads = grad_fn.op.vjp(&grad_fn.saved, &grad)?;
                for (input, input_grad) in grad_fn.inputs.iter().zip(input_grads) {
                    if input.requires_grad() {
                        accumulate(&mut pending, index[&input.id()], input_grad)?;
                    }
                }
            }
            None => {
                let total = match tensor.grad_buffer() {
                    Some(mut existing) => {
                        existing.add_assign(&grad)?;
                        existing
                    }
                    None => grad,
                };
                tensor.set_grad_buffer(Some(total));
            }
        }
    }

    Ok(())
}

fn accumulate(pending: &mut HashMap<NodeIndex, Buffer>, node: NodeIndex, grad: Buffer) -> Result<()> {
    match pending.get_mut(&node) {
        Some(existing) => existing.add_assign(&grad),
        None => {
            pending.insert(node, grad);
            Ok(())
        }
    }
}

/// Collect the trainable part of the tape reachable from `outputs`.
fn build_dag(outputs: &[Tensor]) -> (DiGraph<Tensor, ()>, HashMap<usize, NodeIndex>) {
    let mut dag = DiGraph::new();
    let mut index: HashMap<usize, NodeIndex> = HashMap::new();
    let mut stack: Vec<Tensor> = Vec::new();

    for output in outputs {
        if !index.contains_key(&output.id()) {
            index.insert(output.id(), dag.add_node(output.clone()));
            stack.push(output.clone());
        }
    }

    while let Some(tensor) = stack.pop() {
        let Some(grad_fn) = tensor.grad_fn() else {
            continue;
        };
        let node = index[&tensor.id()];
        for input in grad_fn.inputs.iter().filter(|t| t.requires_grad()) {
            let input_node = match index.get(&input.id()) {
                Some(&n) => n,
                None => {
                    let n = dag.add_node(input.clone());
                    index.insert(input.id(), n);
                    stack.push(input.clone());
                    n
                }
            };
            dag.update_edge(input_node, node, ());
        }
    }

    (dag, index)
}
