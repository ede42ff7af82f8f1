//! Fitting an MLP with graft-diff
//!
//! Run with: cargo run -p graft-diff --example fit_mlp
//!
//! This example demonstrates:
//! - Building a network from `Linear`/`Tanh` modules
//! - Training loop: forward -> loss -> backward -> clip -> step -> zero_grad
//! - Saving a state dict and loading it into a fresh model

use std::collections::BTreeMap;

use graft_diff::nn::{IValue, Linear, Model, Sequential, Tanh};
use graft_diff::optim::{clip_grad_norm, Optimizer};
use graft_diff::{backward, serialize, Device, Result, Tensor};

fn network(seed: u64) -> Model {
    Model::new(
        Sequential::new()
            .add(Linear::new(2, 16, seed))
            .add(Tanh)
            .add(Linear::new(16, 1, seed + 1)),
    )
}

/// Points on a plane: `y = x0 - 2 * x1`.
fn data(n: usize) -> Result<(Tensor, Tensor)> {
    let x = Tensor::randn(vec![n, 2], 1.0, 42);
    let y: Vec<f32> = x.to_vec().chunks(2).map(|r| r[0] - 2.0 * r[1]).collect();
    Ok((x, Tensor::from_vec(vec![n, 1], y)?))
}

fn forward(model: &Model, x: &Tensor) -> Result<Tensor> {
    let out = model.forward(&[IValue::Tensor(x.clone())], &BTreeMap::new())?;
    out.as_tensor()
        .cloned()
        .ok_or_else(|| graft_diff::DiffError::Format("expected a tensor output".into()))
}

fn mse(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff = pred.sub(target)?;
    diff.mul(&diff)?.sum()?.scale(1.0 / pred.numel() as f32)
}

fn main() -> Result<()> {
    println!("=== Fitting an MLP ===\n");

    // -------------------------------------------------------------------------
    // 1. Train
    // -------------------------------------------------------------------------
    println!("1. Training with Adam");
    println!("---------------------");
    let model = network(1);
    let (x, y) = data(64)?;
    let mut optimizer = Optimizer::adam(model.parameters(), 0.02, (0.9, 0.999), 1e-8, 0.0);
    for epoch in 0..150 {
        let loss = mse(&forward(&model, &x)?, &y)?;
        backward(&[loss.clone()], &[Tensor::scalar(1.0)])?;
        clip_grad_norm(&model.parameters(), 5.0)?;
        optimizer.step()?;
        optimizer.zero_grad();
        if epoch % 30 == 0 {
            println!("  epoch {epoch:3}: loss = {:.4}", loss.to_vec()[0]);
        }
    }
    println!();

    // -------------------------------------------------------------------------
    // 2. Save and load
    // -------------------------------------------------------------------------
    println!("2. State dicts");
    println!("--------------");
    let bytes = serialize::save(&model.state_dict())?;
    let mut fresh = network(7);
    fresh.load_state_dict(&serialize::load(&bytes, Device::Cpu)?, true)?;
    let loss = mse(&forward(&fresh, &x)?, &y)?;
    println!("  {} bytes, reloaded loss = {:.4}", bytes.len(), loss.to_vec()[0]);

    Ok(())
}
