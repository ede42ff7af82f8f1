//! Training a Wrapped Model
//!
//! Run with: cargo run -p graft-shim --example train_wrapped
//! Add `RUST_LOG=graft_shim=debug` to see what the shim does each step.
//!
//! This example demonstrates:
//! - A `graft-diff` network wrapped as an `Array`-in/`Array`-out layer
//! - A native training loop: forward -> loss -> backprop -> finish_update
//! - Evaluating with averaged parameters through `use_params`
//! - Saving and restoring the shim with `to_bytes`/`from_bytes`

use graft_core::{Array, Layer, Optimizer};
use graft_diff::nn::{Linear, Sequential, Tanh};
use graft_shim::{diff_shim, ShimError, ShimLayer};
use tracing_subscriber::EnvFilter;

/// `y = 0.5 * x0 - x1 + 0.25 * x2`
fn batch(size: usize, seed: u64) -> (Array, Array) {
    let x = Array::randn_seeded(vec![size, 3], 1.0, seed);
    let y = x
        .data
        .chunks(3)
        .map(|row| 0.5 * row[0] - row[1] + 0.25 * row[2])
        .collect();
    (x, Array::matrix(size, 1, y))
}

/// Mean squared error and its gradient.
fn mse(pred: &Array, target: &Array) -> Result<(f32, Array), ShimError> {
    let diff = pred.sub(target)?;
    let n = diff.size() as f32;
    let loss = diff.data.iter().map(|d| d * d).sum::<f32>() / n;
    Ok((loss, diff.scale(2.0 / n)))
}

fn main() -> Result<(), ShimError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Training a Wrapped Model ===\n");

    // -------------------------------------------------------------------------
    // 1. Wrap
    // -------------------------------------------------------------------------
    let net = Sequential::new()
        .add(Linear::new(3, 16, 1))
        .add(Tanh)
        .add(Linear::new(16, 1, 2));
    let mut layer = ShimLayer::new(diff_shim(net, serde_json::json!({"widths": [3, 16, 1]})));
    let mut optimizer = Optimizer::adam(0.01);

    // -------------------------------------------------------------------------
    // 2. Train
    // -------------------------------------------------------------------------
    println!("1. Training");
    println!("-----------");
    let (x_eval, y_eval) = batch(64, 1000);
    for step in 0..200 {
        let (x, y) = batch(32, step);
        let (pred, backprop) = layer.call(x, true)?;
        let (loss, d_pred) = mse(&pred, &y)?;
        backprop(d_pred)?;
        layer.finish_update(&mut optimizer)?;
        if step % 40 == 0 {
            println!("  step {step:3}: loss = {loss:.4}");
        }
    }
    println!();

    // -------------------------------------------------------------------------
    // 3. Evaluate with live and averaged parameters
    // -------------------------------------------------------------------------
    println!("2. Evaluation");
    println!("-------------");
    let (live, _) = mse(&layer.predict(x_eval.clone())?, &y_eval)?;
    let averages = optimizer.averages.clone().unwrap_or_default();
    let averaged = layer.use_params(&averages, |l| l.predict(x_eval.clone()))??;
    let (averaged, _) = mse(&averaged, &y_eval)?;
    println!("  live parameters:     {live:.4}");
    println!("  averaged parameters: {averaged:.4}");
    println!();

    // -------------------------------------------------------------------------
    // 4. Save and restore
    // -------------------------------------------------------------------------
    println!("3. Persistence");
    println!("--------------");
    let bytes = layer.shim().to_bytes()?;
    let blank = Sequential::new()
        .add(Linear::new(3, 16, 7))
        .add(Tanh)
        .add(Linear::new(16, 1, 8));
    let mut restored = ShimLayer::new(diff_shim(blank, serde_json::Value::Null));
    restored.shim_mut().from_bytes(&bytes)?;
    let (reloaded, _) = mse(&restored.predict(x_eval)?, &y_eval)?;
    println!("  {} bytes, config = {}", bytes.len(), restored.shim().config());
    println!("  restored loss:       {reloaded:.4}");

    Ok(())
}
