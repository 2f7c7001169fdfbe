use briny_grad::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const FEATURES: usize = 8;
const HIDDEN: usize = 32;
const CLASSES: usize = 3;
const EXAMPLES: usize = 600;
const EPOCHS: usize = 20;
const LR: f64 = 0.2;
const BATCH: usize = 50;

/// Gaussian-ish clusters around one random centre per class.
fn synthetic(rng: &mut StdRng) -> Result<(NdArray, Vec<usize>)> {
    let centres: Vec<Vec<f64>> = (0..CLASSES)
        .map(|_| (0..FEATURES).map(|_| rng.random_range(-2.0..2.0)).collect())
        .collect();

    let mut data = Vec::with_capacity(EXAMPLES * FEATURES);
    let mut labels = Vec::with_capacity(EXAMPLES);
    for i in 0..EXAMPLES {
        let label = i % CLASSES;
        labels.push(label);
        for &c in &centres[label] {
            let noise: f64 = (0..4).map(|_| rng.random_range(-0.5..0.5)).sum();
            data.push(c + noise);
        }
    }
    Ok((NdArray::new(vec![EXAMPLES, FEATURES], data)?, labels))
}

fn init(rng: &mut StdRng, rows: usize, cols: usize) -> Result<NdArray> {
    let scale = 1.0 / (cols as f64).sqrt();
    let data = (0..rows * cols)
        .map(|_| rng.random_range(-1.0..1.0) * scale)
        .collect();
    NdArray::new(vec![rows, cols], data)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut rng = StdRng::seed_from_u64(0);
    let (x, labels) = synthetic(&mut rng)?;

    let ctx = Context::builder().cpu(CpuBackend::new()).build();
    let mut w1 = ctx.parameter(init(&mut rng, FEATURES, HIDDEN)?);
    let mut w2 = ctx.parameter(init(&mut rng, HIDDEN, CLASSES)?);
    let inputs = ctx.constant(x.clone());

    println!("Beginning training...");
    for epoch in 0..EPOCHS {
        (w1, w2) = nn::nn_epoch(&ctx, &x, &labels, w1, w2, LR, BATCH)?;
        let logits = inputs.matmul(&w1)?.relu()?.matmul(&w2)?;
        let (loss, err) = nn::loss_err(&logits, &labels)?;
        println!("epoch {epoch:>2}: loss={loss:.4}, error={err:.3}");
    }
    Ok(())
}
