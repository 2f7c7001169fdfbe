use briny_grad::approx::{ApproxEquality, approx_eq};
use briny_grad::backprop::{self, GradMode};
use briny_grad::backend::Backend;
use briny_grad::graph::{Context, EvalMode};
use briny_grad::ops::Operator;
use briny_grad::{AutogradError, NdArray, Tensor, array, nn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn random(rng: &mut StdRng, shape: &[usize]) -> NdArray {
    let n = shape.iter().product();
    let data = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
    NdArray::new(shape.to_vec(), data).unwrap()
}

#[test]
fn test_shape_mismatch_is_an_error() {
    let ctx = Context::cpu();
    let a = ctx.parameter(NdArray::ones(&[2, 3]));
    let b = ctx.parameter(NdArray::ones(&[4, 3]));
    let err = a.add(&b).unwrap_err();
    assert!(matches!(err, AutogradError::ShapeMismatch { op: "add", .. }));
}

#[test]
fn test_add_backprop_scalar() {
    let ctx = Context::cpu();
    let a = ctx.parameter(array!(2.0));
    let b = ctx.parameter(array!(3.0));
    let y = (&a + &b).unwrap();
    y.backward().unwrap();
    assert_eq!(y.item().unwrap(), 5.0);
    assert_eq!(a.grad().unwrap().item().unwrap(), 1.0);
    assert_eq!(b.grad().unwrap().item().unwrap(), 1.0);
}

#[test]
fn test_mul_backprop_scalar() {
    let ctx = Context::cpu();
    let a = ctx.parameter(array!(2.0));
    let b = ctx.parameter(array!(3.0));
    let y = (&a * &b).unwrap();
    y.backward().unwrap();
    assert_eq!(y.item().unwrap(), 6.0);
    assert_eq!(a.grad().unwrap().item().unwrap(), 3.0);
    assert_eq!(b.grad().unwrap().item().unwrap(), 2.0);
}

#[test]
fn test_broadcast_gradient_reduction() {
    let ctx = Context::cpu();
    let x = ctx.parameter(array!([[1.0], [2.0], [3.0]]));
    let y = x.broadcast_to(&[3, 4]).unwrap().sum(None).unwrap();
    y.backward().unwrap();
    let grad = x.grad().unwrap();
    assert_eq!(grad.shape().unwrap(), &[3, 1]);
    assert!(grad.realize().unwrap().data().iter().all(|&g| g == 4.0));
}

#[test]
fn test_implicit_broadcast_in_binary_ops() {
    let ctx = Context::cpu();
    let m = ctx.parameter(NdArray::ones(&[2, 3]));
    let bias = ctx.parameter(array!([1.0, 2.0, 3.0]));
    let y = m.add(&bias).unwrap().sum(None).unwrap();
    assert_eq!(y.item().unwrap(), 18.0);
    y.backward().unwrap();
    assert_eq!(bias.grad().unwrap().to_array().unwrap(), array!([2.0, 2.0, 2.0]));
    assert_eq!(m.grad().unwrap().to_array().unwrap(), NdArray::ones(&[2, 3]));
}

#[test]
fn test_matmul_shapes() {
    let ctx = Context::cpu();
    let a = ctx.parameter(NdArray::ones(&[2, 3]));
    let b = ctx.parameter(NdArray::ones(&[3, 4]));
    assert_eq!(a.matmul(&b).unwrap().shape().unwrap(), &[2, 4]);
    let err = a.matmul(&a).unwrap_err();
    assert!(err.is_shape_mismatch());
}

#[test]
fn test_two_layer_forward() {
    let mut rng = StdRng::seed_from_u64(7);
    let ctx = Context::cpu();
    let x = ctx.constant(random(&mut rng, &[100, 784]));
    let w1 = ctx.parameter(random(&mut rng, &[784, 128]));
    let w2 = ctx.parameter(random(&mut rng, &[128, 10]));

    let logits = x.matmul(&w1).unwrap().relu().unwrap().matmul(&w2).unwrap();
    assert_eq!(logits.shape().unwrap(), &[100, 10]);
    assert!(logits.realize().unwrap().data().iter().all(|v| v.is_finite()));

    let labels: Vec<usize> = (0..100).map(|i| i % 10).collect();
    let y = nn::one_hot(&ctx, &labels, 10).unwrap();
    let loss = nn::softmax_loss(&logits, &y).unwrap();
    loss.backward().unwrap();
    assert_eq!(w1.grad().unwrap().shape().unwrap(), &[784, 128]);
    assert_eq!(w2.grad().unwrap().shape().unwrap(), &[128, 10]);
}

#[test]
fn test_relu_at_zero() {
    let ctx = Context::cpu();
    let x = ctx.parameter(array!([0.0]));
    x.relu().unwrap().backward().unwrap();
    assert_eq!(x.grad().unwrap().item().unwrap(), 0.0);
}

#[test]
fn test_accumulation_property() {
    let mut rng = StdRng::seed_from_u64(11);
    let value = random(&mut rng, &[3, 2]);
    let f = |v: &Tensor| v.exp().unwrap().sum(None).unwrap();
    let g = |v: &Tensor| v.mul(v).unwrap().mul_scalar(3.0).unwrap().sum(None).unwrap();

    let ctx = Context::cpu();
    let separate = |build: &dyn Fn(&Tensor) -> Tensor| {
        let v = ctx.parameter(value.clone());
        build(&v).backward().unwrap();
        v.grad().unwrap().to_array().unwrap()
    };
    let grad_f = separate(&f);
    let grad_g = separate(&g);

    let v = ctx.parameter(value.clone());
    f(&v).add(&g(&v)).unwrap().backward().unwrap();
    let joint = v.grad().unwrap().to_array().unwrap();

    let summed: Vec<f64> = grad_f.data().iter().zip(grad_g.data()).map(|(a, b)| a + b).collect();
    assert!(approx_eq(joint.data(), &summed[..]));
}

#[test]
fn test_backward_without_leaves_is_a_no_op() {
    let ctx = Context::cpu();
    let y = ctx.constant(array!([1.0, 2.0])).sum(None).unwrap();
    assert_eq!(backprop::backward(&y, None, GradMode::Overwrite).unwrap(), 0);
    y.backward().unwrap();
    assert!(y.grad().is_none());
}

#[test]
fn test_lazy_and_eager_agree() {
    let mut rng = StdRng::seed_from_u64(3);
    let xv = random(&mut rng, &[4, 5]);
    let wv = random(&mut rng, &[5, 2]);

    let run = |mode: EvalMode| {
        let ctx = Context::builder().mode(mode).build();
        let x = ctx.constant(xv.clone());
        let w = ctx.parameter(wv.clone());
        let loss = x.matmul(&w).unwrap().relu().unwrap().powi(2).unwrap().sum(None).unwrap();
        loss.backward().unwrap();
        (loss.item().unwrap(), w.grad().unwrap().to_array().unwrap())
    };
    let (eager_loss, eager_grad) = run(EvalMode::Eager);
    let (lazy_loss, lazy_grad) = run(EvalMode::Lazy);
    assert_eq!(eager_loss, lazy_loss);
    assert!(eager_grad.all_close(&lazy_grad, ApproxEquality::Precise));
}

#[test]
fn test_shared_lazy_node_realizes_from_many_threads() {
    let ctx = Context::builder().mode(EvalMode::Lazy).build();
    let x = ctx.parameter(NdArray::ones(&[64, 64]));
    let y = Arc::new(x.matmul(&x).unwrap().sum(None).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let y = Arc::clone(&y);
            thread::spawn(move || y.item().unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 64.0 * 64.0 * 64.0);
    }
}

static SLOW_COPIES: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct SlowCopy;

impl Operator for SlowCopy {
    fn name(&self) -> &'static str {
        "slow_copy"
    }

    fn arity(&self) -> usize {
        1
    }

    fn compute(&self, _: &dyn Backend, inputs: &[&NdArray]) -> briny_grad::Result<NdArray> {
        SLOW_COPIES.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        Ok(inputs[0].clone())
    }
}

#[test]
fn test_racing_threads_compute_a_lazy_node_once() {
    let ctx = Context::builder().mode(EvalMode::Lazy).build();
    let x = ctx.constant(array!([1.0, 2.0, 3.0]));
    let y = Arc::new(Tensor::from_op(Box::new(SlowCopy), vec![x]).unwrap());
    let start = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let y = Arc::clone(&y);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                y.to_array().unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), array!([1.0, 2.0, 3.0]));
    }
    assert_eq!(SLOW_COPIES.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deep_chain_does_not_overflow_the_stack() {
    let ctx = Context::builder().mode(EvalMode::Lazy).build();
    let x = ctx.parameter(array!([1.0]));
    let mut y = x.clone();
    for _ in 0..20_000 {
        y = y.add_scalar(1.0).unwrap();
    }
    assert_eq!(y.item().unwrap(), 20_001.0);
    y.backward().unwrap();
    assert_eq!(x.grad().unwrap().item().unwrap(), 1.0);
}
