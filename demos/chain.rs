// demos/chain.rs — two stages chained through a shared device buffer.
//
//   in ──▶ Pown(n) ──out══in_a──▶ Mult ──▶ out
//                         in_b ◀── weights
//
// Mult's first input is Pown's output buffer, bound before Mult's init, so
// the intermediate never leaves the device. Work is ordered with completion
// tokens only; the single blocking call is the final read.
//
//   cargo run --example chain            # n = 3
//   cargo run --example chain -- 5       # n = 5

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use gf_stages::gpu::GpuDevice;
use gf_stages::reference;
use gf_stages::{Device, HostDevice, Mult, MultRole, OrExit, Pown, PownRole, Stage, StageInfo, Staging};

const W: u32 = 752;
const H: u32 = 480;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let n: i32 = std::env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(3);

    match GpuDevice::new() {
        Ok(gpu) => {
            eprintln!("[chain] {gpu}");
            chain(Arc::new(gpu), n);
        }
        Err(e) => {
            eprintln!("[chain] {e}; falling back to the host device");
            chain(Arc::new(HostDevice::new()), n);
        }
    }
}

fn chain<D: Device>(dev: Arc<D>, n: i32) {
    let len = (W * H) as usize;
    let input: Vec<f32> = (0..len).map(|i| (i % 17) as f32 / 16.0).collect();
    let weights: Vec<f32> = (0..len).map(|i| if (i / W as usize) % 2 == 0 { 1.0 } else { 0.5 }).collect();

    // Producer: only needs to upload its input.
    let mut pown = Pown::new(dev.clone(), StageInfo::default()).or_exit();
    pown.init(W, H, n, Staging::Input).or_exit();

    // Consumer: in_a is the producer's output, bound before init.
    let mut mult = Mult::new(dev.clone(), StageInfo::default()).or_exit();
    let Some(shared) = pown.get(PownRole::Out).cloned() else {
        eprintln!("[chain] pown output missing after init");
        std::process::exit(1);
    };
    mult.bind(MultRole::InA, shared).or_exit();
    mult.init(W, H, Staging::InputOutput).or_exit();

    let w_in = pown.write(PownRole::In, Some(&input[..]), false, &[]).or_exit();
    let r_pown = pown.run(w_in.as_slice()).or_exit();
    let w_wt = mult.write(MultRole::InB, Some(&weights[..]), false, &[]).or_exit();

    let mut deps = vec![r_pown];
    deps.extend(w_wt);
    let r_mult = mult.run(&deps).or_exit();
    mult.read(MultRole::Out, true, &[r_mult]).or_exit();
    let out = mult.staged(MultRole::Out).or_exit().unwrap_or_default();

    let mut powered = vec![0.0; len];
    reference::pown(&input, &mut powered, n);
    let mut expected = vec![0.0; len];
    reference::mult(&powered, &weights, &mut expected);

    let max_err = out.iter().zip(&expected).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max);
    println!("chain  {W}x{H}  n={n}  max err vs reference: {max_err:.3e}");
}
