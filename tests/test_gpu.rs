// tests/test_gpu.rs — the stages on a real wgpu device, validated against
// the CPU reference.
//
// Every test needs a Vulkan adapter and is #[ignore]d so `cargo test`
// passes in CI. Run with:
//   cargo test --test test_gpu -- --include-ignored
//
// When no adapter is available a test prints a notice and returns.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gf_stages::gpu::{DeviceProfile, GpuDevice};
use gf_stages::reference;
use gf_stages::runtime::KernelArg;
use gf_stages::{Device, DeviceError, Memory, Mult, MultRole, Pown, PownRole, Stage, StageInfo, Staging};

const W: u32 = 640;
const H: u32 = 480;
const N: usize = (W * H) as usize;

fn gpu() -> Option<Arc<GpuDevice>> {
    match GpuDevice::new() {
        Ok(gpu) => {
            eprintln!("[test] {gpu}");
            Some(Arc::new(gpu))
        }
        Err(e) => {
            eprintln!("Skipping test: GPU not available ({e})");
            None
        }
    }
}

fn random_image(seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..N).map(|_| rng.gen_range(0..=255) as f32).collect()
}

#[test]
#[ignore = "requires a GPU"]
fn gpu_mult_bit_exact() {
    let Some(dev) = gpu() else { return };
    let a = random_image(1);
    let b = random_image(2);
    let mut expected = vec![0.0; N];
    reference::mult(&a, &b, &mut expected);

    let mut m = Mult::new(dev, StageInfo::default()).unwrap();
    m.init(W, H, Staging::InputOutput).unwrap();
    m.write(MultRole::InA, Some(&a[..]), false, &[]).unwrap();
    m.write(MultRole::InB, Some(&b[..]), false, &[]).unwrap();
    m.run(&[]).unwrap();
    let out = m.read_vec(MultRole::Out).unwrap().unwrap();

    assert_eq!(out.len(), N);
    for (i, (g, e)) in out.iter().zip(&expected).enumerate() {
        assert_eq!(g.to_bits(), e.to_bits(), "element {i}: {g} vs {e}");
    }
}

#[test]
#[ignore = "requires a GPU"]
fn gpu_pown_cube_and_exponent_change() {
    let Some(dev) = gpu() else { return };
    let input = random_image(3);

    let mut p = Pown::new(dev, StageInfo::default()).unwrap();
    p.init(W, H, 3, Staging::InputOutput).unwrap();
    p.write(PownRole::In, Some(&input[..]), false, &[]).unwrap();
    p.run(&[]).unwrap();
    let cubed = p.read_vec(PownRole::Out).unwrap().unwrap();

    let mut expected = vec![0.0; N];
    reference::pown(&input, &mut expected, 3);
    for (g, e) in cubed.iter().zip(&expected) {
        assert!((g - e).abs() <= e.abs() * 1e-6, "{g} vs {e}");
    }

    p.set_exponent(5).unwrap();
    p.run(&[]).unwrap();
    let fifth = p.read_vec(PownRole::Out).unwrap().unwrap();
    reference::pown(&input, &mut expected, 5);
    for (g, e) in fifth.iter().zip(&expected) {
        assert!((g - e).abs() <= e.abs() * 1e-5, "{g} vs {e}");
    }
}

#[test]
#[ignore = "requires a GPU"]
fn gpu_chain_shares_device_buffer() {
    let Some(dev) = gpu() else { return };
    let x = random_image(4);
    let y = random_image(5);

    let mut pown = Pown::new(dev.clone(), StageInfo::default()).unwrap();
    pown.init(W, H, 2, Staging::Input).unwrap();
    let mut mult = Mult::new(dev.clone(), StageInfo::default()).unwrap();
    mult.bind(MultRole::InA, pown.get(PownRole::Out).unwrap().clone()).unwrap();
    mult.init(W, H, Staging::InputOutput).unwrap();

    let w1 = pown.write(PownRole::In, Some(&x[..]), false, &[]).unwrap().unwrap();
    let r1 = pown.run(&[w1]).unwrap();
    let w2 = mult.write(MultRole::InB, Some(&y[..]), false, &[]).unwrap().unwrap();
    let r2 = mult.run(&[r1, w2]).unwrap();
    let rd = mult.read(MultRole::Out, false, &[r2]).unwrap().unwrap();
    dev.wait(&[rd]).unwrap();

    let mut x2 = vec![0.0; N];
    reference::pown(&x, &mut x2, 2);
    let mut expected = vec![0.0; N];
    reference::mult(&x2, &y, &mut expected);
    assert_eq!(mult.staged(MultRole::Out).unwrap().unwrap(), expected);
}

#[test]
#[ignore = "requires a GPU"]
fn gpu_reinit_keeps_buffers() {
    let Some(dev) = gpu() else { return };
    let mut m = Mult::new(dev.clone(), StageInfo::default()).unwrap();
    m.init(W, H, Staging::InputOutput).unwrap();
    let before = m.get(MultRole::Out).unwrap().clone();
    m.init(W, H, Staging::InputOutput).unwrap();
    assert!(dev.same_buffer(&before, m.get(MultRole::Out).unwrap()));
}

#[test]
#[ignore = "requires a GPU"]
fn gpu_rpi_profile_workgroup_limits() {
    let mut gpu = match GpuDevice::new_with_profile(DeviceProfile::RaspberryPi) {
        Ok(gpu) => gpu,
        Err(e) => {
            eprintln!("Skipping test: GPU not available ({e})");
            return;
        }
    };
    assert_eq!(gpu.profile, DeviceProfile::RaspberryPi);
    assert_eq!(gpu.workgroup_size.lanes, 64);
    gpu.set_workgroup_size(256).expect("256 lanes fit the RPi profile");
    let err = gpu.set_workgroup_size(512).unwrap_err();
    assert!(matches!(err, DeviceError::WorkgroupTooLarge { total: 512, max: 256 }));

    // Stages still run with the recompiled programs.
    let mut m = Mult::new(Arc::new(gpu), StageInfo::default()).unwrap();
    m.init(16, 16, Staging::InputOutput).unwrap();
    let ones = vec![1.5; 256];
    m.write(MultRole::InA, Some(&ones[..]), false, &[]).unwrap();
    m.write(MultRole::InB, Some(&ones[..]), false, &[]).unwrap();
    m.run(&[]).unwrap();
    assert_eq!(m.read_vec(MultRole::Out).unwrap().unwrap(), vec![2.25; 256]);
}

#[test]
#[ignore = "requires a GPU"]
fn gpu_kernel_keeps_compiled_workgroup_size() {
    let mut gpu = match GpuDevice::new() {
        Ok(gpu) => gpu,
        Err(e) => {
            eprintln!("Skipping test: GPU not available ({e})");
            return;
        }
    };
    assert_eq!(gpu.workgroup_size.lanes, 128);
    let mut kernel = gpu.create_kernel(0, "mult").unwrap();

    // Programs compiled from here on use 256 lanes; `kernel` still has 128.
    gpu.set_workgroup_size(256).unwrap();

    let len = 4096;
    let global = len / 4;
    let a_host = gpu.alloc("a_host", len, Memory::StagingIn).unwrap();
    let out_host = gpu.alloc("out_host", len, Memory::StagingOut).unwrap();
    let a = gpu.alloc("a", len, Memory::ReadOnly).unwrap();
    let out = gpu.alloc("out", len, Memory::WriteOnly).unwrap();

    gpu.write_host(&a_host, &vec![3.0; len]).unwrap();
    gpu.enqueue_copy(&a_host, &a, len, true, &[]).unwrap();
    gpu.set_arg(&mut kernel, 0, KernelArg::Buffer(&a)).unwrap();
    gpu.set_arg(&mut kernel, 1, KernelArg::Buffer(&a)).unwrap();
    gpu.set_arg(&mut kernel, 2, KernelArg::Buffer(&out)).unwrap();
    let done = gpu.enqueue_kernel(&mut kernel, global, &[]).unwrap();
    gpu.enqueue_copy(&out, &out_host, len, true, &[done]).unwrap();

    let result = gpu.read_host(&out_host).unwrap();
    assert!(result.iter().all(|&v| v == 9.0), "every vector must be covered");
}
