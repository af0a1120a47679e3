// tests/test_math.rs — Mult and Pown through the full stage lifecycle on the
// host reference device.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gf_stages::reference;
use gf_stages::{
    ConfigError, Device, DeviceError, HostDevice, Memory, Mult, MultRole, Placement, Pown,
    PownRole, Stage, StageError, StageInfo, Staging,
};

const W: u32 = 640;
const H: u32 = 480;
const N: usize = (W * H) as usize;

/// Random intensities in [0, 255], like an 8-bit image promoted to f32.
fn random_image(seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..N).map(|_| rng.gen_range(0..=255) as f32).collect()
}

fn host() -> Arc<HostDevice> {
    Arc::new(HostDevice::new())
}

// ===== Dimension validation =====

#[test]
fn zero_elements_is_config_error() {
    let mut m = Mult::new(host(), StageInfo::default()).unwrap();
    let err = m.try_init(0, 480, Staging::InputOutput).unwrap_err();
    assert!(err.is_fatal_config());
    assert!(matches!(err, StageError::Config(ConfigError::ZeroElements { .. })));
}

#[test]
fn non_vector_multiple_is_config_error() {
    let mut p = Pown::new(host(), StageInfo::default()).unwrap();
    let err = p.try_init(3, 3, 2, Staging::InputOutput).unwrap_err();
    assert!(matches!(
        err,
        StageError::Config(ConfigError::NotVectorMultiple { count: 9, vector_width: 4 })
    ));
    assert!(!p.is_configured());
}

#[test]
fn vga_dimensions_are_valid() {
    let mut m = Mult::new(host(), StageInfo::default()).unwrap();
    m.try_init(W, H, Staging::InputOutput).unwrap();
    assert!(m.is_configured());
    assert_eq!((m.width(), m.height(), m.len()), (W, H, N));
    assert_eq!(m.staging(), Staging::InputOutput);
}

#[test]
fn operations_before_init_fail() {
    let mut m = Mult::new(host(), StageInfo::default()).unwrap();
    let err = m.run(&[]).unwrap_err();
    assert!(matches!(err, StageError::Config(ConfigError::NotInitialized { stage: "Mult" })));
    assert!(m.write(MultRole::InA, None, true, &[]).is_err());
    assert!(m.read(MultRole::Out, true, &[]).is_err());
    assert_eq!(m.len(), 0);
}

// ===== Numerics =====

#[test]
fn mult_matches_reference_bit_exact() {
    let a = random_image(1);
    let b = random_image(2);
    let mut expected = vec![0.0; N];
    reference::mult(&a, &b, &mut expected);

    let mut m = Mult::new(host(), StageInfo::default()).unwrap();
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
fn pown_cube_within_tolerance() {
    let input = random_image(3);
    let mut expected = vec![0.0; N];
    reference::pown(&input, &mut expected, 3);

    let mut p = Pown::new(host(), StageInfo::default()).unwrap();
    p.init(W, H, 3, Staging::InputOutput).unwrap();
    p.write(PownRole::In, Some(&input[..]), false, &[]).unwrap();
    p.run(&[]).unwrap();
    let out = p.read_vec(PownRole::Out).unwrap().unwrap();

    for (g, e) in out.iter().zip(&expected) {
        assert!((g - e).abs() <= e.abs() * 1e-6, "{g} vs {e}");
    }
}

#[test]
fn set_exponent_applies_to_next_run() {
    let input = random_image(4);
    let mut p = Pown::new(host(), StageInfo::default()).unwrap();
    p.init(W, H, 2, Staging::InputOutput).unwrap();
    p.write(PownRole::In, Some(&input[..]), true, &[]).unwrap();

    p.set_exponent(5).unwrap();
    assert_eq!(p.exponent(), 5);
    p.run(&[]).unwrap();
    let out = p.read_vec(PownRole::Out).unwrap().unwrap();

    let mut expected = vec![0.0; N];
    reference::pown(&input, &mut expected, 5);
    assert_eq!(out, expected);
}

#[test]
fn staged_input_then_write_without_data() {
    // Fill the staging buffer directly, then transfer it with no data.
    let a = random_image(5);
    let b = vec![2.0; N];
    let mut m = Mult::new(host(), StageInfo::default()).unwrap();
    m.init(W, H, Staging::InputOutput).unwrap();

    assert!(m.stage_input(MultRole::InA, &a).unwrap());
    assert!(m.stage_input(MultRole::InB, &b).unwrap());
    assert_eq!(m.staged(MultRole::InA).unwrap().unwrap(), a);
    m.write(MultRole::InA, None, false, &[]).unwrap();
    m.write(MultRole::InB, None, false, &[]).unwrap();
    m.run(&[]).unwrap();

    let out = m.read_vec(MultRole::Out).unwrap().unwrap();
    let doubled: Vec<f32> = a.iter().map(|x| x * 2.0).collect();
    assert_eq!(out, doubled);
}

#[test]
fn short_input_is_rejected() {
    let mut m = Mult::new(host(), StageInfo::default()).unwrap();
    m.init(4, 4, Staging::InputOutput).unwrap();
    let err = m.write(MultRole::InA, Some(&[1.0; 8][..]), true, &[]).unwrap_err();
    assert!(matches!(
        err,
        StageError::Config(ConfigError::InputLength { expected: 16, actual: 8 })
    ));
    assert_eq!(err.code(), "INPUT_LENGTH");
}

// ===== Staging policies =====

#[test]
fn output_only_policy_makes_write_a_noop() {
    let mut m = Mult::new(host(), StageInfo::default()).unwrap();
    m.init(4, 4, Staging::Output).unwrap();

    let token = m.write(MultRole::InA, Some(&[3.0; 16][..]), true, &[]).unwrap();
    assert!(token.is_none());
    assert!(m.get_host(MultRole::InA).is_none());
    assert!(m.get_host(MultRole::Out).is_some());
    assert!(m.get(MultRole::InA).is_some());

    // Device inputs are untouched (still zero), so the product is zero.
    m.run(&[]).unwrap();
    assert_eq!(m.read_vec(MultRole::Out).unwrap().unwrap(), vec![0.0; 16]);
    assert!(m.is_configured());
}

#[test]
fn input_only_policy_makes_read_a_noop() {
    let mut p = Pown::new(host(), StageInfo::default()).unwrap();
    p.init(4, 4, 2, Staging::Input).unwrap();
    assert!(p.write(PownRole::In, Some(&[3.0; 16][..]), true, &[]).unwrap().is_some());
    p.run(&[]).unwrap();
    assert!(p.read(PownRole::Out, true, &[]).unwrap().is_none());
    assert!(p.read_vec(PownRole::Out).unwrap().is_none());
    assert!(p.staged(PownRole::Out).unwrap().is_none());
}

#[test]
fn none_policy_allocates_only_device_buffers() {
    let mut m = Mult::new(host(), StageInfo::default()).unwrap();
    m.init(4, 4, Staging::None).unwrap();
    for role in [MultRole::InA, MultRole::InB, MultRole::Out] {
        assert!(m.get_host(role).is_none(), "{role:?}");
        assert!(m.get(role).is_some(), "{role:?}");
    }
    assert!(m.write(MultRole::InA, Some(&[1.0; 16][..]), true, &[]).unwrap().is_none());
    assert!(!m.stage_input(MultRole::InA, &[1.0; 16]).unwrap());
}

#[test]
fn bound_staging_is_ignored_outside_policy() {
    let dev = host();
    let staging_in = dev.alloc("external_in", 16, Memory::StagingIn).unwrap();
    let mut m = Mult::new(dev, StageInfo::default()).unwrap();
    m.bind_host(MultRole::InA, staging_in);
    m.init(4, 4, Staging::None).unwrap();

    // The shared buffer stays bound, but the policy stages nothing.
    assert!(m.get_host(MultRole::InA).is_some());
    assert!(!m.stage_input(MultRole::InA, &[2.0; 16]).unwrap());
    assert!(m.staged(MultRole::InA).unwrap().is_none());

    m.init(4, 4, Staging::Input).unwrap();
    assert!(m.stage_input(MultRole::InA, &[2.0; 16]).unwrap());
    assert_eq!(m.staged(MultRole::InA).unwrap().unwrap(), vec![2.0; 16]);
}

#[test]
fn device_buffers_use_role_memory_kinds() {
    let m = {
        let mut m = Mult::new(host(), StageInfo::default()).unwrap();
        m.init(4, 4, Staging::InputOutput).unwrap();
        m
    };
    assert_eq!(m.get(MultRole::InA).unwrap().memory(), Memory::ReadOnly);
    assert_eq!(m.get(MultRole::Out).unwrap().memory(), Memory::WriteOnly);
    assert_eq!(m.get_host(MultRole::InB).unwrap().memory(), Memory::StagingIn);
    assert_eq!(m.get_host(MultRole::Out).unwrap().memory(), Memory::StagingOut);
}

// ===== Re-initialisation =====

#[test]
fn reinit_with_same_dims_is_idempotent() {
    let dev = host();
    let a = random_image(6);
    let b = random_image(7);
    let mut m = Mult::new(dev.clone(), StageInfo::default()).unwrap();

    m.init(W, H, Staging::InputOutput).unwrap();
    let out_before = m.get(MultRole::Out).unwrap().clone();
    let host_before = m.get_host(MultRole::InA).unwrap().clone();
    m.write(MultRole::InA, Some(&a[..]), false, &[]).unwrap();
    m.write(MultRole::InB, Some(&b[..]), false, &[]).unwrap();
    m.run(&[]).unwrap();
    let first = m.read_vec(MultRole::Out).unwrap().unwrap();

    m.init(W, H, Staging::InputOutput).unwrap();
    assert!(dev.same_buffer(&out_before, m.get(MultRole::Out).unwrap()));
    assert!(dev.same_buffer(&host_before, m.get_host(MultRole::InA).unwrap()));
    m.write(MultRole::InA, Some(&a[..]), false, &[]).unwrap();
    m.write(MultRole::InB, Some(&b[..]), false, &[]).unwrap();
    m.run(&[]).unwrap();
    let second = m.read_vec(MultRole::Out).unwrap().unwrap();

    assert_eq!(first, second);
}

#[test]
fn reinit_with_new_dims_reallocates_owned_and_keeps_shared() {
    let dev = host();
    let shared = dev.alloc("shared", 64, Memory::ReadWrite).unwrap();
    let mut m = Mult::new(dev.clone(), StageInfo::default()).unwrap();
    m.bind(MultRole::InA, shared.clone()).unwrap();

    m.init(4, 4, Staging::InputOutput).unwrap();
    let out_small = m.get(MultRole::Out).unwrap().clone();
    assert_eq!(dev.buffer_len(&out_small), 16);

    m.init(8, 8, Staging::InputOutput).unwrap();
    let out_large = m.get(MultRole::Out).unwrap();
    assert!(!dev.same_buffer(&out_small, out_large));
    assert_eq!(dev.buffer_len(out_large), 64);
    assert!(dev.same_buffer(&shared, m.get(MultRole::InA).unwrap()));
    assert!(m.core().slot(Placement::Device, MultRole::InA).is_shared());
}

#[test]
fn invalid_reinit_keeps_previous_configuration() {
    let mut m = Mult::new(host(), StageInfo::default()).unwrap();
    m.init(4, 4, Staging::InputOutput).unwrap();
    assert!(m.try_init(5, 1, Staging::InputOutput).is_err());
    // Validation runs before any state changes.
    assert!(m.is_configured());
    assert_eq!(m.len(), 16);
}

// ===== Device failures =====

#[test]
fn allocation_failure_is_reported_not_fatal() {
    let dev = Arc::new(HostDevice::new().with_memory_limit(1024));
    let mut m = Mult::new(dev, StageInfo::default()).unwrap();
    let err = m.init(W, H, Staging::InputOutput).unwrap_err();
    assert!(matches!(err, StageError::Device(DeviceError::OutOfMemory { .. })));
    assert_eq!(err.code(), "MEM_OBJECT_ALLOCATION_FAILURE");
    assert!(!m.is_configured());
}

#[test]
fn init_retry_after_failed_staging_setup() {
    // Input staging is shared and fits; the 64-byte owned allocations do not.
    let dev = Arc::new(HostDevice::new().with_memory_limit(32));
    let staging_in = dev.alloc("external_in", 8, Memory::StagingIn).unwrap();
    let mut m = Mult::new(dev.clone(), StageInfo::default()).unwrap();
    m.bind_host(MultRole::InA, staging_in);

    let err = m.init(4, 4, Staging::InputOutput).unwrap_err();
    assert!(matches!(err, StageError::Device(DeviceError::OutOfMemory { .. })));
    assert_eq!(dev.pending_touches(), 0);

    m.init(2, 4, Staging::InputOutput).unwrap();
    assert_eq!(dev.pending_touches(), 0);
    assert!(m.is_configured());
}

// ===== Ordering =====

#[test]
fn non_blocking_tokens_chain_in_order() {
    let dev = host();
    let a = random_image(8);
    let mut m = Mult::new(dev.clone(), StageInfo::default()).unwrap();
    m.init(W, H, Staging::InputOutput).unwrap();

    let wa = m.write(MultRole::InA, Some(&a[..]), false, &[]).unwrap().unwrap();
    let wb = m.write(MultRole::InB, Some(&a[..]), false, &[]).unwrap().unwrap();
    let run = m.run(&[wa, wb]).unwrap();
    let read = m.read(MultRole::Out, false, &[run]).unwrap().unwrap();
    assert!(read > run && run > wb && wb > wa);
    dev.wait(&[read]).unwrap();

    let out = m.staged(MultRole::Out).unwrap().unwrap();
    let squared: Vec<f32> = a.iter().map(|x| x * x).collect();
    assert_eq!(out, squared);
}

#[test]
fn run_timed_reports_duration() {
    let mut p = Pown::new(host(), StageInfo::default()).unwrap();
    p.init(W, H, 2, Staging::None).unwrap();
    let elapsed = p.run_timed(&[]).unwrap();
    assert!(elapsed.as_secs() < 10);
}
