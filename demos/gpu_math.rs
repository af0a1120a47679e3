// demos/gpu_math.rs — squared and masked intensity of an image on the GPU.
//
// Loads an image (or generates a gradient), runs
//
//   sq  = Pown(I, 2)
//   out = Mult(I, vignette)
//
// on the GPU, checks both against the CPU reference and writes them out as
// greyscale PNGs.
//
// USAGE
// ─────
//   cargo run --example gpu_math                      # generated gradient
//   cargo run --example gpu_math -- path/to/img.png   # any image file
//   RUST_LOG=gf_stages=debug cargo run --example gpu_math
//
// Falls back to the host device when no GPU adapter is found.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use gf_stages::gpu::GpuDevice;
use gf_stages::reference;
use gf_stages::{Device, HostDevice, Mult, MultRole, OrExit, Pown, PownRole, Stage, StageInfo, Staging};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (w, h, pixels) = match args.get(1) {
        Some(path) => load_image(path),
        None => {
            eprintln!("[gpu_math] no image path given, using generated gradient");
            gradient(640, 480)
        }
    };

    match GpuDevice::new() {
        Ok(gpu) => {
            eprintln!("[gpu_math] {gpu}");
            run(Arc::new(gpu), w, h, &pixels);
        }
        Err(e) => {
            eprintln!("[gpu_math] {e}; falling back to the host device");
            run(Arc::new(HostDevice::new()), w, h, &pixels);
        }
    }
}

fn run<D: Device>(dev: Arc<D>, w: u32, h: u32, intensity: &[f32]) {
    let vignette = vignette(w, h);

    let mut pown = Pown::new(dev.clone(), StageInfo::default()).or_exit();
    pown.init(w, h, 2, Staging::InputOutput).or_exit();
    let mut mult = Mult::new(dev, StageInfo::default()).or_exit();
    mult.init(w, h, Staging::InputOutput).or_exit();

    pown.write(PownRole::In, Some(intensity), false, &[]).or_exit();
    let t_pown = pown.run_timed(&[]).or_exit();
    let squared = pown.read_vec(PownRole::Out).or_exit().unwrap_or_default();

    mult.write(MultRole::InA, Some(intensity), false, &[]).or_exit();
    mult.write(MultRole::InB, Some(&vignette[..]), false, &[]).or_exit();
    let t_mult = mult.run_timed(&[]).or_exit();
    let masked = mult.read_vec(MultRole::Out).or_exit().unwrap_or_default();

    let mut expect_sq = vec![0.0; intensity.len()];
    reference::pown(intensity, &mut expect_sq, 2);
    let mut expect_masked = vec![0.0; intensity.len()];
    reference::mult(intensity, &vignette, &mut expect_masked);

    println!("pown  n=2  {:>8.3} ms  max err {:.3e}", ms(t_pown), max_err(&squared, &expect_sq));
    println!("mult       {:>8.3} ms  max err {:.3e}", ms(t_mult), max_err(&masked, &expect_masked));

    save("gpu_math_squared.png", w, h, &squared);
    save("gpu_math_masked.png", w, h, &masked);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ms(d: std::time::Duration) -> f64 {
    d.as_secs_f64() * 1e3
}

fn max_err(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

/// Load any image format supported by the `image` crate as greyscale in
/// [0, 1], cropped so the pixel count is a multiple of 4.
fn load_image(path: &str) -> (u32, u32, Vec<f32>) {
    let img = image::open(path)
        .unwrap_or_else(|e| panic!("failed to open {path}: {e}"))
        .to_luma8();
    let (w, h) = img.dimensions();
    let w = w - w % 4;
    let pixels = (0..h)
        .flat_map(|y| (0..w).map(move |x| (x, y)))
        .map(|(x, y)| img.get_pixel(x, y)[0] as f32 / 255.0)
        .collect();
    (w, h, pixels)
}

fn gradient(w: u32, h: u32) -> (u32, u32, Vec<f32>) {
    let pixels = (0..w * h)
        .map(|i| ((i % w) as f32 / w as f32 + (i / w) as f32 / h as f32) * 0.5)
        .collect();
    (w, h, pixels)
}

/// Radial falloff, 1 at the centre to 0 at the corners.
fn vignette(w: u32, h: u32) -> Vec<f32> {
    let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
    let r_max = (cx * cx + cy * cy).sqrt();
    (0..w * h)
        .map(|i| {
            let dx = (i % w) as f32 - cx;
            let dy = (i / w) as f32 - cy;
            1.0 - (dx * dx + dy * dy).sqrt() / r_max
        })
        .collect()
}

fn save(path: &str, w: u32, h: u32, data: &[f32]) {
    let bytes: Vec<u8> = data.iter().map(|v| (v.clamp(0.0, 1.0) * 255.0) as u8).collect();
    match image::GrayImage::from_raw(w, h, bytes) {
        Some(img) => match img.save(path) {
            Ok(()) => eprintln!("[gpu_math] wrote {path}"),
            Err(e) => eprintln!("[gpu_math] failed to write {path}: {e}"),
        },
        None => eprintln!("[gpu_math] {path}: no data to write"),
    }
}
