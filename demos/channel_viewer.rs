// demos/channel_viewer.rs — per-channel extremes visualiser.
//
// Uploads a colour image to the configured device, splits it into planes,
// finds each plane's min/max and marks both locations, then displays the
// planes side by side in a single minifb window:
//
//   ┌──────────────────────────────────────────────┐
//   │  channel 0   │  channel 1   │  channel 2     │
//   └──────────────────────────────────────────────┘
//
// Minimum locations are boxed in black, maxima in white. Per-channel values
// are printed to stderr.
//
// USAGE
// ─────
//   cargo run --example channel_viewer                          # generated pattern
//   cargo run --example channel_viewer -- path/to/img.png       # any image file
//   cargo run --example channel_viewer -- path/to/img.png cfg.json
//                                                               # device config
//
// The config file follows `DeviceConfig` (backend / profile / max_bytes);
// DEVMAT_MAX_BYTES overrides the budget. RUST_LOG=debug shows device logs.

use std::path::Path;

use devmat::{
    load_config, open_device, Backend, Depth, Device, DeviceConfig, DeviceMat, Exec, HostImage,
    Rect, Scalar, Stream,
};

fn main() {
    env_logger::init();

    // --- Parse arguments ---
    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(2) {
        Some(path) => load_config(Path::new(path))
            .unwrap_or_else(|e| panic!("failed to load {path}: {e}")),
        None => DeviceConfig::default(),
    }
    .with_env_overrides()
    .expect("invalid DEVMAT_MAX_BYTES");

    // --- Load or generate source image ---
    let src = if let Some(path) = args.get(1) {
        load_image(path)
    } else {
        eprintln!("[channel_viewer] no image path given, using generated gradient");
        gradient(480, 640)
    };
    eprintln!(
        "[channel_viewer] source: {}x{}, {} channels",
        src.cols(), src.rows(), src.channels()
    );

    // --- Run on whichever device the config selects ---
    let device = open_device(&config).expect("failed to open a device");
    eprintln!("[channel_viewer] device: {}", device.name());
    let planes = match &device {
        Device::Gpu(gpu) => run(gpu, &src),
        Device::Host(host) => run(host, &src),
    };

    // --- Build display atlas ---
    let rows = src.rows();
    let cols = src.cols();
    let total_w = cols * planes.len() + 4 * (planes.len() - 1);
    let mut fb = vec![0x0040_4040u32; total_w * rows];
    for (i, plane) in planes.iter().enumerate() {
        let x_offset = i * (cols + 4);
        for y in 0..rows {
            for x in 0..cols {
                fb[y * total_w + x_offset + x] = grey_to_u32(plane.get::<u8>(x, y, 0));
            }
        }
    }

    // --- Display in minifb window ---
    let title = format!(
        "channel viewer | {} | {}x{} | {} channels",
        device.name(), cols, rows, planes.len()
    );
    let mut window = minifb::Window::new(
        &title,
        total_w,
        rows,
        minifb::WindowOptions { resize: false, ..Default::default() },
    )
    .expect("failed to open window");
    window.limit_update_rate(Some(std::time::Duration::from_millis(16)));

    eprintln!("[channel_viewer] window open, press Escape or close to exit");
    while window.is_open() && !window.is_key_down(minifb::Key::Escape) {
        window.update_with_buffer(&fb, total_w, rows)
            .expect("window update failed");
    }
}

/// Upload, split, locate extremes and return annotated planes on the host.
fn run<B: Backend>(device: &std::sync::Arc<B>, src: &HostImage) -> Vec<HostImage> {
    let mat = DeviceMat::from_host(device, src).expect("upload failed");

    let stream = device.create_stream();
    let planes = mat.split(Exec::Async(&stream)).expect("split failed");
    stream.synchronize().expect("split did not complete");

    let extremes = mat.min_max().expect("min_max failed");
    let mut out = Vec::with_capacity(planes.len());
    for (c, plane) in planes.iter().enumerate() {
        let (min, max) = (extremes.min_values[c], extremes.max_values[c]);
        let (min_loc, max_loc) = (extremes.min_locations[c], extremes.max_locations[c]);
        eprintln!(
            "[channel_viewer] channel {c}: min {min} at ({}, {}), max {max} at ({}, {})",
            min_loc.x, min_loc.y, max_loc.x, max_loc.y
        );

        let mut host = plane.to_host().expect("download failed");
        host.draw_rect(Rect::around(min_loc, 15), Scalar::all(0.0), 2);
        host.draw_rect(Rect::around(max_loc, 15), Scalar::all(255.0), 2);
        out.push(host);
    }

    let rebuilt = {
        let mut dst = DeviceMat::with_shape(device, mat.shape()).expect("alloc failed");
        let refs: Vec<&DeviceMat<B>> = planes.iter().collect();
        dst.merge_from(&refs, Exec::Sync).expect("merge failed");
        dst
    };
    eprintln!(
        "[channel_viewer] split → merge round trip equal: {}",
        rebuilt.equals(&mat).expect("equals failed")
    );
    out
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pack a greyscale u8 value into an ARGB u32 for minifb.
#[inline]
fn grey_to_u32(v: u8) -> u32 {
    let c = v as u32;
    0xFF00_0000 | (c << 16) | (c << 8) | c
}

/// Load any image format supported by the `image` crate as 3-channel u8.
fn load_image(path: &str) -> HostImage {
    let img = image::open(path)
        .unwrap_or_else(|e| panic!("failed to open {path}: {e}"))
        .to_rgb8();
    let (w, h) = img.dimensions();
    HostImage::from_vec(h as usize, w as usize, 3, img.into_raw()).expect("rgb buffer size")
}

/// Three-channel test pattern with a distinct extreme per channel.
fn gradient(rows: usize, cols: usize) -> HostImage {
    let mut img = HostImage::new(rows, cols, 3, Depth::U8).expect("valid shape");
    for y in 0..rows {
        for x in 0..cols {
            img.set::<u8>(x, y, 0, (x * 255 / cols) as u8);
            img.set::<u8>(x, y, 1, (y * 255 / rows) as u8);
            let dx = x.abs_diff(cols / 3);
            let dy = y.abs_diff(rows / 2);
            img.set::<u8>(x, y, 2, 255u8.saturating_sub(((dx + dy) / 2).min(255) as u8));
        }
    }
    img
}
