// tests/test_device_mat.rs — DeviceMat behaviour against the host backend.

use std::sync::Arc;

use devmat::{
    Backend, Depth, DeviceMat, Error, Exec, HostDevice, HostImage, HostMat, Point, Scalar, Stream,
};

fn device() -> Arc<HostDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(HostDevice::new())
}

/// 3-channel U8 image where channel c of pixel (x, y) is `10*y + x + 100*c`.
fn rgb_ramp(rows: usize, cols: usize) -> HostImage {
    let mut img = HostImage::new(rows, cols, 3, Depth::U8).unwrap();
    for y in 0..rows {
        for x in 0..cols {
            for c in 0..3 {
                img.set::<u8>(x, y, c, (10 * y + x + 100 * c) as u8);
            }
        }
    }
    img
}

// ===== Construction and shape =====

#[test]
fn allocate_reports_shape() {
    let dev = device();
    for &(r, c, ch) in &[(0, 0, 1), (1, 1, 1), (3, 5, 2), (4, 4, 3), (7, 2, 4)] {
        for depth in Depth::ALL {
            let m = DeviceMat::new(&dev, r, c, ch, depth).unwrap();
            assert_eq!((m.size().height, m.size().width), (r, c));
            assert_eq!((m.rows(), m.cols()), (r, c));
            assert_eq!(m.channels(), ch);
            assert_eq!(m.depth(), depth);
            assert_eq!(m.type_code(), depth.make_type(ch));
        }
    }
}

#[test]
fn allocate_rejects_bad_channel_counts() {
    let dev = device();
    assert!(matches!(DeviceMat::new(&dev, 2, 2, 0, Depth::U8), Err(Error::ShapeMismatch(_))));
    assert!(matches!(DeviceMat::new(&dev, 2, 2, 5, Depth::U8), Err(Error::ShapeMismatch(_))));
}

#[test]
fn allocation_over_budget_fails() {
    let dev = Arc::new(HostDevice::with_budget(Some(100)));
    let a = DeviceMat::new(&dev, 4, 4, 3, Depth::U8).unwrap(); // 48 bytes
    let err = DeviceMat::new(&dev, 4, 4, 4, Depth::U8).unwrap_err(); // 64 more
    assert!(matches!(err, Error::Allocation(_)));
    drop(a);
    assert!(DeviceMat::new(&dev, 4, 4, 4, Depth::U8).is_ok());
}

#[test]
fn allocate_oversized_shape_fails_cleanly() {
    let dev = device();
    for (rows, cols) in [(usize::MAX, 2), (1 << 63, 2), (1 << 40, 1 << 40)] {
        let err = DeviceMat::new(&dev, rows, cols, 1, Depth::U8).unwrap_err();
        assert!(matches!(err, Error::Allocation(_)), "{rows}x{cols}: {err}");
    }
    assert!(matches!(HostImage::new(usize::MAX, 2, 3, Depth::F64), Err(Error::Allocation(_))));
    assert_eq!(dev.budget().used(), 0);
}

#[test]
fn new_matrix_is_zeroed() {
    let dev = device();
    let m = DeviceMat::new(&dev, 3, 3, 2, Depth::F32).unwrap();
    assert!(m.to_host().unwrap().as_slice::<f32>().unwrap().iter().all(|&v| v == 0.0));
}

// ===== Transfer =====

#[test]
fn upload_download_round_trip() {
    let dev = device();
    let host = HostImage::from_vec(2, 3, 2, vec![1.5f64, -2.0, 0.0, -0.0, f64::MAX, 7.25, 1e-300, 3.0, 4.0, 5.0, 6.0, 7.0])
        .unwrap();
    let mut m = DeviceMat::new(&dev, 2, 3, 2, Depth::F64).unwrap();
    m.upload(&host).unwrap();

    let mut back = HostImage::new(2, 3, 2, Depth::F64).unwrap();
    m.download(&mut back).unwrap();
    assert_eq!(back.as_bytes(), host.as_bytes());
}

#[test]
fn transfer_shape_mismatch() {
    let dev = device();
    let mut m = DeviceMat::new(&dev, 2, 2, 1, Depth::U8).unwrap();
    let wrong_depth = HostImage::new(2, 2, 1, Depth::I8).unwrap();
    let wrong_size = HostImage::new(2, 3, 1, Depth::U8).unwrap();
    assert!(matches!(m.upload(&wrong_depth), Err(Error::ShapeMismatch(_))));
    let mut wrong_size = wrong_size;
    assert!(matches!(m.download(&mut wrong_size), Err(Error::ShapeMismatch(_))));
}

// ===== Split / merge =====

#[test]
fn split_extracts_each_channel() {
    let dev = device();
    let m = DeviceMat::from_host(&dev, &rgb_ramp(2, 3)).unwrap();
    let planes = m.split(Exec::Sync).unwrap();
    assert_eq!(planes.len(), 3);
    for (c, p) in planes.iter().enumerate() {
        assert_eq!((p.rows(), p.cols(), p.channels()), (2, 3, 1));
        let h = p.to_host().unwrap();
        assert_eq!(h.get::<u8>(2, 1, 0), (12 + 100 * c) as u8);
    }
}

#[test]
fn split_then_merge_reconstructs() {
    let dev = device();
    let src = DeviceMat::from_host(&dev, &rgb_ramp(5, 7)).unwrap();
    let planes = src.split(Exec::Sync).unwrap();

    let mut merged = DeviceMat::new(&dev, 5, 7, 3, Depth::U8).unwrap();
    let refs: Vec<&HostMat> = planes.iter().collect();
    merged.merge_from(&refs, Exec::Sync).unwrap();
    assert!(merged.equals(&src).unwrap());
}

#[test]
fn split_merge_wide_depths() {
    let dev = device();
    let values: Vec<i16> = (0..24).map(|i| (i * 1000 - 12000) as i16).collect();
    let host = HostImage::from_vec(3, 2, 4, values).unwrap();
    let src = DeviceMat::from_host(&dev, &host).unwrap();

    let planes = src.split(Exec::Sync).unwrap();
    assert_eq!(planes[3].to_host().unwrap().as_slice::<i16>().unwrap(), &[-9000, -5000, -1000, 3000, 7000, 11000]);

    let mut merged = DeviceMat::new(&dev, 3, 2, 4, Depth::I16).unwrap();
    merged.merge_from(&planes.iter().collect::<Vec<_>>(), Exec::Sync).unwrap();
    assert_eq!(merged.to_host().unwrap(), host);
}

#[test]
fn single_channel_split_is_a_copy() {
    let dev = device();
    let host = HostImage::from_vec(2, 2, 1, vec![1u16, 2, 3, 4]).unwrap();
    let src = DeviceMat::from_host(&dev, &host).unwrap();
    let planes = src.split(Exec::Sync).unwrap();
    assert_eq!(planes.len(), 1);
    assert_eq!(planes[0].to_host().unwrap(), host);

    let mut back = DeviceMat::new(&dev, 2, 2, 1, Depth::U16).unwrap();
    back.merge_from(&[&planes[0]], Exec::Sync).unwrap();
    assert!(back.equals(&src).unwrap());
}

#[test]
fn split_into_wrong_count_leaves_inputs_untouched() {
    let dev = device();
    let src_host = rgb_ramp(2, 2);
    let src = DeviceMat::from_host(&dev, &src_host).unwrap();

    let marker = HostImage::from_vec(2, 2, 1, vec![9u8; 4]).unwrap();
    let mut a = DeviceMat::from_host(&dev, &marker).unwrap();
    let mut b = DeviceMat::from_host(&dev, &marker).unwrap();

    let err = src.split_into(&mut [&mut a, &mut b], Exec::Sync).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch(_)));

    assert_eq!(src.to_host().unwrap(), src_host);
    assert_eq!(a.to_host().unwrap(), marker);
    assert_eq!(b.to_host().unwrap(), marker);
}

#[test]
fn split_into_rejects_bad_destinations() {
    let dev = device();
    let src = DeviceMat::from_host(&dev, &rgb_ramp(2, 2)).unwrap();
    let ok = || DeviceMat::new(&dev, 2, 2, 1, Depth::U8).unwrap();

    // Wrong size.
    let (mut a, mut b) = (ok(), ok());
    let mut c = DeviceMat::new(&dev, 2, 3, 1, Depth::U8).unwrap();
    assert!(matches!(src.split_into(&mut [&mut a, &mut b, &mut c], Exec::Sync), Err(Error::ShapeMismatch(_))));

    // Wrong channel count.
    let mut c = DeviceMat::new(&dev, 2, 2, 2, Depth::U8).unwrap();
    assert!(matches!(src.split_into(&mut [&mut a, &mut b, &mut c], Exec::Sync), Err(Error::ShapeMismatch(_))));

    // Wrong depth.
    let mut c = DeviceMat::new(&dev, 2, 2, 1, Depth::U16).unwrap();
    assert!(matches!(src.split_into(&mut [&mut a, &mut b, &mut c], Exec::Sync), Err(Error::ShapeMismatch(_))));

    let mut c = ok();
    src.split_into(&mut [&mut a, &mut b, &mut c], Exec::Sync).unwrap();
}

#[test]
fn merge_from_rejects_wrong_count() {
    let dev = device();
    let mut dst = DeviceMat::new(&dev, 2, 2, 3, Depth::U8).unwrap();
    let p = DeviceMat::new(&dev, 2, 2, 1, Depth::U8).unwrap();
    assert!(matches!(dst.merge_from(&[&p, &p], Exec::Sync), Err(Error::ShapeMismatch(_))));
}

// ===== Reductions and equality =====

#[test]
fn set_to_split_min_max_scenario() {
    let dev = device();
    let mut m = DeviceMat::new(&dev, 4, 4, 3, Depth::U8).unwrap();
    m.set_to(255.0, None, Exec::Sync).unwrap();

    let planes = m.split(Exec::Sync).unwrap();
    assert_eq!(planes.len(), 3);
    for p in &planes {
        let mm = p.min_max().unwrap();
        assert_eq!(mm.min_values, vec![255.0]);
        assert_eq!(mm.max_values, vec![255.0]);
        assert_eq!(mm.min_locations, vec![Point::new(0, 0)]);
    }
}

#[test]
fn min_max_reads_each_channel() {
    let dev = device();
    let m = DeviceMat::from_host(&dev, &rgb_ramp(3, 4)).unwrap();
    let mm = m.min_max().unwrap();
    assert_eq!(mm.min_values, vec![0.0, 100.0, 200.0]);
    assert_eq!(mm.max_values, vec![23.0, 123.0, 223.0]);
    assert!(mm.min_locations.iter().all(|&p| p == Point::new(0, 0)));
    assert!(mm.max_locations.iter().all(|&p| p == Point::new(3, 2)));
    // Temporaries are gone.
    assert_eq!(dev.budget().used(), 36);
}

#[test]
fn min_max_first_occurrence_and_floats() {
    let dev = device();
    let host = HostImage::from_vec(2, 3, 1, vec![2.0f32, -1.0, 5.0, -1.0, 5.0, 0.0]).unwrap();
    let mm = DeviceMat::from_host(&dev, &host).unwrap().min_max().unwrap();
    assert_eq!((mm.min_values[0], mm.max_values[0]), (-1.0, 5.0));
    assert_eq!(mm.min_locations[0], Point::new(1, 0));
    assert_eq!(mm.max_locations[0], Point::new(2, 0));
}

#[test]
fn min_max_of_empty_fails() {
    let dev = device();
    let m = DeviceMat::new(&dev, 0, 5, 2, Depth::U8).unwrap();
    assert!(matches!(m.min_max(), Err(Error::ShapeMismatch(_))));
}

#[test]
fn min_max_error_releases_temporaries() {
    // 12 bytes live; splitting needs another 12, past the 16 byte budget.
    let dev = Arc::new(HostDevice::with_budget(Some(16)));
    let m = DeviceMat::new(&dev, 4, 1, 3, Depth::U8).unwrap();
    assert!(matches!(m.min_max(), Err(Error::Allocation(_))));
    assert_eq!(dev.budget().used(), 12);
    // Room again once the budget allows the planes.
    drop(m);
    let m = DeviceMat::new(&dev, 2, 1, 3, Depth::U8).unwrap();
    assert!(m.min_max().is_ok());
    assert_eq!(dev.budget().used(), 6);
}

#[test]
fn equals_error_releases_temporaries() {
    let dev = Arc::new(HostDevice::with_budget(Some(16)));
    let m = DeviceMat::new(&dev, 4, 1, 3, Depth::U8).unwrap();
    assert!(matches!(m.equals(&m), Err(Error::Allocation(_))));
    assert_eq!(dev.budget().used(), 12);
}

#[test]
fn equals_properties() {
    let dev = device();
    let host = rgb_ramp(3, 3);
    let x = DeviceMat::from_host(&dev, &host).unwrap();
    assert!(x.equals(&x).unwrap());

    let other_size = DeviceMat::new(&dev, 3, 4, 3, Depth::U8).unwrap();
    let other_channels = DeviceMat::new(&dev, 3, 3, 1, Depth::U8).unwrap();
    let other_depth = DeviceMat::new(&dev, 3, 3, 3, Depth::I8).unwrap();
    assert!(!x.equals(&other_size).unwrap());
    assert!(!x.equals(&other_channels).unwrap());
    assert!(!x.equals(&other_depth).unwrap());
}

#[test]
fn from_host_twice_then_modify_scenario() {
    let dev = device();
    let host = rgb_ramp(4, 4);
    let a = DeviceMat::from_host(&dev, &host).unwrap();
    let mut b = DeviceMat::from_host(&dev, &host).unwrap();
    assert!(a.equals(&b).unwrap());

    b.set_to(Scalar([1.0, 2.0, 3.0, 0.0]), None, Exec::Sync).unwrap();
    assert!(!a.equals(&b).unwrap());
}

#[test]
fn count_non_zero_single_channel_only() {
    let dev = device();
    let host = HostImage::from_vec(1, 5, 1, vec![0i32, -3, 0, 7, 1]).unwrap();
    let m = DeviceMat::from_host(&dev, &host).unwrap();
    assert_eq!(m.count_non_zero().unwrap(), 3);

    let rgb = DeviceMat::new(&dev, 1, 1, 3, Depth::U8).unwrap();
    assert!(matches!(rgb.count_non_zero(), Err(Error::ShapeMismatch(_))));
}

#[test]
fn bitwise_xor_of_self_is_zero() {
    let dev = device();
    let m = DeviceMat::from_host(&dev, &rgb_ramp(2, 2)).unwrap();
    let mut out = DeviceMat::new(&dev, 2, 2, 3, Depth::U8).unwrap();
    out.set_to(1.0, None, Exec::Sync).unwrap();
    m.bitwise_xor(&m, &mut out, Exec::Sync).unwrap();
    assert!(out.to_host().unwrap().as_bytes().iter().all(|&b| b == 0));
}

// ===== Conversion =====

#[test]
fn convert_to_saturates() {
    let dev = device();
    let host = HostImage::from_vec(1, 4, 1, vec![-5.5f32, 2.5, 3.5, 1000.0]).unwrap();
    let m = DeviceMat::from_host(&dev, &host).unwrap();
    let u8s = m.convert_to(Depth::U8, Exec::Sync).unwrap();
    assert_eq!(u8s.depth(), Depth::U8);
    assert_eq!(u8s.to_host().unwrap().as_slice::<u8>().unwrap(), &[0, 2, 4, 255]);
    // The source is untouched.
    assert_eq!(m.depth(), Depth::F32);
}

#[test]
fn convert_to_scaled_keeps_channels() {
    let dev = device();
    let m = DeviceMat::from_host(&dev, &rgb_ramp(2, 2)).unwrap();
    let f = m.convert_to_scaled(Depth::F32, 0.5, -1.0, Exec::Sync).unwrap();
    assert_eq!((f.rows(), f.cols(), f.channels()), (2, 2, 3));
    let h = f.to_host().unwrap();
    assert_eq!(h.get::<f32>(1, 1, 2), (211.0 * 0.5 - 1.0) as f32);
}

// ===== Reshape =====

#[test]
fn reshape_zero_zero_is_identity() {
    let dev = device();
    let src = DeviceMat::from_host(&dev, &rgb_ramp(3, 5)).unwrap();
    let before = src.to_host().unwrap();
    let (size, channels) = (src.size(), src.channels());

    let same = src.reshape(0, 0).unwrap();
    assert_eq!(same.size(), size);
    assert_eq!(same.channels(), channels);
    assert_eq!(same.to_host().unwrap(), before);
}

#[test]
fn reshape_flattens_channels() {
    let dev = device();
    let m = DeviceMat::from_host(&dev, &rgb_ramp(3, 5)).unwrap();
    let flat = m.reshape(1, 0).unwrap();
    assert_eq!((flat.rows(), flat.cols(), flat.channels()), (3, 15, 1));
    assert_eq!(flat.to_host().unwrap().get::<u8>(5, 1, 0), rgb_ramp(3, 5).get::<u8>(1, 1, 2));

    let tall = flat.reshape(0, 5).unwrap();
    assert_eq!((tall.rows(), tall.cols()), (5, 9));
    assert!(tall.shape().reshape(0, 4).is_err());
    assert!(matches!(tall.reshape(0, 4), Err(Error::ShapeMismatch(_))));
    // The failed reshape consumed and released the last handle.
    assert_eq!(dev.budget().used(), 0);
}

// ===== Fill =====

#[test]
fn set_to_with_mask() {
    let dev = device();
    let mut m = DeviceMat::new(&dev, 2, 2, 2, Depth::I16).unwrap();
    let mask = DeviceMat::from_host(&dev, &HostImage::from_vec(2, 2, 1, vec![0u8, 1, 0, 200]).unwrap()).unwrap();
    m.set_to(Scalar([-7.0, 40000.0, 0.0, 0.0]), Some(&mask), Exec::Sync).unwrap();

    let h = m.to_host().unwrap();
    assert_eq!(h.as_slice::<i16>().unwrap(), &[0, 0, -7, 32767, 0, 0, -7, 32767]);
}

#[test]
fn set_to_rejects_bad_mask() {
    let dev = device();
    let mut m = DeviceMat::new(&dev, 2, 2, 1, Depth::U8).unwrap();
    let wide = DeviceMat::new(&dev, 2, 2, 1, Depth::U16).unwrap();
    let small = DeviceMat::new(&dev, 1, 2, 1, Depth::U8).unwrap();
    assert!(matches!(m.set_to(1.0, Some(&wide), Exec::Sync), Err(Error::ShapeMismatch(_))));
    assert!(matches!(m.set_to(1.0, Some(&small), Exec::Sync), Err(Error::ShapeMismatch(_))));
}

// ===== Streams =====

#[test]
fn async_operations_complete_on_synchronize() {
    let dev = device();
    let stream = dev.create_stream();
    let src = DeviceMat::from_host(&dev, &rgb_ramp(3, 3)).unwrap();

    let mut planes: Vec<HostMat> = (0..3).map(|_| DeviceMat::new(&dev, 3, 3, 1, Depth::U8).unwrap()).collect();
    {
        let mut refs: Vec<&mut HostMat> = planes.iter_mut().collect();
        src.split_into(&mut refs, Exec::Async(&stream)).unwrap();
    }
    let mut merged = DeviceMat::new(&dev, 3, 3, 3, Depth::U8).unwrap();
    merged.merge_from(&planes.iter().collect::<Vec<_>>(), Exec::Async(&stream)).unwrap();
    assert!(!stream.is_idle());
    assert!(!merged.equals(&src).unwrap());

    stream.synchronize().unwrap();
    assert!(stream.is_idle());
    assert!(merged.equals(&src).unwrap());
}

#[test]
fn released_destination_survives_pending_work() {
    let dev = device();
    let stream = dev.create_stream();
    let src = DeviceMat::from_host(&dev, &rgb_ramp(2, 2)).unwrap();
    let converted = src.convert_to(Depth::F32, Exec::Async(&stream)).unwrap();
    converted.release();
    // The queued conversion still holds the 48 byte destination.
    assert_eq!(dev.budget().used(), 60);
    stream.synchronize().unwrap();
    assert_eq!(dev.budget().used(), 12);
}
