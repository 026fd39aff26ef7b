use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use hydrotag_core::buffering::{BlockObserver, RingLayout, RingNames, SharedRing};
use hydrotag_core::encoder::{read_raw_samples, EncoderKind};
use hydrotag_core::geometry::{
    resolve, BitDepth, FilterType, SampleGeometry, MAX_REGISTER_ATTEMPTS,
};
use hydrotag_core::hardware::{simulated::synthetic_sample, Register, SimulatedHydrophone};
use hydrotag_core::ipc::events::{
    AcquisitionStatus, OverflowLocation, PagePersistedEvent, StatusEvent,
};
use hydrotag_core::status_log::read_status_rows;
use hydrotag_core::{AcquisitionEngine, EngineConfig, HydroError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

const TIMEOUT: Duration = Duration::from_secs(10);

fn geometry_16_96k_3ch() -> SampleGeometry {
    SampleGeometry::new(16, 96_000, 3, FilterType::Wideband).expect("valid geometry")
}

fn config(dir: &Path, geometry: SampleGeometry, blocks_per_page: usize) -> EngineConfig {
    EngineConfig {
        geometry,
        encoder: EncoderKind::Raw,
        output_dir: dir.join("out"),
        status_log_path: dir.join("status.csv"),
        ring: RingNames::new(dir.join("shm"), "scenario"),
        blocks_per_page: Some(blocks_per_page),
        realtime_scheduling: false,
        ..EngineConfig::default()
    }
}

fn recv_with_timeout<T: Clone>(rx: &mut broadcast::Receiver<T>, what: &str) -> T {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= TIMEOUT {
                    panic!("timed out waiting for {what}");
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("{what} channel closed unexpectedly"),
        }
    }
}

fn wait_for_status(rx: &mut broadcast::Receiver<StatusEvent>, status: AcquisitionStatus) -> StatusEvent {
    loop {
        let ev = recv_with_timeout(rx, "status event");
        if ev.status == status {
            return ev;
        }
    }
}

fn wait_for_blocks(engine: &AcquisitionEngine, blocks: u64) {
    let ring = engine.current_ring().expect("session ring");
    let start = Instant::now();
    while ring.block_ready_total() < blocks {
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for {blocks} blocks");
        thread::sleep(Duration::from_millis(1));
    }
}

fn output_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir.join("out"))
        .expect("output dir")
        .map(|e| e.expect("dir entry").path())
        .collect();
    files.sort();
    files
}

fn expected_samples(count: usize, channels: usize, depth: BitDepth) -> Vec<i32> {
    (0..count)
        .map(|i| synthetic_sample((i / channels) as u64, i % channels, depth))
        .collect()
}

fn file_stamp(path: &Path) -> i64 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse().ok())
        .expect("epoch-ms file name")
}

#[test]
fn full_page_flips_once_and_rotates_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let geometry = geometry_16_96k_3ch();
    let blocks_per_page = 4;
    let page_wire_bytes = blocks_per_page * geometry.block_bytes();
    let page_encoded = geometry.encoded_len(page_wire_bytes) as u64;

    let mut cfg = config(dir.path(), geometry, blocks_per_page);
    // 96 kHz doubles the base; rotate after exactly one page.
    cfg.base_file_bytes = page_encoded / 2;

    let hw = SimulatedHydrophone::new();
    hw.faults().limit_blocks(blocks_per_page as u64);
    let engine = AcquisitionEngine::new(cfg.clone(), hw.clone());
    let mut pages = engine.subscribe_pages();

    engine.start().expect("start");
    let observer = BlockObserver::attach(&cfg.ring, cfg.ring_layout().unwrap()).expect("observer");

    let event: PagePersistedEvent = recv_with_timeout(&mut pages, "page event");
    assert_eq!(event.page, 0);
    assert_eq!(event.blocks, blocks_per_page);
    assert!(!event.partial);
    assert_eq!(event.file_bytes, page_encoded);
    let rotated = PathBuf::from(event.rotated_to.expect("file rotated after the page"));

    let ring = engine.current_ring().unwrap();
    assert_eq!(ring.page_ready_total(), 1);
    assert_eq!(ring.block_ready_total(), blocks_per_page as u64);
    assert_eq!(observer.published(), blocks_per_page as u64);

    let files = output_files(dir.path());
    assert_eq!(files.len(), 2, "previous file plus the rotated one: {files:?}");
    let first = PathBuf::from(&event.file);
    assert!(files.contains(&first) && files.contains(&rotated));
    assert_eq!(file_stamp(&first), ring.page_started_ms(0));
    assert!(file_stamp(&rotated) > file_stamp(&first));
    assert_eq!(
        std::fs::metadata(&first).unwrap().len(),
        (page_wire_bytes / 4 * 2) as u64
    );

    let samples = read_raw_samples(&first, BitDepth::Sixteen).unwrap();
    assert_eq!(samples, expected_samples(page_wire_bytes / 4, 3, BitDepth::Sixteen));

    engine.stop().expect("stop");
    // The rotated file never received samples and is removed at finalize.
    assert_eq!(output_files(dir.path()), vec![first]);

    let rows = read_status_rows(&cfg.status_log_path).unwrap();
    let markers: Vec<(u8, u8)> = rows
        .iter()
        .map(|r| (r.start_writing_marker, r.done_writing_marker))
        .collect();
    assert_eq!(markers, vec![(1, 0), (0, 1)]);
    assert_eq!(rows[1].see_block, blocks_per_page as u64);
}

#[test]
fn overflow_mid_transfer_tears_down_without_partial_block() {
    let dir = tempfile::tempdir().unwrap();
    let geometry = geometry_16_96k_3ch();
    let block = geometry.block_bytes() as u64;

    let hw = SimulatedHydrophone::new();
    // Crossed by the first half of the fourth block.
    hw.faults().overflow_after_bytes(3 * block + 1);
    let engine = AcquisitionEngine::new(config(dir.path(), geometry, 8), hw.clone());
    let mut status = engine.subscribe_status();

    engine.start().expect("start");
    let overflowed = wait_for_status(&mut status, AcquisitionStatus::Overflowed);
    assert_eq!(overflowed.overflow_location, Some(OverflowLocation::MidTransfer));
    wait_for_status(&mut status, AcquisitionStatus::Idle);

    assert!(!engine.is_running());
    assert_eq!(engine.last_overflow(), Some(OverflowLocation::MidTransfer));
    assert!(!hw.is_streaming());
    // Priming reset plus the teardown reset.
    assert_eq!(hw.reset_count(), 2);

    let ring = engine.current_ring().unwrap();
    assert_eq!(ring.block_ready_total(), 3);
    assert_eq!(ring.page_ready_total(), 0);

    let diag = engine.diagnostics_snapshot();
    assert_eq!(diag.overflows, 1);
    assert_eq!(diag.partial_flushes, 1);

    let rows = read_status_rows(&dir.path().join("status.csv")).unwrap();
    let overflow_row = rows
        .iter()
        .find(|r| r.overflow_flag == 1)
        .expect("overflow audit row");
    assert_eq!(overflow_row.overflow_location, 2);
    assert_eq!(overflow_row.see_block, 3);

    // Already torn down: both are no-ops.
    engine.stop().unwrap();
    engine.simulate_overflow().unwrap();
    assert_eq!(hw.stop_count(), 1);

    // A fresh session can start after the overflow.
    hw.faults().clear();
    hw.faults().limit_blocks(1);
    engine.start().expect("restart after overflow");
    engine.stop().unwrap();
    assert_eq!(engine.last_overflow(), None);
}

#[test]
fn rotation_scales_with_rate_not_depth() {
    let base = 1 << 20;
    let slow = resolve(
        SampleGeometry::new(16, 750, 4, FilterType::Wideband).unwrap(),
        base,
    );
    let fast = resolve(
        SampleGeometry::new(24, 192_000, 4, FilterType::Sinc5).unwrap(),
        base,
    );
    assert_eq!(fast.file_rotation_bytes, 4 * slow.file_rotation_bytes);
}

#[test]
fn stop_mid_page_flushes_exactly_the_written_fraction() {
    let dir = tempfile::tempdir().unwrap();
    let geometry = geometry_16_96k_3ch();
    let blocks_per_page = 10;
    let written_blocks = 4;

    let mut cfg = config(dir.path(), geometry, blocks_per_page);
    cfg.encoder = EncoderKind::Wav;
    let hw = SimulatedHydrophone::new();
    hw.faults().limit_blocks(written_blocks as u64);
    let engine = AcquisitionEngine::new(cfg, hw);
    let mut pages = engine.subscribe_pages();

    engine.start().expect("start");
    wait_for_blocks(&engine, written_blocks as u64);
    engine.stop().expect("stop");

    let event = recv_with_timeout(&mut pages, "partial page event");
    assert!(event.partial);
    assert_eq!(event.blocks, written_blocks);

    let files = output_files(dir.path());
    assert_eq!(files.len(), 1);
    let mut reader = hound::WavReader::open(&files[0]).unwrap();
    let spec = reader.spec();
    assert_eq!((spec.channels, spec.bits_per_sample), (3, 16));
    let decoded: Vec<i32> = reader.samples::<i16>().map(|s| s.unwrap() as i32).collect();

    let expected_count = written_blocks * geometry.block_bytes() / 4;
    assert_eq!(decoded.len(), expected_count);
    assert_eq!(decoded, expected_samples(expected_count, 3, BitDepth::Sixteen));
    assert_eq!(engine.status(), AcquisitionStatus::Idle);
}

#[test]
fn transport_failure_ends_session_without_overflow_flag() {
    let dir = tempfile::tempdir().unwrap();
    let hw = SimulatedHydrophone::new();
    // One transfer for the cold-start word, then two blocks in halves.
    hw.faults().fail_transfers_after(1 + 2 * 2);
    let engine = AcquisitionEngine::new(config(dir.path(), geometry_16_96k_3ch(), 8), hw.clone());
    let mut status = engine.subscribe_status();

    engine.start().expect("start");
    let failed = wait_for_status(&mut status, AcquisitionStatus::Error);
    assert!(failed.detail.unwrap_or_default().contains("transfer"));
    wait_for_status(&mut status, AcquisitionStatus::Idle);

    assert_eq!(engine.last_overflow(), None);
    assert!(!hw.is_streaming());
    assert_eq!(engine.current_ring().unwrap().block_ready_total(), 2);
    assert_eq!(engine.diagnostics_snapshot().transport_errors, 1);
}

#[test]
fn rejected_geometry_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let hw = SimulatedHydrophone::new();
    hw.faults().reject_register(Register::FpgaBitDepth);
    let engine = AcquisitionEngine::new(config(dir.path(), geometry_16_96k_3ch(), 8), hw.clone());

    let err = engine.start().unwrap_err();
    assert!(matches!(
        err,
        HydroError::GeometryRejected {
            register: Register::FpgaBitDepth,
            ..
        }
    ));
    assert_eq!(
        hw.register_write_count(Register::FpgaBitDepth),
        MAX_REGISTER_ATTEMPTS as usize
    );
    assert!(!engine.is_running());
    assert_eq!(engine.status(), AcquisitionStatus::Idle);
    assert_eq!(hw.start_count(), 0);
    assert!(!dir.path().join("out").exists());
}

#[test]
fn simulate_overflow_tears_down_once() {
    let dir = tempfile::tempdir().unwrap();
    let hw = SimulatedHydrophone::new();
    hw.faults().limit_blocks(2);
    let engine = AcquisitionEngine::new(config(dir.path(), geometry_16_96k_3ch(), 8), hw.clone());

    engine.start().expect("start");
    wait_for_blocks(&engine, 2);
    engine.simulate_overflow().unwrap();

    assert!(!engine.is_running());
    let location = engine.last_overflow().expect("overflow recorded");
    assert!(matches!(
        location,
        OverflowLocation::BeforeWait | OverflowLocation::Commanded
    ));
    let stops = hw.stop_count();
    let resets = hw.reset_count();

    engine.simulate_overflow().unwrap();
    assert_eq!(hw.stop_count(), stops);
    assert_eq!(hw.reset_count(), resets);
    assert_eq!(engine.diagnostics_snapshot().overflows, 1);
}

#[test]
fn stop_twice_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let hw = SimulatedHydrophone::new();
    hw.faults().limit_blocks(3);
    let engine = AcquisitionEngine::new(config(dir.path(), geometry_16_96k_3ch(), 8), hw.clone());

    engine.start().expect("start");
    wait_for_blocks(&engine, 3);
    engine.stop().unwrap();
    let stops = hw.stop_count();
    engine.stop().unwrap();
    assert_eq!(hw.stop_count(), stops);
    assert_eq!(engine.status(), AcquisitionStatus::Idle);
}

#[test]
fn page_ready_count_is_floor_of_blocks_over_page() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RingLayout::new(12, 5).unwrap();
    let (mut writer, mut reader) =
        SharedRing::create(RingNames::new(dir.path(), "floor"), layout).unwrap();

    for n in 1..=23u64 {
        if writer.write_block(&[n as u8; 12]).unwrap() {
            reader.page_drain_begin().unwrap();
            reader.page_drain_end().unwrap();
        }
        let ring = writer.ring();
        assert_eq!(ring.block_ready_total(), n);
        assert_eq!(ring.page_ready_total(), n / 5);
    }
}

#[test]
fn realtime_hardware_paces_the_producer() {
    let dir = tempfile::tempdir().unwrap();
    let geometry = SampleGeometry::new(24, 48_000, 3, FilterType::Sinc5).unwrap();
    let engine = AcquisitionEngine::new(
        config(dir.path(), geometry, 64),
        SimulatedHydrophone::realtime(),
    );

    engine.start().expect("start");
    wait_for_blocks(&engine, 3);
    engine.stop().unwrap();

    let diag = engine.diagnostics_snapshot();
    assert!(diag.blocks_written >= 3);
    assert!(diag.poll_sleeps > 0, "producer should wait on data ready");
}

#[test]
fn every_drained_page_writes_a_start_and_an_end_row() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), geometry_16_96k_3ch(), 2);
    let hw = SimulatedHydrophone::new();
    hw.faults().limit_blocks(4);
    let engine = AcquisitionEngine::new(cfg.clone(), hw);
    let mut pages = engine.subscribe_pages();

    engine.start().expect("start");
    for expected in 0..2 {
        let event = recv_with_timeout(&mut pages, "page event");
        assert_eq!(event.page, expected);
        assert!(!event.partial);
    }
    engine.stop().unwrap();

    let rows = read_status_rows(&cfg.status_log_path).unwrap();
    let markers: Vec<(u8, u8)> = rows
        .iter()
        .map(|r| (r.start_writing_marker, r.done_writing_marker))
        .collect();
    // Both pages were full, so stopping adds no partial-page rows.
    assert_eq!(markers, vec![(1, 0), (0, 1), (1, 0), (0, 1)]);
    assert!(rows.iter().all(|r| r.overflow_flag == 0));
    assert!(rows.windows(2).all(|w| w[0].see_block <= w[1].see_block));
    assert!(rows[1].see_block >= 2);
    assert_eq!(rows[3].see_block, 4);
}

#[test]
fn producer_skips_the_deadline_sleep_while_data_is_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let geometry = SampleGeometry::new(16, 48_000, 3, FilterType::Wideband).unwrap();
    let hw = SimulatedHydrophone::new();
    hw.faults().limit_blocks(8);
    let engine = AcquisitionEngine::new(config(dir.path(), geometry, 64), hw);

    engine.start().expect("start");
    wait_for_blocks(&engine, 8);
    engine.stop().unwrap();

    let diag = engine.diagnostics_snapshot();
    assert_eq!(diag.blocks_written, 8);
    // Data was ready after every commit but the last.
    assert_eq!(diag.catch_up_iterations, 7);
    assert_eq!(diag.deadline_misses, 0);
}

#[test]
fn slow_iteration_does_not_sleep_past_its_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let geometry = geometry_16_96k_3ch();
    let interval = Duration::from_micros(geometry.block_fill_interval_us());
    let hw = SimulatedHydrophone::new();
    hw.faults().limit_blocks(1);
    // Each half of the block alone outlasts the fill interval.
    hw.faults().slow_transfers(interval * 3);
    let engine = AcquisitionEngine::new(config(dir.path(), geometry, 8), hw);

    engine.start().expect("start");
    wait_for_blocks(&engine, 1);
    engine.stop().unwrap();

    let diag = engine.diagnostics_snapshot();
    assert_eq!(diag.blocks_written, 1);
    assert_eq!(diag.catch_up_iterations, 0);
    assert_eq!(diag.deadline_misses, 1);
}
