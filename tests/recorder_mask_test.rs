//! Integration tests for recordings and dark masks.

mod common;

use std::time::Duration;

use common::{geometry, looping, ramp, settings, uniform, wait_event, wait_until, WAIT};
use liveview::mask::DarkMask;
use liveview::{FrameWorker, LiveViewError, PipelineEvent, SaveRequest};

fn read_u16_frames(bytes: &[u8], pixels: usize) -> Vec<Vec<u16>> {
    bytes
        .chunks_exact(pixels * 2)
        .map(|frame| {
            frame
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect()
        })
        .collect()
}

#[test]
fn test_recording_writes_requested_frames() {
    let g = geometry(6, 4);
    let frames: Vec<Vec<u16>> = (0..3).map(|i| ramp(g, i * 1000)).collect();
    let worker = FrameWorker::new(looping(g, frames.clone(), Duration::from_millis(2)), &settings()).unwrap();
    let mut events = worker.subscribe();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.raw");
    worker.start().unwrap();
    worker.start_saving(SaveRequest::new(&path, 5)).unwrap();
    assert!(worker.saving());

    let finished = wait_event(&mut events, WAIT, |e| matches!(e, PipelineEvent::SaveFinished { .. })).unwrap();
    let PipelineEvent::SaveFinished {
        path: written_path,
        frames_written,
        dropped,
    } = finished
    else {
        unreachable!()
    };
    assert_eq!(written_path, path);
    assert_eq!(frames_written, 5);
    assert_eq!(dropped, 0);
    assert!(wait_until(WAIT, || !worker.saving()));
    assert!(worker.running());
    worker.stop().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 5 * g.raw_bytes());
    let recorded = read_u16_frames(&bytes, g.pixels());
    // Consecutive frames of the looping script.
    let first = frames.iter().position(|f| *f == recorded[0]).unwrap();
    for (i, frame) in recorded.iter().enumerate() {
        assert_eq!(*frame, frames[(first + i) % frames.len()]);
    }
}

#[test]
fn test_recording_armed_while_stopped() {
    let g = geometry(2, 2);
    let worker = FrameWorker::new(looping(g, vec![uniform(g, 42)], Duration::from_millis(1)), &settings()).unwrap();
    let mut events = worker.subscribe();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("armed.raw");
    worker.start_saving(SaveRequest::new(&path, 3)).unwrap();
    assert!(matches!(
        wait_event(&mut events, WAIT, |e| matches!(e, PipelineEvent::SaveStarted { .. })),
        Some(PipelineEvent::SaveStarted { frames: 3, .. })
    ));

    let err = worker
        .start_saving(SaveRequest::new(dir.path().join("second.raw"), 3))
        .unwrap_err();
    assert!(matches!(err, LiveViewError::AlreadySaving(_)));
    assert!(matches!(
        worker.start_saving(SaveRequest::new(dir.path().join("none.raw"), 0)),
        Err(LiveViewError::InvalidParameter(_))
    ));

    worker.start().unwrap();
    wait_event(&mut events, WAIT, |e| matches!(e, PipelineEvent::SaveFinished { .. })).unwrap();
    worker.stop().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(read_u16_frames(&bytes, g.pixels()), vec![uniform(g, 42); 3]);
}

#[test]
fn test_stop_ends_recording_early() {
    let g = geometry(2, 2);
    let worker = FrameWorker::new(looping(g, vec![uniform(g, 1)], Duration::from_millis(5)), &settings()).unwrap();
    let mut events = worker.subscribe();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.raw");
    worker.start().unwrap();
    worker.start_saving(SaveRequest::new(&path, 10_000)).unwrap();
    assert!(wait_until(WAIT, || worker.stats().frames_acquired >= 3));
    worker.stop().unwrap();

    let Some(PipelineEvent::SaveFinished { frames_written, .. }) =
        wait_event(&mut events, WAIT, |e| matches!(e, PipelineEvent::SaveFinished { .. }))
    else {
        panic!("recording did not finish after stop");
    };
    assert!(frames_written < 10_000);
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        frames_written * g.raw_bytes() as u64
    );
    assert!(!worker.saving());
}

#[test]
fn test_collect_save_and_reload_dark_mask() {
    let g = geometry(4, 4);
    let worker = FrameWorker::new(looping(g, vec![uniform(g, 500)], Duration::from_millis(1)), &settings()).unwrap();
    let mut events = worker.subscribe();

    let dir = tempfile::tempdir().unwrap();
    let mask_path = dir.path().join("collected.f32");
    assert!(matches!(
        worker.save_dark_mask(&mask_path),
        Err(LiveViewError::InvalidParameter(_))
    ));

    worker.collect_dark_mask(3).unwrap();
    worker.start().unwrap();
    assert_eq!(
        wait_event(&mut events, WAIT, |e| matches!(e, PipelineEvent::DarkMaskCollected { .. })),
        Some(PipelineEvent::DarkMaskCollected { frames: 3 })
    );
    assert!(wait_until(WAIT, || worker
        .get_ds_frame()
        .is_some_and(|f| f.pixels().iter().all(|&v| v == 0))));
    worker.stop().unwrap();

    worker.save_dark_mask(&mask_path).unwrap();
    assert_eq!(std::fs::metadata(&mask_path).unwrap().len(), (g.pixels() * 4) as u64);
    let mask = DarkMask::load(&mask_path, g).unwrap();
    assert!(mask.values().iter().all(|&v| v == 500.0));

    // Clearing drops the collected mask; re-applying the saved file restores it.
    worker.clear_mask();
    assert!(worker.save_dark_mask(dir.path().join("none.f32")).is_err());
    worker.apply_mask(&mask_path).unwrap();
    let copy = dir.path().join("copy.f32");
    worker.save_dark_mask(&copy).unwrap();
    assert_eq!(std::fs::read(&copy).unwrap(), std::fs::read(&mask_path).unwrap());
}

#[test]
fn test_mask_geometry_mismatch_rejected() {
    let g = geometry(4, 4);
    let worker = FrameWorker::new(looping(g, vec![uniform(g, 1)], Duration::from_millis(1)), &settings()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let wrong = dir.path().join("wrong.f32");
    DarkMask::from_values(geometry(2, 2), vec![0.0; 4])
        .unwrap()
        .save(&wrong)
        .unwrap();

    assert!(matches!(worker.apply_mask(&wrong), Err(LiveViewError::InvalidGeometry(_))));
    let version = worker.config_snapshot().version;
    assert!(matches!(
        worker.set_mask_settings(Some(wrong.as_path()), 10),
        Err(LiveViewError::InvalidGeometry(_))
    ));
    // Rejected settings leave the configuration untouched.
    assert_eq!(worker.config_snapshot().version, version);
    assert_eq!(worker.config_snapshot().window, 4);
    assert!(worker.config_snapshot().mask.is_none());
}

#[test]
fn test_configured_mask_loaded_at_creation() {
    let g = geometry(3, 2);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("startup.f32");
    DarkMask::from_values(g, vec![10.0; g.pixels()])
        .unwrap()
        .save(&path)
        .unwrap();

    let mut config = settings();
    config.mask_path = Some(path);
    let worker = FrameWorker::new(looping(g, vec![uniform(g, 25)], Duration::from_millis(1)), &config).unwrap();
    worker.start().unwrap();
    assert!(wait_until(WAIT, || worker.get_ds_frame().is_some()));
    worker.stop().unwrap();
    assert!(worker.get_ds_frame().unwrap().pixels().iter().all(|&v| v == 15));
}

#[test]
fn test_drop_waits_for_recording_to_flush() {
    let g = geometry(16, 16);
    let worker = FrameWorker::new(looping(g, vec![uniform(g, 7)], Duration::from_millis(1)), &settings()).unwrap();
    let mut events = worker.subscribe();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropped.raw");
    worker.start_saving(SaveRequest::new(&path, 100_000)).unwrap();
    worker.start().unwrap();
    assert!(wait_until(WAIT, || worker.stats().frames_acquired >= 5));
    drop(worker);

    // The writer has finished by the time the worker is gone.
    let mut frames_written = None;
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::SaveFinished { frames_written: n, .. } = event {
            frames_written = Some(n);
        }
    }
    let frames_written = frames_written.expect("recording finished before drop returned");
    assert!(frames_written > 0);
    assert_eq!(
        std::fs::read(&path).unwrap().len(),
        frames_written as usize * g.raw_bytes()
    );
}
