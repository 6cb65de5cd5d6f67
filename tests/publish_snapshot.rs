use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};

use slam_bridge::geometry::{GeometryEntry, POSE_LEN};
use slam_bridge::{
    GeometryFrames, GeometryPublisher, GeometrySnapshot, GeometrySource, PublishOutcome,
    Publisher, SharedGeometryBuffer, TransportError,
};

/// Captures sent payloads. Fails while `failing` is set.
#[derive(Clone, Default)]
struct Recorder {
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
    failing: Rc<Cell<bool>>,
}

impl Recorder {
    fn last(&self) -> Result<GeometrySnapshot> {
        let sent = self.sent.borrow();
        let payload = sent.last().ok_or_else(|| anyhow!("nothing published"))?;
        GeometrySnapshot::from_bytes(payload)
    }
}

impl Publisher for Recorder {
    fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.failing.get() {
            return Err(TransportError::Disconnected);
        }
        self.sent.borrow_mut().push(payload);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A source whose lock is always poisoned.
struct Poisoned;

impl GeometrySource for Poisoned {
    type View = GeometryFrames;

    fn with_read_lock<R>(&self, _f: impl FnOnce(&GeometryFrames) -> R) -> Result<R> {
        Err(anyhow!("geometry buffer lock poisoned"))
    }
}

const HEIGHT: usize = 4;
const WIDTH: usize = 6;

fn entry(t: f64) -> GeometryEntry {
    let mut pose = [0.0; POSE_LEN];
    pose[0] = t as f32;
    pose[POSE_LEN - 1] = 1.0;
    GeometryEntry {
        tstamp: t,
        pose,
        disp: vec![t as f32; HEIGHT * WIDTH],
        intrinsics: [40.0, 40.0, 3.0, 2.0],
    }
}

#[test]
fn empty_buffer_publishes_zero_frames() -> Result<()> {
    let recorder = Recorder::default();
    let mut publisher = GeometryPublisher::new(recorder.clone());
    let buffer = SharedGeometryBuffer::new(8, HEIGHT, WIDTH);

    let outcome = publisher.publish(&buffer);
    assert!(matches!(outcome, PublishOutcome::Sent { frames: 0, .. }));

    let snapshot = recorder.last()?;
    assert!(snapshot.is_empty());
    assert_eq!(snapshot.disps.shape, vec![0, HEIGHT, WIDTH]);
    assert_eq!(snapshot.poses.shape, vec![0, POSE_LEN]);
    Ok(())
}

#[test]
fn snapshot_contains_exactly_the_valid_frames() -> Result<()> {
    let recorder = Recorder::default();
    let mut publisher = GeometryPublisher::new(recorder.clone());
    let buffer = SharedGeometryBuffer::new(8, HEIGHT, WIDTH);
    for t in 0..3 {
        buffer.push(entry(f64::from(t)))?;
    }

    let outcome = publisher.publish(&buffer);
    assert!(matches!(outcome, PublishOutcome::Sent { frames: 3, .. }));

    let snapshot = recorder.last()?;
    assert_eq!(snapshot.tstamps.shape, vec![3]);
    assert_eq!(snapshot.poses.shape, vec![3, POSE_LEN]);
    assert_eq!(snapshot.disps.shape, vec![3, HEIGHT, WIDTH]);
    assert_eq!(snapshot.intrinsics.shape, vec![3, 4]);
    assert_eq!(snapshot.tstamps.data, vec![0.0, 1.0, 2.0]);
    assert_eq!(snapshot.disps.row(2)[0], 2.0);
    Ok(())
}

#[test]
fn send_failure_is_swallowed_and_next_publish_works() -> Result<()> {
    let recorder = Recorder::default();
    let mut publisher = GeometryPublisher::new(recorder.clone());
    let buffer = SharedGeometryBuffer::new(8, HEIGHT, WIDTH);
    buffer.push(entry(0.0))?;

    recorder.failing.set(true);
    assert_eq!(publisher.publish(&buffer), PublishOutcome::Dropped);
    assert_eq!(publisher.dropped(), 1);
    assert!(recorder.sent.borrow().is_empty());

    recorder.failing.set(false);
    buffer.push(entry(1.0))?;
    assert!(matches!(
        publisher.publish(&buffer),
        PublishOutcome::Sent { frames: 2, .. }
    ));
    assert_eq!(publisher.sent(), 1);
    assert_eq!(recorder.last()?.len(), 2);
    Ok(())
}

#[test]
fn non_finite_geometry_is_dropped_not_sent() -> Result<()> {
    let recorder = Recorder::default();
    let mut publisher = GeometryPublisher::new(recorder.clone());
    let buffer = SharedGeometryBuffer::new(8, HEIGHT, WIDTH);
    let mut bad = entry(0.0);
    bad.disp[0] = f32::NAN;
    bad.disp[1] = f32::INFINITY;
    buffer.push(bad)?;

    assert_eq!(publisher.publish(&buffer), PublishOutcome::Dropped);
    assert_eq!(publisher.dropped(), 1);
    assert!(recorder.sent.borrow().is_empty());

    // A clean buffer still goes out and decodes on the other side.
    let clean = SharedGeometryBuffer::new(8, HEIGHT, WIDTH);
    clean.push(entry(1.0))?;
    assert!(matches!(
        publisher.publish(&clean),
        PublishOutcome::Sent { frames: 1, .. }
    ));
    assert_eq!(recorder.last()?.tstamps.data, vec![1.0]);
    Ok(())
}

#[test]
fn unreadable_source_is_dropped() {
    let recorder = Recorder::default();
    let mut publisher = GeometryPublisher::new(recorder.clone());

    assert_eq!(publisher.publish(&Poisoned), PublishOutcome::Dropped);
    assert!(recorder.sent.borrow().is_empty());
}

#[test]
fn snapshots_stay_consistent_while_writer_appends() -> Result<()> {
    let recorder = Recorder::default();
    let mut publisher = GeometryPublisher::new(recorder.clone());
    let buffer = SharedGeometryBuffer::new(256, HEIGHT, WIDTH);
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let buffer = buffer.clone();
        let done = done.clone();
        thread::spawn(move || {
            for t in 0..256 {
                if buffer.push(entry(f64::from(t))).is_err() {
                    break;
                }
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    while !done.load(Ordering::SeqCst) {
        publisher.publish(&buffer);
    }
    publisher.publish(&buffer);
    writer.join().map_err(|_| anyhow!("writer panicked"))?;

    for payload in recorder.sent.borrow().iter() {
        let snapshot = GeometrySnapshot::from_bytes(payload)?;
        let n = snapshot.len();
        assert_eq!(snapshot.poses.rows(), n);
        assert_eq!(snapshot.disps.rows(), n);
        assert_eq!(snapshot.intrinsics.rows(), n);
        // Rows are complete: every disparity row matches its timestamp.
        for i in 0..n {
            let t = snapshot.tstamps.data[i] as f32;
            assert!(snapshot.disps.row(i).iter().all(|&d| d == t));
        }
    }
    assert_eq!(recorder.last()?.len(), 256);
    Ok(())
}
