//! Shared fixtures for controller tests: a colour-band detector, synthetic
//! frames, a manual clock and a forwarding feedback sink.

use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::{ExtractError, FaceDetector, FaceExtractor, FaceRegion, FaceSample};
use rollcall_hw::{CameraError, Frame, FrameSource};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::Config;
use crate::context::AppContext;
use crate::feedback::{FeedbackError, FeedbackSink, Notifier};

pub const BAND: u32 = 8;
pub const FACE_SIZE: u32 = 4;

pub const ALICE: [u8; 3] = [220, 40, 40];
pub const BOB: [u8; 3] = [40, 220, 40];
pub const CAROL: [u8; 3] = [40, 40, 220];
pub const DAVE: [u8; 3] = [220, 220, 40];
pub const ERIN: [u8; 3] = [40, 220, 220];

/// Reports one face per non-black vertical band of `BAND` pixels.
pub struct BandDetector;

impl FaceDetector for BandDetector {
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceRegion>, ExtractError> {
        let mid = (height / 2) as usize;
        Ok((0..width / BAND)
            .filter(|b| gray[mid * width as usize + (b * BAND + BAND / 2) as usize] > 0)
            .map(|b| FaceRegion {
                x: b * BAND,
                y: 0,
                width: BAND,
                height,
                score: 1.0,
            })
            .collect())
    }
}

/// A frame with one `BAND`-wide face per colour; no colours gives an empty black frame.
pub fn band_frame(colours: &[[u8; 3]]) -> Frame {
    let bands = colours.len().max(1) as u32;
    let width = bands * BAND;
    let mut data = Vec::with_capacity((width * BAND * 3) as usize);
    for _row in 0..BAND {
        for b in 0..bands as usize {
            let colour = colours.get(b).copied().unwrap_or([0, 0, 0]);
            for _ in 0..BAND {
                data.extend_from_slice(&colour);
            }
        }
    }
    Frame::from_rgb(data, width, BAND, 0).unwrap()
}

/// Gallery sample identical to what the extractor produces for a band of `colour`.
pub fn sample(label: &str, colour: [u8; 3]) -> FaceSample {
    let features = colour
        .iter()
        .copied()
        .cycle()
        .take((FACE_SIZE * FACE_SIZE * 3) as usize)
        .collect();
    FaceSample::new(label, features)
}

pub struct ManualClock {
    base: Instant,
    wall: NaiveDateTime,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            wall: test_date().and_hms_opt(9, 0, 0).unwrap(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }

    fn local_now(&self) -> NaiveDateTime {
        let offset = *self.offset.lock().unwrap();
        self.wall + chrono::Duration::from_std(offset).unwrap()
    }
}

pub fn test_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
}

struct ForwardSink(std_mpsc::Sender<String>);

impl FeedbackSink for ForwardSink {
    fn deliver(&mut self, message: &str) -> Result<(), FeedbackError> {
        let _ = self.0.send(message.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub ctx: AppContext,
    pub clock: Arc<ManualClock>,
    pub feedback: std_mpsc::Receiver<String>,
}

impl Harness {
    /// Drain feedback messages delivered so far, waiting briefly for stragglers.
    pub fn messages(&self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(m) = self.feedback.recv_timeout(Duration::from_millis(200)) {
            out.push(m);
        }
        out
    }
}

/// Context rooted in `dir` with `samples_each` gallery samples per person.
pub fn harness(dir: &Path, people: &[(&str, [u8; 3])], samples_each: usize) -> Harness {
    let config = Config {
        data_dir: dir.join("data"),
        attendance_dir: Some(dir.join("attendance")),
        face_size: FACE_SIZE,
        attend_interval_ms: 0,
        enroll_interval_ms: 0,
        ..Config::default()
    };

    let (tx, rx) = std_mpsc::channel();
    let notifier = Notifier::spawn(Box::new(ForwardSink(tx)), 64).unwrap();
    let clock = Arc::new(ManualClock::new());
    let extractor = FaceExtractor::new(Box::new(BandDetector), FACE_SIZE);
    let ctx = AppContext::new(config, extractor, notifier, clock.clone()).unwrap();

    let batch: Vec<FaceSample> = people
        .iter()
        .flat_map(|(name, colour)| std::iter::repeat_with(move || sample(name, *colour)).take(samples_each))
        .collect();
    ctx.gallery.append(&batch).unwrap();

    Harness {
        ctx,
        clock,
        feedback: rx,
    }
}

/// Frame source replaying a fixed script; fails like an unplugged camera when exhausted.
pub struct ScriptedSource {
    frames: VecDeque<Frame>,
    pub released: Arc<Mutex<bool>>,
}

impl ScriptedSource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            released: Arc::new(Mutex::new(false)),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.frames
            .pop_front()
            .ok_or_else(|| CameraError::CaptureFailed("end of script".into()))
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        *self.released.lock().unwrap() = true;
    }
}
