//! Test fixtures: a scripted frame producer and state constructors.
//!
//! Public so the integration suite can share them; nothing here is part of
//! the stable API.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use fieldweave_core::hw::SimUnit;
use fieldweave_core::types::{Canvas, FieldParity, FrameFormat, FrameMeta, ScanKind, SourceKind};

use crate::exchange::{FrameSource, SourceFrame};
use crate::state::{EngineConfig, EngineState};

/// Scripted producer: frames are queued ahead of time, returned loans are
/// collected for assertions.
pub struct TestSource {
    pending: VecDeque<SourceFrame>,
    pub returned: Vec<SourceFrame>,
    width: u32,
    height: u32,
    next_parity: FieldParity,
    next_pts: i64,
    next_base: u64,
}

/// 60i field cadence in microseconds.
const FIELD_US: i64 = 16_683;

impl TestSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            pending: VecDeque::new(),
            returned: Vec::new(),
            width,
            height,
            next_parity: FieldParity::Top,
            next_pts: 0,
            next_base: 0x4000_0000,
        }
    }

    fn frame(&mut self, scan: ScanKind, duration_us: i64) -> SourceFrame {
        let meta = FrameMeta {
            width: self.width,
            height: self.height,
            scan,
            source: SourceKind::Decoder,
            format: FrameFormat::default(),
            pts_us: self.next_pts,
            duration_us,
        };
        let canvas = Canvas {
            base: self.next_base,
            stride: self.width,
            width: self.width,
            height: self.height,
        };
        self.next_pts += duration_us;
        self.next_base += 0x10_0000;
        SourceFrame { meta, canvas }
    }

    pub fn push_fields(&mut self, n: usize) {
        for _ in 0..n {
            let scan = ScanKind::Interlaced(self.next_parity);
            self.next_parity = self.next_parity.next();
            let frame = self.frame(scan, FIELD_US);
            self.pending.push_back(frame);
        }
    }

    pub fn push_frames(&mut self, n: usize) {
        for _ in 0..n {
            let frame = self.frame(ScanKind::Progressive, FIELD_US * 2);
            self.pending.push_back(frame);
        }
    }

    pub fn set_geometry(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl TestSource {
    /// A boxed handle for the engine plus a shared view so the test can
    /// keep feeding frames and inspecting returned loans.
    pub fn into_shared(self) -> (SharedSource, Arc<Mutex<TestSource>>) {
        let shared = Arc::new(Mutex::new(self));
        (SharedSource(shared.clone()), shared)
    }
}

/// `FrameSource` facade over a shared [`TestSource`].
pub struct SharedSource(Arc<Mutex<TestSource>>);

impl SharedSource {
    fn with<R>(&self, f: impl FnOnce(&mut TestSource) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

impl FrameSource for SharedSource {
    fn peek(&mut self) -> Option<FrameMeta> {
        self.with(|s| s.peek())
    }

    fn get(&mut self) -> Option<SourceFrame> {
        self.with(|s| s.get())
    }

    fn put(&mut self, frame: SourceFrame) {
        self.with(|s| s.put(frame));
    }
}

impl FrameSource for TestSource {
    fn peek(&mut self) -> Option<FrameMeta> {
        self.pending.front().map(|f| f.meta)
    }

    fn get(&mut self) -> Option<SourceFrame> {
        self.pending.pop_front()
    }

    fn put(&mut self, frame: SourceFrame) {
        self.returned.push(frame);
    }
}

/// An interlaced 720x480 producer with `n` fields queued.
pub fn interlaced_source(n: usize) -> TestSource {
    let mut source = TestSource::new(720, 480);
    source.push_fields(n);
    source
}

/// A progressive 720x480 producer with `n` frames queued.
pub fn progressive_source(n: usize) -> TestSource {
    let mut source = TestSource::new(720, 480);
    source.push_frames(n);
    source
}

/// Engine state initialized against the source's first frame, driven by a
/// throwaway simulated unit.  Warm-up throw is disabled so short scenarios
/// see their frames delivered.
pub fn state_with(cfg: EngineConfig, source: &mut TestSource) -> EngineState {
    let cfg = EngineConfig {
        warmup_throw: 0,
        ..cfg
    };
    let (unit, _) = SimUnit::shared();
    let mut state = EngineState::new(cfg, Box::new(unit));
    let meta = source.peek().expect("fixture source must have frames");
    state.init_stream(&meta);
    state
}
