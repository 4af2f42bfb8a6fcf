//! Buffer descriptors and the three fixed-capacity pools.
//!
//! All memory is carved up once at stream registration; steady-state
//! operation never allocates.  Buffers are identified by [`BufToken`]
//! (pool kind + index) and every cross-buffer relationship — the temporal
//! duplicate window, the owned set a composed frame must recycle, the
//! linked half of a split progressive frame — is stored as tokens resolved
//! through [`BufferArena`], never as references.

use std::fmt;

use fieldweave_core::hw::BlendMode;
use fieldweave_core::types::{Canvas, FrameMeta};

use crate::queue::QueueId;

// ─── Identity ────────────────────────────────────────────────────────────

/// Which pool a buffer belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Wraps a producer-owned frame surface.
    Input,
    /// Engine-owned field intermediate (pre-process output).
    Local,
    /// Engine-owned progressive output surface (post-process output).
    Post,
}

impl PoolKind {
    pub const ALL: [PoolKind; 3] = [PoolKind::Input, PoolKind::Local, PoolKind::Post];

    pub fn label(self) -> &'static str {
        match self {
            Self::Input => "in",
            Self::Local => "loc",
            Self::Post => "post",
        }
    }
}

/// Stable buffer identity: pool kind + slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufToken {
    pub kind: PoolKind,
    pub index: u8,
}

impl BufToken {
    pub fn new(kind: PoolKind, index: u8) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for BufToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind.label(), self.index)
    }
}

// ─── Per-buffer behavior tag ─────────────────────────────────────────────

/// How the post stage should treat a ready buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PostOp {
    /// Pass through as-is (progressive or bypassed input).
    #[default]
    None,
    /// Field intermediate awaiting temporal composition.
    Deinterlace,
    /// Ready-marker inserted on a source change; composes to nothing and
    /// recycles its window immediately.
    Dummy,
    /// Post processing disabled for this field; compose spatially from this
    /// field alone.
    Disable,
}

// ─── Buffer descriptor ───────────────────────────────────────────────────

/// One pool buffer.  `queue` is the attachment invariant: `None` exactly
/// when the buffer is held by a state-machine context slot or by nothing.
#[derive(Clone, Debug)]
pub struct Buffer {
    pub token: BufToken,
    pub queue: Option<QueueId>,
    /// Held while the pre stage may still read this buffer as a temporal
    /// reference.
    pub pre_ref: u32,
    /// Held while a composed output frame still reads this buffer.
    pub post_ref: u32,
    /// Temporal window a composed post buffer reads (previous, current,
    /// next field).
    pub dup: [Option<BufToken>; 3],
    /// Ready buffers this composed frame consumed; recycled when the
    /// consumer returns the frame.
    pub owned: [Option<BufToken>; 2],
    /// The other half of a split progressive frame.
    pub linked: Option<BufToken>,
    pub canvas: Canvas,
    pub meta: FrameMeta,
    pub op: PostOp,
    /// Composition mode chosen for this output frame.
    pub blend: BlendMode,
    /// Warm-up / drop tag: composed frames touching a thrown field are
    /// recycled instead of delivered.
    pub throw: bool,
    /// Motion count read back from the pre pass that wrote this field;
    /// saturated when no analysis ran.
    pub motion: u32,
    /// Whether this composed frame holds `post_ref` counts on its duplicate
    /// window (recycle must decrement exactly when it does).
    pub refs_held: bool,
    pub seq: u64,
}

impl Buffer {
    fn new(token: BufToken, canvas: Canvas) -> Self {
        Self {
            token,
            queue: None,
            pre_ref: 0,
            post_ref: 0,
            dup: [None; 3],
            owned: [None; 2],
            linked: None,
            canvas,
            meta: FrameMeta::default(),
            op: PostOp::None,
            blend: BlendMode::Bypass,
            throw: false,
            motion: u32::MAX,
            refs_held: false,
            seq: 0,
        }
    }

    /// Clear everything except identity and canvas.  Used when a buffer
    /// returns to its free queue.
    pub fn reset(&mut self) {
        self.pre_ref = 0;
        self.post_ref = 0;
        self.dup = [None; 3];
        self.owned = [None; 2];
        self.linked = None;
        self.meta = FrameMeta::default();
        self.op = PostOp::None;
        self.blend = BlendMode::Bypass;
        self.throw = false;
        self.motion = u32::MAX;
        self.refs_held = false;
        self.seq = 0;
    }
}

// ─── Arena ───────────────────────────────────────────────────────────────

/// Pool sizes fixed at stream registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolCapacities {
    pub input: usize,
    pub local: usize,
    pub post: usize,
}

impl PoolCapacities {
    pub fn total(&self) -> usize {
        self.input + self.local + self.post
    }
}

/// All pool buffers, indexed by token.
#[derive(Debug, Default)]
pub struct BufferArena {
    input: Vec<Buffer>,
    local: Vec<Buffer>,
    post: Vec<Buffer>,
}

// Simulated physical layout: each pool gets its own region so canvas
// addresses stay distinct and stable across a stream's lifetime.
const LOCAL_REGION: u64 = 0x1000_0000;
const POST_REGION: u64 = 0x2000_0000;

fn aligned_stride(width: u32, ten_bit: bool) -> u32 {
    let bytes = width * if ten_bit { 2 } else { 1 };
    bytes.div_ceil(64) * 64
}

impl BufferArena {
    /// Carve the pools for a stream of the given geometry.  Input canvases
    /// stay empty; they are filled from the producer frame at acquire time.
    pub fn init(caps: PoolCapacities, width: u32, height: u32, ten_bit: bool) -> Self {
        let stride = aligned_stride(width, ten_bit);
        let field_size = u64::from(stride) * u64::from(height.div_ceil(2));
        let frame_size = u64::from(stride) * u64::from(height);

        let input = (0..caps.input)
            .map(|i| Buffer::new(BufToken::new(PoolKind::Input, i as u8), Canvas::default()))
            .collect();
        let local = (0..caps.local)
            .map(|i| {
                let canvas = Canvas {
                    base: LOCAL_REGION + field_size * i as u64,
                    stride,
                    width,
                    height: height / 2,
                };
                Buffer::new(BufToken::new(PoolKind::Local, i as u8), canvas)
            })
            .collect();
        let post = (0..caps.post)
            .map(|i| {
                let canvas = Canvas {
                    base: POST_REGION + frame_size * i as u64,
                    stride,
                    width,
                    height,
                };
                Buffer::new(BufToken::new(PoolKind::Post, i as u8), canvas)
            })
            .collect();

        Self {
            input,
            local,
            post,
        }
    }

    pub fn capacity(&self, kind: PoolKind) -> usize {
        self.pool(kind).len()
    }

    pub fn total(&self) -> usize {
        self.input.len() + self.local.len() + self.post.len()
    }

    fn pool(&self, kind: PoolKind) -> &Vec<Buffer> {
        match kind {
            PoolKind::Input => &self.input,
            PoolKind::Local => &self.local,
            PoolKind::Post => &self.post,
        }
    }

    /// Resolve a token.  `None` means the token is invalid for this arena;
    /// callers record a fault.
    pub fn get(&self, token: BufToken) -> Option<&Buffer> {
        self.pool(token.kind).get(usize::from(token.index))
    }

    pub fn get_mut(&mut self, token: BufToken) -> Option<&mut Buffer> {
        let pool = match token.kind {
            PoolKind::Input => &mut self.input,
            PoolKind::Local => &mut self.local,
            PoolKind::Post => &mut self.post,
        };
        pool.get_mut(usize::from(token.index))
    }

    pub fn iter(&self, kind: PoolKind) -> impl Iterator<Item = &Buffer> {
        self.pool(kind).iter()
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &Buffer> {
        self.input.iter().chain(self.local.iter()).chain(self.post.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> PoolCapacities {
        PoolCapacities {
            input: 4,
            local: 6,
            post: 5,
        }
    }

    #[test]
    fn init_carves_all_pools() {
        let arena = BufferArena::init(caps(), 720, 480, false);
        assert_eq!(arena.capacity(PoolKind::Input), 4);
        assert_eq!(arena.capacity(PoolKind::Local), 6);
        assert_eq!(arena.capacity(PoolKind::Post), 5);
        assert_eq!(arena.total(), 15);
    }

    #[test]
    fn local_canvases_do_not_overlap() {
        let arena = BufferArena::init(caps(), 720, 480, false);
        let stride = aligned_stride(720, false);
        let field_size = u64::from(stride) * 240;
        let bases: Vec<u64> = arena.iter(PoolKind::Local).map(|b| b.canvas.base).collect();
        for pair in bases.windows(2) {
            assert!(pair[1] - pair[0] >= field_size);
        }
    }

    #[test]
    fn tokens_resolve_to_matching_buffers() {
        let arena = BufferArena::init(caps(), 720, 480, false);
        let token = BufToken::new(PoolKind::Post, 3);
        let buf = arena.get(token).expect("valid token");
        assert_eq!(buf.token, token);
        assert!(arena.get(BufToken::new(PoolKind::Post, 9)).is_none());
    }

    #[test]
    fn ten_bit_widens_stride() {
        let narrow = BufferArena::init(caps(), 720, 480, false);
        let wide = BufferArena::init(caps(), 720, 480, true);
        let narrow_stride = narrow
            .get(BufToken::new(PoolKind::Local, 0))
            .expect("buffer")
            .canvas
            .stride;
        let wide_stride = wide
            .get(BufToken::new(PoolKind::Local, 0))
            .expect("buffer")
            .canvas
            .stride;
        assert!(wide_stride > narrow_stride);
    }

    #[test]
    fn reset_preserves_identity_and_canvas() {
        let mut arena = BufferArena::init(caps(), 720, 480, false);
        let token = BufToken::new(PoolKind::Local, 1);
        let canvas = arena.get(token).expect("buffer").canvas;
        {
            let buf = arena.get_mut(token).expect("buffer");
            buf.pre_ref = 2;
            buf.throw = true;
            buf.reset();
        }
        let buf = arena.get(token).expect("buffer");
        assert_eq!(buf.pre_ref, 0);
        assert!(!buf.throw);
        assert_eq!(buf.token, token);
        assert_eq!(buf.canvas, canvas);
    }
}
