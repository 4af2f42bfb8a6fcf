//! Frame metadata and memory descriptors shared across crate boundaries.
//!
//! These are plain-old-data types: every cross-buffer relationship in the
//! engine is expressed through tokens and indices, never through owning
//! references, so the types here stay `Copy` wherever possible.

// ─── Field / frame structure ─────────────────────────────────────────────

/// Which half of an interlaced frame a field carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldParity {
    Top,
    Bottom,
}

impl FieldParity {
    /// The parity of the field that follows this one in display order.
    pub fn next(self) -> Self {
        match self {
            Self::Top => Self::Bottom,
            Self::Bottom => Self::Top,
        }
    }
}

/// Scan structure of a source frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanKind {
    Progressive,
    Interlaced(FieldParity),
}

impl ScanKind {
    pub fn is_progressive(self) -> bool {
        matches!(self, Self::Progressive)
    }

    pub fn parity(self) -> Option<FieldParity> {
        match self {
            Self::Progressive => None,
            Self::Interlaced(p) => Some(p),
        }
    }
}

/// Where the stream originates.  Part of the format-change key: switching
/// producers mid-stream invalidates the carried-forward temporal window
/// exactly like a geometry change does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Decoder,
    Tuner,
    Camera,
}

/// Pixel-layout flags relevant to buffer sizing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameFormat {
    /// 10-bit samples (wider canvas stride).
    pub ten_bit: bool,
    /// Frame arrives in a compressed framebuffer layout the deinterlacer
    /// cannot read directly; such frames are always bypassed.
    pub compressed: bool,
}

// ─── Per-frame metadata ──────────────────────────────────────────────────

/// Metadata accompanying every frame or field through the pipeline.
#[derive(Clone, Copy, Debug)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub scan: ScanKind,
    pub source: SourceKind,
    pub format: FrameFormat,
    /// Presentation timestamp in microseconds.
    pub pts_us: i64,
    /// Frame duration in microseconds; halved when a progressive frame is
    /// split into two fields.
    pub duration_us: i64,
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            scan: ScanKind::Progressive,
            source: SourceKind::Decoder,
            format: FrameFormat::default(),
            pts_us: 0,
            duration_us: 0,
        }
    }
}

impl FrameMeta {
    pub fn is_progressive(&self) -> bool {
        self.scan.is_progressive()
    }

    /// The (width, height, scan-class, source, format) key used for
    /// format-change detection.  Field parity is excluded: alternating
    /// top/bottom fields are the normal case, not a change.
    pub fn change_key(&self) -> ChangeKey {
        ChangeKey {
            width: self.width,
            height: self.height,
            progressive: self.is_progressive(),
            source: self.source,
            format: self.format,
        }
    }
}

/// Comparison key for source/format change detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangeKey {
    pub width: u32,
    pub height: u32,
    pub progressive: bool,
    pub source: SourceKind,
    pub format: FrameFormat,
}

// ─── Canvas (memory-interface descriptor) ────────────────────────────────

/// Describes one planar surface the hardware unit reads or writes.
///
/// This is the software half of the memory-interface contract: base address,
/// line stride, and the geometry the unit should walk.  Register-level
/// programming lives behind the [`crate::hw::VideoUnit`] seam.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Canvas {
    pub base: u64,
    pub stride: u32,
    pub width: u32,
    pub height: u32,
}

impl Canvas {
    /// Canvas for one field of an interlaced surface: same base plane,
    /// doubled stride, offset by one line for the bottom field.
    pub fn field_view(&self, parity: FieldParity) -> Canvas {
        let base = match parity {
            FieldParity::Top => self.base,
            FieldParity::Bottom => self.base + u64::from(self.stride),
        };
        Canvas {
            base,
            stride: self.stride * 2,
            width: self.width,
            height: self.height / 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(width: u32, scan: ScanKind) -> FrameMeta {
        FrameMeta {
            width,
            height: 480,
            scan,
            source: SourceKind::Decoder,
            format: FrameFormat::default(),
            pts_us: 0,
            duration_us: 16_683,
        }
    }

    #[test]
    fn parity_alternation_is_not_a_change() {
        let top = meta(720, ScanKind::Interlaced(FieldParity::Top));
        let bottom = meta(720, ScanKind::Interlaced(FieldParity::Bottom));
        assert_eq!(top.change_key(), bottom.change_key());
    }

    #[test]
    fn geometry_change_is_detected() {
        let a = meta(720, ScanKind::Interlaced(FieldParity::Top));
        let b = meta(1920, ScanKind::Interlaced(FieldParity::Top));
        assert_ne!(a.change_key(), b.change_key());
    }

    #[test]
    fn scan_class_change_is_detected() {
        let a = meta(720, ScanKind::Interlaced(FieldParity::Top));
        let b = meta(720, ScanKind::Progressive);
        assert_ne!(a.change_key(), b.change_key());
    }

    #[test]
    fn field_view_offsets_bottom_by_one_line() {
        let full = Canvas {
            base: 0x1000,
            stride: 768,
            width: 720,
            height: 480,
        };
        let top = full.field_view(FieldParity::Top);
        let bottom = full.field_view(FieldParity::Bottom);
        assert_eq!(top.base, 0x1000);
        assert_eq!(bottom.base, 0x1000 + 768);
        assert_eq!(top.stride, 1536);
        assert_eq!(top.height, 240);
    }
}
