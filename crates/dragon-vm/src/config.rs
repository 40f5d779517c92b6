//! Tunable VM constants (`spec.md` §4.1, §4.5; `SPEC_FULL.md` §1).

/// Starting size of the frame ring, doubled on overflow.
pub const INITIAL_FRAMES: usize = 64;

/// Hard cap on call depth (`spec.md` §4.5): beyond this, `StackOverflowException`.
pub const FRAMES_MAX: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// `Heap` GC threshold in bytes before the first collection.
    pub initial_gc_threshold: usize,
    /// `next_gc = bytes_allocated * growth_factor`, must be >= 2.0.
    pub gc_growth_factor: f64,
    /// Starting frame-ring capacity; doubles on overflow up to `FRAMES_MAX`.
    pub initial_frames: usize,
    /// Value-stack slots reserved per frame at startup (`256 * frames`).
    pub stack_slots_per_frame: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            initial_gc_threshold: 1024 * 1024,
            gc_growth_factor: 2.0,
            initial_frames: INITIAL_FRAMES,
            stack_slots_per_frame: 256,
        }
    }
}
