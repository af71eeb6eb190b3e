//! Rolling sample/feature window: fixed pre-allocated circular store.
//! Logically a shift-left-and-append array: newest frames at the tail,
//! oldest silently discarded. Frames can be scalars (raw PCM) or fixed-width
//! vectors (mel frames, embeddings).

/// Fixed-capacity window of `capacity` frames, each `width` floats wide.
pub struct RollingWindow {
    buffer: Box<[f32]>,
    /// Index (in frames) of the oldest frame.
    head: usize,
    capacity: usize,
    width: usize,
    /// Trailing frames not yet consumed by the downstream stage.
    new_count: usize,
}

impl RollingWindow {
    /// Window of `capacity` frames of `width` floats, zero-filled.
    pub fn new(capacity: usize, width: usize) -> Self {
        assert!(capacity > 0 && width > 0, "window dimensions must be non-zero");
        Self {
            buffer: vec![0.0; capacity * width].into_boxed_slice(),
            head: 0,
            capacity,
            width,
            new_count: 0,
        }
    }

    /// Scalar window (one float per frame), e.g. raw audio.
    pub fn scalar(capacity: usize) -> Self {
        Self::new(capacity, 1)
    }

    /// Shift left by the number of frames in `data` and write them at the tail.
    /// `data.len()` must be a multiple of the frame width; a trailing partial
    /// frame is ignored. More than `capacity` frames keeps only the newest.
    /// Returns the number of frames written.
    pub fn append(&mut self, data: &[f32]) -> usize {
        let frames = data.len() / self.width;
        if frames == 0 {
            return 0;
        }
        let skip = frames.saturating_sub(self.capacity);
        let data = &data[skip * self.width..frames * self.width];
        let written = frames - skip;

        for frame in data.chunks_exact(self.width) {
            let start = self.head * self.width;
            self.buffer[start..start + self.width].copy_from_slice(frame);
            self.head = (self.head + 1) % self.capacity;
        }

        self.new_count = (self.new_count + frames).min(self.capacity);
        written
    }

    /// Frame at logical position `index` (0 = oldest).
    pub fn frame(&self, index: usize) -> &[f32] {
        assert!(index < self.capacity, "frame index out of range");
        let slot = (self.head + index) % self.capacity;
        &self.buffer[slot * self.width..(slot + 1) * self.width]
    }

    /// Copy of the newest `n` frames in chronological order (flattened).
    pub fn last(&self, n: usize) -> Vec<f32> {
        let n = n.min(self.capacity);
        self.range(self.capacity - n, n)
    }

    /// Copy of `n` frames starting at logical position `start` (flattened).
    pub fn range(&self, start: usize, n: usize) -> Vec<f32> {
        let n = n.min(self.capacity.saturating_sub(start));
        let mut out = Vec::with_capacity(n * self.width);
        for i in start..start + n {
            out.extend_from_slice(self.frame(i));
        }
        out
    }

    /// Oldest `n` unconsumed frames, without consuming them.
    pub fn peek_unconsumed(&self, n: usize) -> Vec<f32> {
        let n = n.min(self.new_count);
        self.range(self.capacity - self.new_count, n)
    }

    /// Whole window in chronological order (flattened).
    pub fn to_vec(&self) -> Vec<f32> {
        self.range(0, self.capacity)
    }

    /// Mark `n` unconsumed frames as processed.
    pub fn consume(&mut self, n: usize) {
        self.new_count = self.new_count.saturating_sub(n);
    }

    /// Zero the contents and the unconsumed counter.
    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.head = 0;
        self.new_count = 0;
    }

    pub fn new_count(&self) -> usize {
        self.new_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn width(&self) -> usize {
        self.width
    }
}
