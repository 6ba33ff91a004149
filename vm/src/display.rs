/// Read-only view of the Display form handed to the host.
#[derive(Debug, Clone, Copy)]
pub struct DisplayView<'a> {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Raw 32-bit words of the form's bitmap, rows padded to word
    /// boundaries.
    pub bits: &'a [u32],
}

impl DisplayView<'_> {
    /// Words per scan line.
    pub fn pitch(&self) -> usize {
        let bits_per_line = self.width as usize * self.depth as usize;
        bits_per_line.div_ceil(32)
    }
}

/// A rectangle of the display the image asked to be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageRect {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl DamageRect {
    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }
}

pub type DamageListener = Box<dyn FnMut(DamageRect) + Send>;
