//! The seam between the coordination core and a drawing surface.
//!
//! The core never interprets image bytes; it only moves them between
//! participants. Implementations live with the UI; [`MemCanvas`] is the
//! in-memory reference used by the binary and the tests.

use parking_lot::Mutex;

use crate::wire::{Color, Point};

/// What the core needs from a drawing surface. Implementations are shared
/// across tasks, so interior mutability (one mutex) is theirs to provide.
pub trait Canvas: Send + Sync {
    /// Encoded snapshot of the whole board; bytes are opaque to the core.
    fn png_snapshot(&self) -> Vec<u8>;
    /// Draw a polyline through `points`.
    fn apply_stroke(&self, points: &[Point], color: Color);
    /// Replace the board contents with a received snapshot.
    fn apply_png(&self, bytes: &[u8]);
    /// Wipe the board.
    fn clear(&self);
}

/// In-memory canvas: keeps the stroke log and snapshots it as JSON. A
/// stand-in for real PNG encoding, which is exactly as opaque to the core.
#[derive(Default)]
pub struct MemCanvas {
    strokes: Mutex<Vec<(Vec<Point>, Color)>>,
}

impl MemCanvas {
    pub fn stroke_count(&self) -> usize {
        self.strokes.lock().len()
    }

    pub fn strokes(&self) -> Vec<(Vec<Point>, Color)> {
        self.strokes.lock().clone()
    }
}

impl Canvas for MemCanvas {
    fn png_snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(&*self.strokes.lock()).unwrap_or_default()
    }

    fn apply_stroke(&self, points: &[Point], color: Color) {
        self.strokes.lock().push((points.to_vec(), color));
    }

    fn apply_png(&self, bytes: &[u8]) {
        match serde_json::from_slice(bytes) {
            Ok(strokes) => *self.strokes.lock() = strokes,
            Err(e) => tracing::warn!("discarding unreadable snapshot: {e}"),
        }
    }

    fn clear(&self) {
        self.strokes.lock().clear();
    }
}

/// Accumulates pen points and cuts them into bounded Paint batches so a
/// long drag does not pile up into one huge message.
#[derive(Debug)]
pub struct StrokeBuffer {
    max_len: usize,
    color: Color,
    points: Vec<Point>,
}

impl StrokeBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            color: Color::Black,
            points: Vec::new(),
        }
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color;
    }

    /// Add a point. Once the line grows past the limit the accumulated
    /// batch is returned for sending; the next batch starts from the last
    /// point so the polyline stays connected.
    pub fn push(&mut self, point: Point) -> Option<(Vec<Point>, Color)> {
        self.points.push(point);
        if self.points.len() <= self.max_len {
            return None;
        }
        let batch = std::mem::take(&mut self.points);
        if let Some(&last) = batch.last() {
            self.points.push(last);
        }
        Some((batch, self.color))
    }

    /// Pen up: hand over whatever is left.
    pub fn flush(&mut self) -> Option<(Vec<Point>, Color)> {
        if self.points.is_empty() {
            None
        } else {
            Some((std::mem::take(&mut self.points), self.color))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: i32, y: i32) -> Point {
        Point { x, y }
    }

    #[test]
    fn snapshot_roundtrips_between_canvases() {
        let a = MemCanvas::default();
        a.apply_stroke(&[p(0, 0), p(1, 1)], Color::Black);
        a.apply_stroke(&[p(5, 5)], Color::White);

        let b = MemCanvas::default();
        b.apply_png(&a.png_snapshot());
        assert_eq!(a.strokes(), b.strokes());
    }

    #[test]
    fn clear_empties_the_board() {
        let c = MemCanvas::default();
        c.apply_stroke(&[p(1, 2)], Color::Black);
        c.clear();
        assert_eq!(c.stroke_count(), 0);
    }

    #[test]
    fn bad_snapshot_bytes_are_discarded() {
        let c = MemCanvas::default();
        c.apply_stroke(&[p(1, 2)], Color::Black);
        c.apply_png(b"definitely not a snapshot");
        // The existing content survives.
        assert_eq!(c.stroke_count(), 1);
    }

    #[test]
    fn stroke_buffer_flushes_past_the_limit() {
        let mut buf = StrokeBuffer::new(3);
        assert!(buf.push(p(0, 0)).is_none());
        assert!(buf.push(p(1, 0)).is_none());
        assert!(buf.push(p(2, 0)).is_none());
        let (batch, color) = buf.push(p(3, 0)).expect("forced flush");
        assert_eq!(batch.len(), 4);
        assert_eq!(color, Color::Black);

        // The next batch starts where the previous one ended.
        let (rest, _) = buf.flush().expect("tail");
        assert_eq!(rest, vec![p(3, 0)]);
    }

    #[test]
    fn stroke_buffer_flush_on_empty_is_none() {
        let mut buf = StrokeBuffer::new(3);
        assert!(buf.flush().is_none());
        buf.push(p(1, 1));
        assert!(buf.flush().is_some());
        assert!(buf.flush().is_none());
    }
}
