use crate::supervisor::FrameWindow;

/// Index of the next prerecorded frame, looping over a fixed window.
#[derive(Clone, Debug)]
pub(crate) struct FrameCursor {
    window: FrameWindow,
    next: u32,
    last_emitted: Option<u32>,
}

impl FrameCursor {
    pub(crate) fn new(window: FrameWindow) -> Self {
        Self {
            window,
            next: window.first,
            last_emitted: None,
        }
    }

    /// Index that the next tick will emit.
    #[cfg(test)]
    pub(crate) fn peek(&self) -> u32 {
        self.next
    }

    /// Most recently emitted index, or the window start before the first tick.
    pub(crate) fn current(&self) -> u32 {
        self.last_emitted.unwrap_or(self.window.first)
    }

    /// Return the index to emit now and move past it, wrapping after the window end.
    pub(crate) fn advance(&mut self) -> u32 {
        let emitted = self.next;
        self.next = if emitted >= self.window.last {
            self.window.first
        } else {
            emitted + 1
        };
        self.last_emitted = Some(emitted);
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: FrameWindow = FrameWindow {
        first: 16,
        last: 451,
    };

    #[test]
    fn wraps_to_start_after_a_full_loop() {
        let mut cursor = FrameCursor::new(WINDOW);
        let emitted: Vec<u32> = (0..436).map(|_| cursor.advance()).collect();

        assert_eq!(emitted.first(), Some(&16));
        assert_eq!(emitted.last(), Some(&451));
        assert!(emitted.windows(2).all(|pair| pair[1] == pair[0] + 1));
        assert_eq!(cursor.peek(), 16);
        assert_eq!(cursor.advance(), 16);
    }

    #[test]
    fn current_tracks_the_last_emitted_frame() {
        let mut cursor = FrameCursor::new(WINDOW);
        assert_eq!(cursor.current(), 16);
        cursor.advance();
        cursor.advance();
        assert_eq!(cursor.current(), 17);
        assert_eq!(cursor.peek(), 18);
    }

    #[test]
    fn single_frame_window_repeats() {
        let mut cursor = FrameCursor::new(FrameWindow {
            first: 3,
            last: 3,
        });
        assert_eq!([cursor.advance(), cursor.advance()], [3, 3]);
    }
}
