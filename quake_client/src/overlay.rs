//! Screen overlays.
//!
//! Overlays are 2D elements drawn over the world view (center prints, the
//! console notify lines). The UI layer looks them up by name and asks
//! whether they are visible and to draw themselves. What an overlay can do
//! beyond that is exposed through capability accessors, so the registry
//! can forward text or resets without knowing concrete types.

use std::collections::{HashMap, VecDeque};

use quake_shared::render::RenderBackend;
use tracing::trace;

/// Virtual screen the overlays lay themselves out in.
pub const SCREEN_WIDTH: i32 = 320;
pub const SCREEN_HEIGHT: i32 = 200;
/// Character cell size.
pub const CHAR_SIZE: i32 = 8;
/// Widest line a center print shows.
pub const CENTER_LINE_CHARS: usize = 40;
pub const NUM_NOTIFY_LINES: usize = 4;

pub trait Drawable {
    fn draw(&self, backend: &mut dyn RenderBackend, time: f64);
}

pub trait TextReceiver {
    fn receive(&mut self, text: &str, time: f64);
}

pub trait Resettable {
    fn reset(&mut self);
}

/// A named screen element.
pub trait Overlay: Send {
    fn name(&self) -> &str;
    fn is_visible(&self, time: f64) -> bool;

    fn as_drawable(&self) -> Option<&dyn Drawable> {
        None
    }

    fn as_text_receiver(&mut self) -> Option<&mut dyn TextReceiver> {
        None
    }

    fn as_resettable(&mut self) -> Option<&mut dyn Resettable> {
        None
    }
}

/// Name-keyed overlay set, drawn in registration order.
#[derive(Default)]
pub struct OverlayRegistry {
    overlays: HashMap<String, Box<dyn Overlay>>,
    order: Vec<String>,
}

impl OverlayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the engine's standard overlays.
    pub fn with_defaults(center_time: f32, notify_time: f32) -> Self {
        let mut r = Self::new();
        r.register(Box::new(CenterPrint::new(center_time)));
        r.register(Box::new(NotifyLines::new(notify_time)));
        r
    }

    /// Adds `overlay`, replacing any overlay with the same name.
    pub fn register(&mut self, overlay: Box<dyn Overlay>) {
        let name = overlay.name().to_string();
        if self.overlays.insert(name.clone(), overlay).is_none() {
            self.order.push(name);
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn is_visible(&self, name: &str, time: f64) -> bool {
        self.overlays.get(name).is_some_and(|o| o.is_visible(time))
    }

    /// Draws `name` if it is visible and drawable. Returns whether it drew.
    pub fn draw(&self, name: &str, backend: &mut dyn RenderBackend, time: f64) -> bool {
        let Some(overlay) = self.overlays.get(name) else {
            return false;
        };
        if !overlay.is_visible(time) {
            return false;
        }
        match overlay.as_drawable() {
            Some(d) => {
                d.draw(backend, time);
                true
            }
            None => false,
        }
    }

    /// Draws every visible overlay; returns how many drew.
    pub fn draw_all(&self, backend: &mut dyn RenderBackend, time: f64) -> usize {
        self.order
            .iter()
            .filter(|name| self.draw(name, backend, time))
            .count()
    }

    /// Hands `text` to overlay `name`. Returns false when it takes no text.
    pub fn send_text(&mut self, name: &str, text: &str, time: f64) -> bool {
        match self.overlays.get_mut(name).and_then(|o| o.as_text_receiver()) {
            Some(r) => {
                r.receive(text, time);
                true
            }
            None => {
                trace!(overlay = name, "overlay takes no text");
                false
            }
        }
    }

    /// Resets every resettable overlay (level change, disconnect).
    pub fn reset_all(&mut self) {
        for overlay in self.overlays.values_mut() {
            if let Some(r) = overlay.as_resettable() {
                r.reset();
            }
        }
    }
}

/// Splits `text` into display lines no wider than `width` characters.
fn wrap_lines(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for line in text.split('\n') {
        let chars: Vec<char> = line.chars().collect();
        if chars.is_empty() {
            lines.push(String::new());
            continue;
        }
        for chunk in chars.chunks(width) {
            lines.push(chunk.iter().collect());
        }
    }
    lines
}

/// Large message in the middle of the screen that expires after
/// `scr_centertime` seconds.
pub struct CenterPrint {
    lines: Vec<String>,
    start: f64,
    duration: f32,
}

impl CenterPrint {
    pub const NAME: &'static str = "centerprint";

    pub fn new(duration: f32) -> Self {
        Self {
            lines: Vec::new(),
            start: 0.0,
            duration,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl Overlay for CenterPrint {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_visible(&self, time: f64) -> bool {
        !self.lines.is_empty() && time - self.start < f64::from(self.duration)
    }

    fn as_drawable(&self) -> Option<&dyn Drawable> {
        Some(self)
    }

    fn as_text_receiver(&mut self) -> Option<&mut dyn TextReceiver> {
        Some(self)
    }

    fn as_resettable(&mut self) -> Option<&mut dyn Resettable> {
        Some(self)
    }
}

impl Drawable for CenterPrint {
    fn draw(&self, backend: &mut dyn RenderBackend, _time: f64) {
        let mut y = if self.lines.len() <= 4 {
            SCREEN_HEIGHT * 35 / 100
        } else {
            48
        };
        for line in &self.lines {
            let x = (SCREEN_WIDTH - line.chars().count() as i32 * CHAR_SIZE) / 2;
            backend.draw_text(x, y, line);
            y += CHAR_SIZE;
        }
    }
}

impl TextReceiver for CenterPrint {
    fn receive(&mut self, text: &str, time: f64) {
        self.lines = wrap_lines(text.trim_end_matches('\n'), CENTER_LINE_CHARS);
        self.start = time;
    }
}

impl Resettable for CenterPrint {
    fn reset(&mut self) {
        self.lines.clear();
    }
}

/// The last few console lines, shown at the top of the screen for
/// `con_notifytime` seconds each.
pub struct NotifyLines {
    lines: VecDeque<(String, f64)>,
    lifetime: f32,
}

impl NotifyLines {
    pub const NAME: &'static str = "notify";

    pub fn new(lifetime: f32) -> Self {
        Self {
            lines: VecDeque::with_capacity(NUM_NOTIFY_LINES),
            lifetime,
        }
    }

    fn live(&self, time: f64) -> impl Iterator<Item = &str> {
        let lifetime = f64::from(self.lifetime);
        self.lines
            .iter()
            .filter(move |(_, t)| time - t < lifetime)
            .map(|(s, _)| s.as_str())
    }
}

impl Overlay for NotifyLines {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_visible(&self, time: f64) -> bool {
        self.live(time).next().is_some()
    }

    fn as_drawable(&self) -> Option<&dyn Drawable> {
        Some(self)
    }

    fn as_text_receiver(&mut self) -> Option<&mut dyn TextReceiver> {
        Some(self)
    }

    fn as_resettable(&mut self) -> Option<&mut dyn Resettable> {
        Some(self)
    }
}

impl Drawable for NotifyLines {
    fn draw(&self, backend: &mut dyn RenderBackend, time: f64) {
        for (i, line) in self.live(time).enumerate() {
            backend.draw_text(CHAR_SIZE, i as i32 * CHAR_SIZE, line);
        }
    }
}

impl TextReceiver for NotifyLines {
    fn receive(&mut self, text: &str, time: f64) {
        for line in wrap_lines(text.trim_end_matches('\n'), (SCREEN_WIDTH / CHAR_SIZE) as usize - 2) {
            if self.lines.len() == NUM_NOTIFY_LINES {
                self.lines.pop_front();
            }
            self.lines.push_back((line, time));
        }
    }
}

impl Resettable for NotifyLines {
    fn reset(&mut self) {
        self.lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quake_shared::render::{DrawCall, RecordingRenderer};

    /// Visible but has nothing else to offer.
    struct Crosshair;

    impl Overlay for Crosshair {
        fn name(&self) -> &str {
            "crosshair"
        }

        fn is_visible(&self, _time: f64) -> bool {
            true
        }
    }

    #[test]
    fn center_print_expires() {
        let mut r = OverlayRegistry::with_defaults(2.0, 3.0);
        assert!(!r.is_visible(CenterPrint::NAME, 0.0));
        assert!(r.send_text(CenterPrint::NAME, "The Slipgate\nComplex\n", 10.0));
        assert!(r.is_visible(CenterPrint::NAME, 11.9));
        assert!(!r.is_visible(CenterPrint::NAME, 12.0));

        let mut backend = RecordingRenderer::default();
        assert!(r.draw(CenterPrint::NAME, &mut backend, 11.0));
        assert_eq!(backend.texts(), ["The Slipgate", "Complex"]);
        assert_eq!(
            backend.calls[1],
            DrawCall::Text {
                x: (320 - 7 * 8) / 2,
                y: 78,
                text: "Complex".into()
            }
        );
    }

    #[test]
    fn long_center_print_wraps() {
        let mut cp = CenterPrint::new(2.0);
        cp.receive(&"x".repeat(90), 0.0);
        let widths: Vec<_> = cp.lines().iter().map(String::len).collect();
        assert_eq!(widths, [40, 40, 10]);
    }

    #[test]
    fn notify_keeps_the_newest_lines() {
        let mut r = OverlayRegistry::with_defaults(2.0, 3.0);
        for (i, t) in [0.0, 1.0, 2.0, 2.5, 2.6].into_iter().enumerate() {
            r.send_text(NotifyLines::NAME, &format!("line {i}\n"), t);
        }
        let mut backend = RecordingRenderer::default();
        r.draw(NotifyLines::NAME, &mut backend, 4.5);
        assert_eq!(backend.texts(), ["line 2", "line 3", "line 4"]);

        r.reset_all();
        assert!(!r.is_visible(NotifyLines::NAME, 4.5));
    }

    #[test]
    fn capabilities_are_optional() {
        let mut r = OverlayRegistry::new();
        r.register(Box::new(Crosshair));
        let mut backend = RecordingRenderer::default();
        assert!(r.is_visible("crosshair", 0.0));
        assert!(!r.draw("crosshair", &mut backend, 0.0));
        assert!(!r.send_text("crosshair", "hi", 0.0));
        assert!(!r.is_visible("scoreboard", 0.0));
        assert_eq!(r.names().collect::<Vec<_>>(), ["crosshair"]);
    }
}
