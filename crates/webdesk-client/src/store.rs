//! Window State Store: the locally-owned window list.
//!
//! Every operation is synchronous, performs no I/O and reports whether it
//! changed anything. Operations on unknown window ids are ignored and report
//! `false`; callers (background reconciliation in particular) rely on that.

use serde_json::Value;
use webdesk_core::{new_window_id, Position, Size, Window, WindowId};

/// Highest z value handed out before the stack is re-ranked to `1..=N`.
pub const Z_CEILING: i64 = 10_000;
pub const TITLE_BAR_HEIGHT: f64 = 32.0;
/// Horizontal pixels of a window that must stay on screen.
pub const MIN_VISIBLE: f64 = 100.0;
pub const MIN_WIDTH: f64 = 200.0;
pub const MIN_HEIGHT: f64 = 150.0;
pub const DEFAULT_WINDOW_SIZE: Size = Size { w: 800.0, h: 600.0 };

const CASCADE_ORIGIN: f64 = 50.0;
const CASCADE_STEP: f64 = 30.0;
const CASCADE_SLOTS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920.0,
            height: 1080.0,
        }
    }
}

/// Request to open a window. The id is minted up front so the caller can
/// refer to the window before the store has accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWindow {
    pub id: WindowId,
    pub app: String,
    pub position: Option<Position>,
    pub size: Option<Size>,
    pub data: Option<Value>,
}

impl NewWindow {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            id: new_window_id(),
            app: app.into(),
            position: None,
            size: None,
            data: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<WindowId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn sized(mut self, w: f64, h: f64) -> Self {
        self.size = Some(Size { w, h });
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    /// Insertion order.
    pub windows: Vec<Window>,
    pub focused: Option<WindowId>,
    pub revision: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WindowStore {
    windows: Vec<Window>,
    focused: Option<WindowId>,
    viewport: Viewport,
    revision: u64,
    opened: u64,
}

impl WindowStore {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            viewport,
            ..Self::default()
        }
    }

    pub fn open(&mut self, request: NewWindow) -> bool {
        if self.index_of(&request.id).is_some() {
            return false;
        }
        let size = self.clamp_size(request.size.unwrap_or(DEFAULT_WINDOW_SIZE));
        let position = request
            .position
            .filter(|pos| pos.x.is_finite() && pos.y.is_finite())
            .unwrap_or_else(|| self.cascade_position());
        let position = self.clamp_position(position, size);
        let z = self.next_z();
        self.opened += 1;
        self.focused = Some(request.id.clone());
        self.windows.push(Window {
            id: request.id,
            app: request.app,
            position,
            size,
            minimized: false,
            maximized: false,
            z,
            data: request.data,
        });
        self.touch()
    }

    pub fn close(&mut self, id: &str) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        self.windows.remove(index);
        if self.focused.as_deref() == Some(id) {
            self.focused = self.top().map(|window| window.id.clone());
        }
        self.touch()
    }

    pub fn minimize(&mut self, id: &str) -> bool {
        match self.window_mut(id) {
            Some(window) if !window.minimized => window.minimized = true,
            _ => return false,
        }
        self.touch()
    }

    pub fn maximize(&mut self, id: &str) -> bool {
        match self.window_mut(id) {
            Some(window) if !window.maximized || window.minimized => {
                window.maximized = true;
                window.minimized = false;
            }
            _ => return false,
        }
        self.touch()
    }

    pub fn restore(&mut self, id: &str) -> bool {
        let Some(window) = self.window_mut(id) else {
            return false;
        };
        let flags_changed = window.minimized || window.maximized;
        window.minimized = false;
        window.maximized = false;
        let raised = self.raise(id);
        if flags_changed || raised {
            self.touch()
        } else {
            false
        }
    }

    /// Raises and focuses `id`. A minimized window is restored to view; a
    /// maximized one stays maximized.
    pub fn focus(&mut self, id: &str) -> bool {
        let Some(window) = self.window_mut(id) else {
            return false;
        };
        let was_minimized = std::mem::replace(&mut window.minimized, false);
        let raised = self.raise(id);
        if was_minimized || raised {
            self.touch()
        } else {
            false
        }
    }

    pub fn move_to(&mut self, id: &str, x: f64, y: f64) -> bool {
        if !x.is_finite() || !y.is_finite() {
            return false;
        }
        let Some(index) = self.index_of(id) else {
            return false;
        };
        let window = &self.windows[index];
        if window.maximized {
            return false;
        }
        let position = self.clamp_position(Position { x, y }, window.size);
        if position == window.position {
            return false;
        }
        self.windows[index].position = position;
        self.touch()
    }

    pub fn resize(&mut self, id: &str, w: f64, h: f64) -> bool {
        if !w.is_finite() || !h.is_finite() {
            return false;
        }
        let Some(index) = self.index_of(id) else {
            return false;
        };
        let window = &self.windows[index];
        if window.maximized {
            return false;
        }
        let size = self.clamp_size(Size { w, h });
        let position = self.clamp_position(window.position, size);
        if size == window.size && position == window.position {
            return false;
        }
        let window = &mut self.windows[index];
        window.size = size;
        window.position = position;
        self.touch()
    }

    pub fn set_data(&mut self, id: &str, data: Option<Value>) -> bool {
        match self.window_mut(id) {
            Some(window) if window.data != data => window.data = data,
            _ => return false,
        }
        self.touch()
    }

    /// Updates the viewport and pulls every window back inside it.
    pub fn set_viewport(&mut self, width: f64, height: f64) -> bool {
        if !(width.is_finite() && height.is_finite()) || width <= 0.0 || height <= 0.0 {
            return false;
        }
        let viewport = Viewport { width, height };
        if viewport == self.viewport {
            return false;
        }
        self.viewport = viewport;
        for index in 0..self.windows.len() {
            let size = self.clamp_size(self.windows[index].size);
            let position = self.clamp_position(self.windows[index].position, size);
            let window = &mut self.windows[index];
            window.size = size;
            window.position = position;
        }
        self.touch()
    }

    pub fn clear(&mut self) -> bool {
        if self.windows.is_empty() {
            return false;
        }
        self.windows.clear();
        self.focused = None;
        self.touch()
    }

    pub fn get(&self, id: &str) -> Option<&Window> {
        self.windows.iter().find(|window| window.id == id)
    }

    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    /// Bottom-to-top render order.
    pub fn windows_by_z(&self) -> Vec<&Window> {
        let mut ordered: Vec<&Window> = self.windows.iter().collect();
        ordered.sort_by_key(|window| window.z);
        ordered
    }

    pub fn windows_for_app(&self, app: &str) -> Vec<&Window> {
        self.windows.iter().filter(|window| window.app == app).collect()
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            windows: self.windows.clone(),
            focused: self.focused.clone(),
            revision: self.revision,
        }
    }

    fn touch(&mut self) -> bool {
        self.revision += 1;
        true
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.windows.iter().position(|window| window.id == id)
    }

    fn window_mut(&mut self, id: &str) -> Option<&mut Window> {
        self.windows.iter_mut().find(|window| window.id == id)
    }

    fn top(&self) -> Option<&Window> {
        self.windows.iter().max_by_key(|window| window.z)
    }

    fn max_z(&self) -> i64 {
        self.windows.iter().map(|window| window.z).max().unwrap_or(0)
    }

    /// Brings `id` to the top of the stack and focuses it. Returns whether
    /// z or focus moved.
    fn raise(&mut self, id: &str) -> bool {
        let focus_changed = self.focused.as_deref() != Some(id);
        self.focused = Some(id.to_string());
        let is_top = self.top().map(|window| window.id == id).unwrap_or(false);
        if is_top {
            return focus_changed;
        }
        let z = self.next_z();
        if let Some(window) = self.window_mut(id) {
            window.z = z;
        }
        true
    }

    fn next_z(&mut self) -> i64 {
        let next = self.max_z() + 1;
        if next <= Z_CEILING {
            return next;
        }
        self.renormalize();
        self.windows.len() as i64 + 1
    }

    /// Re-ranks z to `1..=N`, keeping relative order.
    fn renormalize(&mut self) {
        let mut order: Vec<usize> = (0..self.windows.len()).collect();
        order.sort_by_key(|index| self.windows[*index].z);
        for (rank, index) in order.into_iter().enumerate() {
            self.windows[index].z = rank as i64 + 1;
        }
    }

    fn cascade_position(&self) -> Position {
        let slot = (self.opened % CASCADE_SLOTS) as f64;
        Position {
            x: CASCADE_ORIGIN + CASCADE_STEP * slot,
            y: CASCADE_ORIGIN + CASCADE_STEP * slot,
        }
    }

    fn clamp_size(&self, size: Size) -> Size {
        let max_w = self.viewport.width.max(MIN_WIDTH);
        let max_h = self.viewport.height.max(MIN_HEIGHT);
        Size {
            w: size.w.clamp(MIN_WIDTH, max_w),
            h: size.h.clamp(MIN_HEIGHT, max_h),
        }
    }

    fn clamp_position(&self, position: Position, size: Size) -> Position {
        let min_x = MIN_VISIBLE - size.w;
        let max_x = (self.viewport.width - MIN_VISIBLE).max(min_x);
        let max_y = (self.viewport.height - TITLE_BAR_HEIGHT).max(0.0);
        Position {
            x: position.x.clamp(min_x, max_x),
            y: position.y.clamp(0.0, max_y),
        }
    }
}
