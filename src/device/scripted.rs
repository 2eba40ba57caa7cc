use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{Device, DeviceError};
use crate::snapshot::{Bounds, DeviceSnapshot, Point, Resolution, UiElement};

/// Input recorded by [`ScriptedDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Tap(Point),
    Type(String),
    Swipe { from: Point, to: Point },
    Back,
}

struct TapRule {
    on: String,
    area: Bounds,
    goto: String,
}

struct ScriptState {
    screens: HashMap<String, Vec<UiElement>>,
    current: String,
    taps: Vec<TapRule>,
    backs: HashMap<String, String>,
    events: Vec<DeviceEvent>,
}

/// In-memory device driven by a small screen graph: named screens, and
/// taps or back presses that move between them. Typing replaces the text
/// of the focused editable field. Used for dry runs and tests.
pub struct ScriptedDevice {
    resolution: Resolution,
    state: Mutex<ScriptState>,
    unreachable: AtomicBool,
}

impl ScriptedDevice {
    pub fn new(resolution: Resolution, start: &str, elements: Vec<UiElement>) -> Self {
        let mut screens = HashMap::new();
        screens.insert(start.to_string(), elements);
        Self {
            resolution,
            state: Mutex::new(ScriptState {
                screens,
                current: start.to_string(),
                taps: Vec::new(),
                backs: HashMap::new(),
                events: Vec::new(),
            }),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn with_screen(self, name: &str, elements: Vec<UiElement>) -> Self {
        self.lock().screens.insert(name.to_string(), elements);
        self
    }

    /// A tap inside `area` while on `on` switches to `goto`.
    pub fn with_tap(self, on: &str, area: Bounds, goto: &str) -> Self {
        self.lock().taps.push(TapRule {
            on: on.to_string(),
            area,
            goto: goto.to_string(),
        });
        self
    }

    pub fn with_back(self, on: &str, goto: &str) -> Self {
        self.lock().backs.insert(on.to_string(), goto.to_string());
        self
    }

    pub fn current_screen(&self) -> String {
        self.lock().current.clone()
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.lock().events.clone()
    }

    pub fn input_count(&self) -> usize {
        self.lock().events.len()
    }

    /// Simulate a lost transport: every call fails with `Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), DeviceError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DeviceError::Unreachable("scripted device disconnected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Device for ScriptedDevice {
    async fn snapshot(&self) -> Result<DeviceSnapshot, DeviceError> {
        self.check_reachable()?;
        let state = self.lock();
        let elements = state
            .screens
            .get(&state.current)
            .cloned()
            .ok_or_else(|| DeviceError::Hierarchy(format!("unknown screen {:?}", state.current)))?;
        Ok(DeviceSnapshot::new(self.resolution, elements))
    }

    async fn resolution(&self) -> Result<Resolution, DeviceError> {
        self.check_reachable()?;
        Ok(self.resolution)
    }

    async fn tap(&self, at: Point) -> Result<(), DeviceError> {
        self.check_reachable()?;
        let mut state = self.lock();
        state.events.push(DeviceEvent::Tap(at));
        let next = state
            .taps
            .iter()
            .find(|r| r.on == state.current && r.area.contains(at))
            .map(|r| r.goto.clone());
        if let Some(next) = next {
            state.current = next;
        }
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), DeviceError> {
        self.check_reachable()?;
        let mut state = self.lock();
        state.events.push(DeviceEvent::Type(text.to_string()));
        let current = state.current.clone();
        let field = state
            .screens
            .get_mut(&current)
            .and_then(|els| els.iter_mut().find(|e| e.is_editable() && e.focused))
            .ok_or_else(|| DeviceError::NotFound("no focused text field".into()))?;
        field.text = text.to_string();
        Ok(())
    }

    async fn swipe(&self, from: Point, to: Point, _duration: Duration) -> Result<(), DeviceError> {
        self.check_reachable()?;
        self.lock().events.push(DeviceEvent::Swipe { from, to });
        Ok(())
    }

    async fn press_back(&self) -> Result<(), DeviceError> {
        self.check_reachable()?;
        let mut state = self.lock();
        state.events.push(DeviceEvent::Back);
        if let Some(prev) = state.backs.get(&state.current).cloned() {
            state.current = prev;
        }
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DeviceError> {
        self.check_reachable()?;
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend_from_slice(self.lock().current.as_bytes());
        Ok(png)
    }
}
