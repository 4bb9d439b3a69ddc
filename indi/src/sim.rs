//! Simulated peers
//!
//! In-process stand-ins for every peer role. They follow the same state
//! machine a real device does: a change is acknowledged as Busy and settles
//! into Ok or Alert on a later query. Used by tests and for dry runs without
//! hardware.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{IndiError, IndiResult};
use crate::notification::{GuiderPhase, NotificationBus, PeerNotification};
use crate::peer::{
    Camera, ExposureStatus, FocusDirection, Focuser, FrameRect, Guider, Mount, RawProperties,
    Solver, StreamingStatus, Wheel,
};
use crate::setting::{camera_properties, RawSetting, SettingKind, SwitchOption};
use crate::PropertyState;

/// Signature of a 16 bit monochrome raw frame
pub const RAW_MONO16_SIGNATURE: u32 = 0x3257_4152;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Render a 16 bit monochrome raw frame with gaussian stars.
///
/// Each star is `(x, y, sigma, peak)`; background noise is added on top of a
/// constant pedestal.
pub fn render_raw_mono16(width: u32, height: u32, stars: &[(f64, f64, f64, f64)], noise: f64) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut bytes = Vec::with_capacity(12 + (width * height * 2) as usize);
    bytes.extend_from_slice(&RAW_MONO16_SIGNATURE.to_le_bytes());
    bytes.extend_from_slice(&width.to_le_bytes());
    bytes.extend_from_slice(&height.to_le_bytes());
    for y in 0..height {
        for x in 0..width {
            let mut value = 100.0;
            if noise > 0.0 {
                value += rng.gen_range(-noise..noise);
            }
            for &(sx, sy, sigma, peak) in stars {
                let dx = x as f64 - sx;
                let dy = y as f64 - sy;
                value += peak * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            }
            let pixel = value.clamp(0.0, 65535.0) as u16;
            bytes.extend_from_slice(&pixel.to_le_bytes());
        }
    }
    bytes
}

// ============================================================================
// Raw properties
// ============================================================================

#[derive(Debug, Clone)]
struct SimProperty {
    kind: SettingKind,
    options: Vec<SwitchOption>,
    selected: Option<String>,
    number: f64,
    text: String,
    state: PropertyState,
    fail: bool,
}

impl SimProperty {
    fn new(kind: SettingKind) -> Self {
        Self {
            kind,
            options: Vec::new(),
            selected: None,
            number: 0.0,
            text: String::new(),
            state: PropertyState::Ok,
            fail: false,
        }
    }
}

// ============================================================================
// Camera
// ============================================================================

type StarModel = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct PendingExposure {
    started: Instant,
    seconds: f64,
    busy_reported: bool,
}

#[derive(Debug, Clone, Copy)]
struct PendingStream {
    started: Instant,
    count: i32,
    exposure: f64,
    busy_reported: bool,
}

struct CameraState {
    exposure_state: PropertyState,
    pending: Option<PendingExposure>,
    image: Option<Vec<u8>>,
    binning: (u32, u32),
    frame: FrameRect,
    frame_writable: bool,
    headers: HashMap<String, String>,
    streaming_state: PropertyState,
    stream: Option<PendingStream>,
    failing_exposures: u32,
    unresponsive: bool,
    garbage: bool,
    exposures: Vec<f64>,
    star: (f64, f64),
}

/// Simulated camera rendering one star whose size follows a focus model
pub struct SimCamera {
    name: String,
    time_scale: f64,
    state: Mutex<CameraState>,
    properties: Mutex<HashMap<String, SimProperty>>,
    star_model: Mutex<Option<StarModel>>,
}

impl SimCamera {
    /// `time_scale` multiplies requested exposure times, 0.001 turns seconds into milliseconds
    pub fn new(name: &str, time_scale: f64) -> Self {
        let camera = Self {
            name: name.to_string(),
            time_scale,
            state: Mutex::new(CameraState {
                exposure_state: PropertyState::Idle,
                pending: None,
                image: None,
                binning: (1, 1),
                frame: FrameRect {
                    left: 0.0,
                    top: 0.0,
                    width: 128.0,
                    height: 128.0,
                },
                frame_writable: true,
                headers: HashMap::new(),
                streaming_state: PropertyState::Idle,
                stream: None,
                failing_exposures: 0,
                unresponsive: false,
                garbage: false,
                exposures: Vec::new(),
                star: (64.0, 64.0),
            }),
            properties: Mutex::new(HashMap::new()),
            star_model: Mutex::new(None),
        };
        camera.define_switch(
            camera_properties::CCD_FRAME_TYPE,
            vec![
                SwitchOption::new("LIGHT", "Light"),
                SwitchOption::new("BIAS", "Bias"),
                SwitchOption::new("DARK", "Dark"),
                SwitchOption::new("FLAT", "Flat"),
            ],
            "LIGHT",
        );
        camera.define_switch(
            camera_properties::CCD_MODE,
            vec![
                SwitchOption::new("RAW16_1x1", "RAW 16 1x1"),
                SwitchOption::new("RAW16_2x2", "RAW 16 2x2"),
            ],
            "RAW16_1x1",
        );
        camera.define_switch(
            camera_properties::CCD_COOLER,
            vec![SwitchOption::new("ON", "On"), SwitchOption::new("OFF", "Off")],
            "OFF",
        );
        camera.define_number(camera_properties::CCD_GAIN, 0.0);
        camera.define_number(camera_properties::CCD_OFFSET, 0.0);
        camera.define_number(camera_properties::CCD_TEMPERATURE, 20.0);
        camera.define_text(camera_properties::CCD_LOCAL_MODE, "IMAGE_XXX");
        camera
    }

    pub fn define_switch(&self, property: &str, options: Vec<SwitchOption>, selected: &str) {
        let mut prop = SimProperty::new(SettingKind::Switch);
        prop.options = options;
        prop.selected = Some(selected.to_string());
        lock(&self.properties).insert(property.to_string(), prop);
    }

    pub fn define_number(&self, property: &str, value: f64) {
        let mut prop = SimProperty::new(SettingKind::Number);
        prop.number = value;
        lock(&self.properties).insert(property.to_string(), prop);
    }

    pub fn define_text(&self, property: &str, value: &str) {
        let mut prop = SimProperty::new(SettingKind::Text);
        prop.text = value.to_string();
        lock(&self.properties).insert(property.to_string(), prop);
    }

    /// Make every later change of `property` end in Alert
    pub fn fail_property(&self, property: &str) {
        if let Some(prop) = lock(&self.properties).get_mut(property) {
            prop.fail = true;
        }
    }

    pub fn number_value(&self, property: &str) -> Option<f64> {
        lock(&self.properties).get(property).map(|p| p.number)
    }

    pub fn switch_value(&self, property: &str) -> Option<String> {
        lock(&self.properties).get(property).and_then(|p| p.selected.clone())
    }

    pub fn text_value(&self, property: &str) -> Option<String> {
        lock(&self.properties).get(property).map(|p| p.text.clone())
    }

    /// Star size source, called once per rendered frame
    pub fn set_star_model(&self, model: impl Fn() -> f64 + Send + Sync + 'static) {
        *lock(&self.star_model) = Some(Arc::new(model));
    }

    pub fn set_star_position(&self, x: f64, y: f64) {
        lock(&self.state).star = (x, y);
    }

    /// The next `count` exposures end in Alert
    pub fn fail_exposures(&self, count: u32) {
        lock(&self.state).failing_exposures = count;
    }

    /// Ignore exposure requests entirely
    pub fn set_unresponsive(&self, unresponsive: bool) {
        lock(&self.state).unresponsive = unresponsive;
    }

    /// Deliver bytes without a raw header
    pub fn set_garbage(&self, garbage: bool) {
        lock(&self.state).garbage = garbage;
    }

    pub fn set_binning(&self, x: u32, y: u32) {
        lock(&self.state).binning = (x, y);
    }

    pub fn set_frame_writable(&self, writable: bool) {
        lock(&self.state).frame_writable = writable;
    }

    pub fn current_frame(&self) -> FrameRect {
        lock(&self.state).frame
    }

    /// Requested exposure times in start order
    pub fn exposures(&self) -> Vec<f64> {
        lock(&self.state).exposures.clone()
    }

    pub fn header(&self, keyword: &str) -> Option<String> {
        lock(&self.state).headers.get(keyword).cloned()
    }

    fn render(&self, state: &CameraState) -> Vec<u8> {
        if state.garbage {
            return b"SIMPLE  =                    T".to_vec();
        }
        let sigma = lock(&self.star_model)
            .as_ref()
            .map(|model| model())
            .unwrap_or(1.5);
        let width = (state.frame.width / state.binning.0 as f64).max(1.0) as u32;
        let height = (state.frame.height / state.binning.1 as f64).max(1.0) as u32;
        let x = state.star.0 - state.frame.left / state.binning.0 as f64;
        let y = state.star.1 - state.frame.top / state.binning.1 as f64;
        render_raw_mono16(width, height, &[(x, y, sigma, 20000.0)], 5.0)
    }
}

#[async_trait]
impl RawProperties for SimCamera {
    async fn switch_options(&self, property: &str) -> IndiResult<Option<Vec<SwitchOption>>> {
        Ok(lock(&self.properties)
            .get(property)
            .filter(|p| p.kind == SettingKind::Switch)
            .map(|p| p.options.clone()))
    }

    async fn has_property(&self, property: &str) -> IndiResult<bool> {
        Ok(lock(&self.properties).contains_key(property))
    }

    async fn apply(&self, setting: RawSetting) -> IndiResult<()> {
        let mut properties = lock(&self.properties);
        let prop = properties
            .get_mut(setting.property())
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: self.name.clone(),
                property: setting.property().to_string(),
            })?;
        tracing::info!("[SIM] {} apply {:?}", self.name, setting);
        match setting {
            RawSetting::NumericSet { value, .. } => prop.number = value,
            RawSetting::SwitchSet { item, .. } => prop.selected = Some(item),
            RawSetting::TextSet { value, .. } => prop.text = value,
        }
        prop.state = if prop.fail {
            PropertyState::Alert
        } else {
            PropertyState::Ok
        };
        Ok(())
    }

    async fn property_state(&self, property: &str) -> IndiResult<PropertyState> {
        lock(&self.properties)
            .get(property)
            .map(|p| p.state)
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: self.name.clone(),
                property: property.to_string(),
            })
    }
}

#[async_trait]
impl Camera for SimCamera {
    fn name(&self) -> &str {
        &self.name
    }

    async fn select_raw_format(&self) -> IndiResult<()> {
        Ok(())
    }

    async fn start_exposure(&self, seconds: f64) -> IndiResult<()> {
        let mut state = lock(&self.state);
        if state.unresponsive {
            tracing::info!("[SIM] {} ignoring exposure request", self.name);
            return Ok(());
        }
        tracing::info!("[SIM] {} exposing {:.3}s", self.name, seconds);
        state.exposures.push(seconds);
        state.exposure_state = PropertyState::Busy;
        state.pending = Some(PendingExposure {
            started: Instant::now(),
            seconds,
            busy_reported: false,
        });
        Ok(())
    }

    async fn abort_exposure(&self) -> IndiResult<()> {
        let mut state = lock(&self.state);
        if state.exposure_state == PropertyState::Busy {
            tracing::info!("[SIM] {} exposure aborted", self.name);
            state.exposure_state = PropertyState::Alert;
            state.pending = None;
        }
        Ok(())
    }

    async fn exposure_status(&self) -> IndiResult<ExposureStatus> {
        let mut state = lock(&self.state);
        let Some(mut pending) = state.pending else {
            return Ok(ExposureStatus {
                state: state.exposure_state,
                remaining: 0.0,
            });
        };
        let elapsed = pending.started.elapsed().as_secs_f64();
        let total = pending.seconds * self.time_scale;
        if pending.busy_reported && elapsed >= total {
            state.pending = None;
            if state.failing_exposures > 0 {
                state.failing_exposures -= 1;
                state.exposure_state = PropertyState::Alert;
            } else {
                let image = self.render(&state);
                state.image = Some(image);
                state.exposure_state = PropertyState::Ok;
            }
            return Ok(ExposureStatus {
                state: state.exposure_state,
                remaining: 0.0,
            });
        }
        pending.busy_reported = true;
        state.pending = Some(pending);
        let remaining = if self.time_scale > 0.0 {
            (pending.seconds - elapsed / self.time_scale).max(0.0)
        } else {
            0.0
        };
        Ok(ExposureStatus {
            state: PropertyState::Busy,
            remaining,
        })
    }

    async fn last_image(&self) -> IndiResult<Option<Vec<u8>>> {
        Ok(lock(&self.state).image.clone())
    }

    async fn is_light_frame(&self) -> IndiResult<bool> {
        Ok(self
            .switch_value(camera_properties::CCD_FRAME_TYPE)
            .map(|item| item.eq_ignore_ascii_case("LIGHT"))
            .unwrap_or(true))
    }

    async fn binning(&self) -> IndiResult<(u32, u32)> {
        Ok(lock(&self.state).binning)
    }

    async fn frame(&self) -> IndiResult<Option<FrameRect>> {
        let state = lock(&self.state);
        Ok(state.frame_writable.then_some(state.frame))
    }

    async fn set_frame(&self, rect: FrameRect) -> IndiResult<()> {
        tracing::info!("[SIM] {} frame set to {:?}", self.name, rect);
        lock(&self.state).frame = rect;
        Ok(())
    }

    async fn start_streaming(&self, count: i32, exposure: f64) -> IndiResult<()> {
        let mut state = lock(&self.state);
        if state.unresponsive {
            return Ok(());
        }
        tracing::info!("[SIM] {} streaming {} x {:.3}s", self.name, count, exposure);
        state.streaming_state = PropertyState::Busy;
        state.stream = Some(PendingStream {
            started: Instant::now(),
            count,
            exposure,
            busy_reported: false,
        });
        Ok(())
    }

    async fn streaming_status(&self) -> IndiResult<StreamingStatus> {
        let mut state = lock(&self.state);
        let Some(mut stream) = state.stream else {
            return Ok(StreamingStatus {
                state: state.streaming_state,
                remaining_frames: 0,
            });
        };
        let frame_time = stream.exposure * self.time_scale;
        let elapsed = stream.started.elapsed().as_secs_f64();
        let done = if frame_time > 0.0 {
            (elapsed / frame_time).floor() as i32
        } else {
            i32::MAX
        };
        let remaining = if stream.count < 0 {
            -1
        } else {
            (stream.count - done).max(0)
        };
        if stream.busy_reported && remaining == 0 {
            state.stream = None;
            state.streaming_state = PropertyState::Ok;
            return Ok(StreamingStatus {
                state: PropertyState::Ok,
                remaining_frames: 0,
            });
        }
        stream.busy_reported = true;
        state.stream = Some(stream);
        Ok(StreamingStatus {
            state: PropertyState::Busy,
            remaining_frames: remaining,
        })
    }

    async fn abort_streaming(&self) -> IndiResult<()> {
        let mut state = lock(&self.state);
        if state.stream.take().is_some() {
            state.streaming_state = PropertyState::Alert;
        }
        Ok(())
    }

    async fn set_header(&self, keyword: &str, value: Option<String>) -> IndiResult<()> {
        let mut state = lock(&self.state);
        match value {
            Some(value) => {
                state.headers.insert(keyword.to_string(), value);
            }
            None => {
                state.headers.remove(keyword);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Focuser
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PendingMove {
    target: f64,
    busy_reported: bool,
}

struct FocuserState {
    position: f64,
    backlash: Option<f64>,
    motion_state: PropertyState,
    pending: Option<PendingMove>,
    moves: Vec<(FocusDirection, f64)>,
    fail_moves: bool,
}

/// Simulated focuser with instantaneous, exact moves
pub struct SimFocuser {
    name: String,
    state: Mutex<FocuserState>,
    bus: Option<NotificationBus>,
}

impl SimFocuser {
    pub fn new(name: &str, position: f64) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(FocuserState {
                position,
                backlash: None,
                motion_state: PropertyState::Idle,
                pending: None,
                moves: Vec::new(),
                fail_moves: false,
            }),
            bus: None,
        }
    }

    /// Publish position changes on `bus`
    pub fn with_bus(mut self, bus: NotificationBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Give the driver its own backlash compensation
    pub fn with_driver_backlash(self, backlash: f64) -> Self {
        lock(&self.state).backlash = Some(backlash);
        self
    }

    pub fn current_position(&self) -> f64 {
        lock(&self.state).position
    }

    pub fn driver_backlash(&self) -> Option<f64> {
        lock(&self.state).backlash
    }

    /// Every move request in order, as (direction, steps)
    pub fn moves(&self) -> Vec<(FocusDirection, f64)> {
        lock(&self.state).moves.clone()
    }

    pub fn set_fail_moves(&self, fail: bool) {
        lock(&self.state).fail_moves = fail;
    }
}

#[async_trait]
impl Focuser for SimFocuser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn position(&self) -> IndiResult<f64> {
        Ok(lock(&self.state).position)
    }

    async fn backlash(&self) -> IndiResult<Option<f64>> {
        Ok(lock(&self.state).backlash)
    }

    async fn set_backlash(&self, steps: f64) -> IndiResult<()> {
        let mut state = lock(&self.state);
        match state.backlash {
            Some(_) => {
                tracing::info!("[SIM] {} backlash set to {}", self.name, steps);
                state.backlash = Some(steps);
                Ok(())
            }
            None => Err(IndiError::PropertyNotFound {
                device: self.name.clone(),
                property: "FOCUSER_BACKLASH".to_string(),
            }),
        }
    }

    async fn start_move(&self, direction: FocusDirection, steps: f64) -> IndiResult<()> {
        let mut state = lock(&self.state);
        tracing::debug!("[SIM] {} moving {:?} {} steps", self.name, direction, steps);
        state.moves.push((direction, steps));
        let target = state.position + direction.sign() * steps;
        state.motion_state = PropertyState::Busy;
        state.pending = Some(PendingMove {
            target,
            busy_reported: false,
        });
        Ok(())
    }

    async fn motion_state(&self) -> IndiResult<PropertyState> {
        let mut state = lock(&self.state);
        let Some(mut pending) = state.pending else {
            return Ok(state.motion_state);
        };
        if !pending.busy_reported {
            pending.busy_reported = true;
            state.pending = Some(pending);
            return Ok(PropertyState::Busy);
        }
        state.pending = None;
        if state.fail_moves {
            state.motion_state = PropertyState::Alert;
        } else {
            state.position = pending.target;
            state.motion_state = PropertyState::Ok;
            if let Some(bus) = &self.bus {
                bus.publish(PeerNotification::FocuserPosition(pending.target));
            }
        }
        Ok(state.motion_state)
    }

    async fn abort_motion(&self) -> IndiResult<()> {
        let mut state = lock(&self.state);
        if state.pending.take().is_some() {
            state.motion_state = PropertyState::Alert;
        }
        Ok(())
    }
}

// ============================================================================
// Filter wheel
// ============================================================================

struct WheelState {
    current: u32,
    pending: Option<(u32, bool)>,
    slot_state: PropertyState,
}

pub struct SimWheel {
    name: String,
    slots: Vec<SwitchOption>,
    state: Mutex<WheelState>,
}

impl SimWheel {
    /// Slots are named "1", "2", ... and labelled with the given filter names
    pub fn new(name: &str, filters: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            slots: filters
                .iter()
                .enumerate()
                .map(|(i, label)| SwitchOption::new((i + 1).to_string(), *label))
                .collect(),
            state: Mutex::new(WheelState {
                current: 1,
                pending: None,
                slot_state: PropertyState::Ok,
            }),
        }
    }

    pub fn active_slot(&self) -> u32 {
        lock(&self.state).current
    }
}

#[async_trait]
impl Wheel for SimWheel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn slots(&self) -> IndiResult<Vec<SwitchOption>> {
        Ok(self.slots.clone())
    }

    async fn select_slot(&self, slot: u32) -> IndiResult<()> {
        if slot == 0 || slot as usize > self.slots.len() {
            return Err(IndiError::InvalidValue {
                device: self.name.clone(),
                property: "WHEEL_SLOT".to_string(),
                value: slot.to_string(),
            });
        }
        let mut state = lock(&self.state);
        tracing::info!("[SIM] {} moving to slot {}", self.name, slot);
        state.slot_state = PropertyState::Busy;
        state.pending = Some((slot, false));
        Ok(())
    }

    async fn slot_state(&self) -> IndiResult<PropertyState> {
        let mut state = lock(&self.state);
        match state.pending {
            Some((slot, false)) => {
                state.pending = Some((slot, true));
                Ok(PropertyState::Busy)
            }
            Some((slot, true)) => {
                state.pending = None;
                state.current = slot;
                state.slot_state = PropertyState::Ok;
                Ok(PropertyState::Ok)
            }
            None => Ok(state.slot_state),
        }
    }

    async fn current_slot(&self) -> IndiResult<Option<u32>> {
        Ok(Some(lock(&self.state).current))
    }
}

// ============================================================================
// Guider
// ============================================================================

/// How the simulated guider answers a dither request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DitherBehavior {
    /// Report started, then finished after the settle time
    Settle(Duration),
    /// Report finished without ever reporting started
    FinishOnly,
    /// Report started and never settle
    NeverSettle,
    /// Do not react at all
    Ignore,
    /// Report the dither as failed
    Fail,
}

pub struct SimGuider {
    name: String,
    bus: NotificationBus,
    behavior: Mutex<DitherBehavior>,
    dithers: AtomicU32,
    guiding: AtomicBool,
    fail_guiding: AtomicBool,
}

impl SimGuider {
    pub fn new(name: &str, bus: NotificationBus) -> Self {
        Self {
            name: name.to_string(),
            bus,
            behavior: Mutex::new(DitherBehavior::Settle(Duration::from_millis(20))),
            dithers: AtomicU32::new(0),
            guiding: AtomicBool::new(false),
            fail_guiding: AtomicBool::new(false),
        }
    }

    pub fn set_dither_behavior(&self, behavior: DitherBehavior) {
        *lock(&self.behavior) = behavior;
    }

    /// Number of dither requests received
    pub fn dither_count(&self) -> u32 {
        self.dithers.load(Ordering::SeqCst)
    }

    pub fn is_guiding(&self) -> bool {
        self.guiding.load(Ordering::SeqCst)
    }

    /// Make calibration and guiding end in Alert
    pub fn set_fail_guiding(&self, fail: bool) {
        self.fail_guiding.store(fail, Ordering::SeqCst);
    }

    fn run_guiding(&self, phase: GuiderPhase) {
        let bus = self.bus.clone();
        let fail = self.fail_guiding.load(Ordering::SeqCst);
        self.guiding.store(!fail, Ordering::SeqCst);
        tokio::spawn(async move {
            bus.publish(PeerNotification::GuiderProcessState(PropertyState::Busy));
            tokio::time::sleep(Duration::from_millis(5)).await;
            if fail {
                bus.publish(PeerNotification::GuiderStats {
                    phase: GuiderPhase::Failed,
                    frame: 0,
                    dithering_rms: 0.0,
                });
                bus.publish(PeerNotification::GuiderProcessState(PropertyState::Alert));
                return;
            }
            for frame in 0..8 {
                let phase = if frame < 2 { phase } else { GuiderPhase::Guiding };
                bus.publish(PeerNotification::GuiderStats {
                    phase,
                    frame,
                    dithering_rms: 0.0,
                });
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
    }
}

#[async_trait]
impl Guider for SimGuider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn trigger_dither(&self) -> IndiResult<()> {
        self.dithers.fetch_add(1, Ordering::SeqCst);
        let behavior = *lock(&self.behavior);
        tracing::info!("[SIM] {} dither requested ({:?})", self.name, behavior);
        let bus = self.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let busy = PeerNotification::DitherState {
                state: PropertyState::Busy,
                triggered: true,
            };
            let done = PeerNotification::DitherState {
                state: PropertyState::Ok,
                triggered: false,
            };
            match behavior {
                DitherBehavior::Settle(settle) => {
                    bus.publish(busy);
                    tokio::time::sleep(settle).await;
                    bus.publish(PeerNotification::GuiderStats {
                        phase: GuiderPhase::Guiding,
                        frame: 10,
                        dithering_rms: rand::thread_rng().gen_range(0.05..0.3),
                    });
                    bus.publish(done);
                }
                DitherBehavior::FinishOnly => bus.publish(done),
                DitherBehavior::NeverSettle => bus.publish(busy),
                DitherBehavior::Ignore => {}
                DitherBehavior::Fail => bus.publish(PeerNotification::DitherState {
                    state: PropertyState::Alert,
                    triggered: false,
                }),
            }
        });
        Ok(())
    }

    async fn calibrate(&self, exposure: f64) -> IndiResult<()> {
        tracing::info!("[SIM] {} calibrating with {:.1}s exposures", self.name, exposure);
        self.run_guiding(GuiderPhase::Calibrating);
        Ok(())
    }

    async fn start_guiding(&self, exposure: f64) -> IndiResult<()> {
        tracing::info!("[SIM] {} guiding with {:.1}s exposures", self.name, exposure);
        self.run_guiding(GuiderPhase::Guiding);
        Ok(())
    }

    async fn stop(&self) -> IndiResult<()> {
        tracing::info!("[SIM] {} stopped", self.name);
        self.guiding.store(false, Ordering::SeqCst);
        self.bus.publish(PeerNotification::GuiderStats {
            phase: GuiderPhase::Idle,
            frame: 0,
            dithering_rms: 0.0,
        });
        self.bus
            .publish(PeerNotification::GuiderProcessState(PropertyState::Ok));
        Ok(())
    }
}

// ============================================================================
// Mount and solver
// ============================================================================

pub struct SimMount {
    name: String,
    parked: AtomicBool,
    abort_allowed: AtomicBool,
    commands: Mutex<Vec<String>>,
}

impl SimMount {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parked: AtomicBool::new(false),
            abort_allowed: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn imager_abort_allowed(&self) -> bool {
        self.abort_allowed.load(Ordering::SeqCst)
    }

    /// Commands received, in order
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

#[async_trait]
impl Mount for SimMount {
    fn name(&self) -> &str {
        &self.name
    }

    async fn park(&self) -> IndiResult<()> {
        self.parked.store(true, Ordering::SeqCst);
        lock(&self.commands).push("park".to_string());
        Ok(())
    }

    async fn unpark(&self) -> IndiResult<()> {
        self.parked.store(false, Ordering::SeqCst);
        lock(&self.commands).push("unpark".to_string());
        Ok(())
    }

    async fn allow_imager_abort(&self, allowed: bool) -> IndiResult<()> {
        self.abort_allowed.store(allowed, Ordering::SeqCst);
        Ok(())
    }
}

pub struct SimSolver {
    name: String,
    bus: NotificationBus,
    solve_time: Duration,
    fail: AtomicBool,
    last_target: Mutex<Option<(f64, f64)>>,
}

impl SimSolver {
    pub fn new(name: &str, bus: NotificationBus) -> Self {
        Self {
            name: name.to_string(),
            bus,
            solve_time: Duration::from_millis(10),
            fail: AtomicBool::new(false),
            last_target: Mutex::new(None),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn last_target(&self) -> Option<(f64, f64)> {
        *lock(&self.last_target)
    }
}

#[async_trait]
impl Solver for SimSolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn precise_goto(&self, ra: f64, dec: f64) -> IndiResult<()> {
        tracing::info!("[SIM] {} precise goto {:.4} {:.4}", self.name, ra, dec);
        *lock(&self.last_target) = Some((ra, dec));
        let bus = self.bus.clone();
        let solve_time = self.solve_time;
        let fail = self.fail.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            bus.publish(PeerNotification::SolverProcessState(PropertyState::Busy));
            tokio::time::sleep(solve_time).await;
            let state = if fail {
                PropertyState::Alert
            } else {
                PropertyState::Ok
            };
            bus.publish(PeerNotification::SolverProcessState(state));
        });
        Ok(())
    }

    async fn abort(&self) -> IndiResult<()> {
        self.bus
            .publish(PeerNotification::SolverProcessState(PropertyState::Alert));
        Ok(())
    }

    async fn disable(&self) -> IndiResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_camera_reports_busy_before_ok() {
        let camera = SimCamera::new("CCD Simulator", 0.0);
        camera.start_exposure(1.0).await.unwrap();
        assert_eq!(camera.exposure_status().await.unwrap().state, PropertyState::Busy);
        assert_eq!(camera.exposure_status().await.unwrap().state, PropertyState::Ok);
        let image = camera.last_image().await.unwrap().unwrap();
        assert_eq!(&image[0..4], &RAW_MONO16_SIGNATURE.to_le_bytes());
        assert_eq!(camera.exposures(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_camera_failing_exposure() {
        let camera = SimCamera::new("CCD Simulator", 0.0);
        camera.fail_exposures(1);
        camera.start_exposure(1.0).await.unwrap();
        camera.exposure_status().await.unwrap();
        assert_eq!(camera.exposure_status().await.unwrap().state, PropertyState::Alert);
        assert!(camera.last_image().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_camera_raw_properties() {
        let camera = SimCamera::new("CCD Simulator", 0.0);
        camera
            .apply(RawSetting::NumericSet {
                property: camera_properties::CCD_GAIN.to_string(),
                item: "GAIN".to_string(),
                value: 120.0,
            })
            .await
            .unwrap();
        assert_eq!(camera.number_value(camera_properties::CCD_GAIN), Some(120.0));
        assert!(camera
            .apply(RawSetting::SwitchSet {
                property: "DSLR_ISO".to_string(),
                item: "800".to_string(),
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_focuser_moves() {
        let focuser = SimFocuser::new("Focuser Simulator", 1000.0);
        focuser.start_move(FocusDirection::Outward, 50.0).await.unwrap();
        assert_eq!(focuser.motion_state().await.unwrap(), PropertyState::Busy);
        assert_eq!(focuser.motion_state().await.unwrap(), PropertyState::Ok);
        assert_eq!(focuser.position().await.unwrap(), 1050.0);
        focuser.start_move(FocusDirection::Inward, 75.0).await.unwrap();
        focuser.motion_state().await.unwrap();
        focuser.motion_state().await.unwrap();
        assert_eq!(focuser.current_position(), 975.0);
        assert!(focuser.set_backlash(10.0).await.is_err());
    }

    #[tokio::test]
    async fn test_guider_dither_notifications() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();
        let guider = SimGuider::new("Guider Agent", bus.clone());
        guider.set_dither_behavior(DitherBehavior::Settle(Duration::from_millis(1)));
        guider.trigger_dither().await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            PeerNotification::DitherState {
                state: PropertyState::Busy,
                triggered: true
            }
        );
        assert_eq!(guider.dither_count(), 1);
    }

    #[test]
    fn test_render_places_star() {
        let frame = render_raw_mono16(16, 16, &[(8.0, 8.0, 1.0, 10000.0)], 0.0);
        assert_eq!(frame.len(), 12 + 16 * 16 * 2);
        let pixel = |x: usize, y: usize| {
            let offset = 12 + (y * 16 + x) * 2;
            u16::from_le_bytes([frame[offset], frame[offset + 1]])
        };
        assert!(pixel(8, 8) > pixel(0, 0));
        assert_eq!(pixel(0, 0), 100);
    }
}
