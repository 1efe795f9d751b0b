//! LED pattern engine.
//!
//! Each configured LED carries its own render state and emits a pin write
//! only on a transition edge, so the 100 ms run loop can call into the
//! engine every tick without flooding the GPIO layer. Rendering never
//! fails; disabled entries are skipped.

use serde::{Deserialize, Serialize};

use crate::config::LedConfig;
use crate::types::{DeviceState, Presence};

pub const SLOW_BLINK_INTERVAL_MS: u64 = 1_000;
pub const MEDIUM_BLINK_INTERVAL_MS: u64 = 500;
pub const FAST_BLINK_INTERVAL_MS: u64 = 200;
pub const VERY_FAST_BLINK_INTERVAL_MS: u64 = 100;
pub const DOUBLE_BLINK_CYCLE_MS: u64 = 1_000;
pub const DOUBLE_BLINK_PULSE_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    Off,
    Solid,
    SlowBlink,
    MediumBlink,
    FastBlink,
    DoubleBlink,
    DimSolid,
}

impl Pattern {
    /// Integer codes as persisted by the original firmware's preferences.
    pub fn code(self) -> u8 {
        match self {
            Pattern::Off => 0,
            Pattern::Solid => 1,
            Pattern::SlowBlink => 2,
            Pattern::MediumBlink => 3,
            Pattern::FastBlink => 4,
            Pattern::DoubleBlink => 5,
            Pattern::DimSolid => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Pattern::Off,
            1 => Pattern::Solid,
            2 => Pattern::SlowBlink,
            3 => Pattern::MediumBlink,
            4 => Pattern::FastBlink,
            5 => Pattern::DoubleBlink,
            6 => Pattern::DimSolid,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Pattern::Off => "off",
            Pattern::Solid => "solid",
            Pattern::SlowBlink => "slow_blink",
            Pattern::MediumBlink => "medium_blink",
            Pattern::FastBlink => "fast_blink",
            Pattern::DoubleBlink => "double_blink",
            Pattern::DimSolid => "dim_solid",
        }
    }

    fn blink_interval_ms(self) -> Option<u64> {
        match self {
            Pattern::SlowBlink => Some(SLOW_BLINK_INTERVAL_MS),
            Pattern::MediumBlink => Some(MEDIUM_BLINK_INTERVAL_MS),
            Pattern::FastBlink => Some(FAST_BLINK_INTERVAL_MS),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedLevel {
    Off,
    On,
    /// Reduced brightness; the GPIO driver degrades this to `On` when the
    /// pin has no PWM channel.
    Dim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedWrite {
    pub pin: i32,
    pub level: LedLevel,
}

#[derive(Debug, Clone, Default)]
struct DoubleBlinkState {
    /// None means idle; the next render starts a fresh cycle.
    cycle_start_ms: Option<u64>,
    transitions: u8,
}

#[derive(Debug, Clone, Default)]
struct RenderState {
    last_pattern: Option<Pattern>,
    last_toggle_ms: u64,
    lit: bool,
    double: DoubleBlinkState,
    last_level: Option<LedLevel>,
}

/// One configured LED plus the render state the engine owns for it.
#[derive(Debug, Clone)]
pub struct LedChannel {
    pub config: LedConfig,
    render: RenderState,
}

impl LedChannel {
    pub fn new(config: LedConfig) -> Self {
        Self {
            config,
            render: RenderState::default(),
        }
    }

    /// Advance this LED under `pattern` and return the pin write to apply,
    /// if any. Calling again without time advancing emits nothing.
    pub fn render(&mut self, pattern: Pattern, now_ms: u64) -> Option<LedWrite> {
        if !self.config.enabled {
            return None;
        }

        if self.render.last_pattern != Some(pattern) {
            // Render state is owned here and resets on every reassignment.
            self.render = RenderState {
                last_pattern: Some(pattern),
                last_toggle_ms: now_ms,
                lit: true,
                double: DoubleBlinkState::default(),
                last_level: self.render.last_level,
            };
        }

        let level = match pattern {
            Pattern::Off => LedLevel::Off,
            Pattern::Solid => LedLevel::On,
            Pattern::DimSolid => LedLevel::Dim,
            Pattern::SlowBlink | Pattern::MediumBlink | Pattern::FastBlink => {
                let interval = pattern.blink_interval_ms().unwrap_or(SLOW_BLINK_INTERVAL_MS);
                if now_ms.saturating_sub(self.render.last_toggle_ms) >= interval {
                    self.render.lit = !self.render.lit;
                    self.render.last_toggle_ms = now_ms;
                }
                if self.render.lit {
                    LedLevel::On
                } else {
                    LedLevel::Off
                }
            }
            Pattern::DoubleBlink => self.render_double_blink(now_ms),
        };

        self.emit(level)
    }

    /// Two 100 ms pulses at cycle offsets 0 and 200, dark for the remainder
    /// of the 1 s cycle. Edges land at offsets 0, 100, 200 and 300.
    fn render_double_blink(&mut self, now_ms: u64) -> LedLevel {
        let double = &mut self.render.double;
        match double.cycle_start_ms {
            None => {
                double.cycle_start_ms = Some(now_ms);
                double.transitions = 0;
            }
            Some(start) => {
                let elapsed = now_ms.saturating_sub(start);
                if double.transitions < 4 {
                    let boundary = (u64::from(double.transitions) + 1) * DOUBLE_BLINK_PULSE_MS;
                    if elapsed >= boundary {
                        double.transitions += 1;
                    }
                } else if elapsed >= DOUBLE_BLINK_CYCLE_MS {
                    double.cycle_start_ms = Some(now_ms);
                    double.transitions = 0;
                }
            }
        }

        // on-off-on-off across the first four pulse slots, then the pause.
        if matches!(double.transitions, 0 | 2) {
            LedLevel::On
        } else {
            LedLevel::Off
        }
    }

    /// Drive this LED to a fixed level outside of pattern rendering (system
    /// state override). Resets pattern tracking so the next presence render
    /// starts from a clean state.
    fn force_level(&mut self, level: LedLevel) -> Option<LedWrite> {
        if !self.config.enabled {
            return None;
        }
        self.render.last_pattern = None;
        self.render.double = DoubleBlinkState::default();
        self.emit(level)
    }

    fn emit(&mut self, level: LedLevel) -> Option<LedWrite> {
        if self.render.last_level == Some(level) {
            return None;
        }
        self.render.last_level = Some(level);
        Some(LedWrite {
            pin: self.config.pin,
            level,
        })
    }
}

/// Blink interval applied uniformly to every LED while the device is not in
/// a presence-bearing state.
fn system_override_interval(state: DeviceState) -> Option<u64> {
    match state {
        DeviceState::ApMode => Some(VERY_FAST_BLINK_INTERVAL_MS),
        DeviceState::ConnectingWifi => Some(SLOW_BLINK_INTERVAL_MS),
        DeviceState::ConnectingOauth | DeviceState::DeviceCodePending => {
            Some(FAST_BLINK_INTERVAL_MS)
        }
        DeviceState::Error => Some(FAST_BLINK_INTERVAL_MS),
        DeviceState::Authenticated | DeviceState::Monitoring => None,
    }
}

/// Pattern an LED should show for the current presence. Activity-derived
/// meeting detection wins over plain busy.
pub fn pattern_for_presence(config: &LedConfig, presence: Presence) -> Pattern {
    match presence {
        Presence::InMeeting => config.meeting_pattern,
        Presence::Busy => config.busy_pattern,
        _ => config.idle_pattern,
    }
}

/// Render every enabled LED for one tick and collect the resulting writes.
pub fn render_all(
    channels: &mut [LedChannel],
    state: DeviceState,
    presence: Presence,
    now_ms: u64,
) -> Vec<LedWrite> {
    let mut writes = Vec::new();

    if let Some(interval) = system_override_interval(state) {
        // Phase derived from the shared clock keeps every LED in lockstep.
        let lit = (now_ms / interval) % 2 == 0;
        let level = if lit { LedLevel::On } else { LedLevel::Off };
        for channel in channels.iter_mut() {
            if let Some(write) = channel.force_level(level) {
                writes.push(write);
            }
        }
        return writes;
    }

    for channel in channels.iter_mut() {
        let pattern = pattern_for_presence(&channel.config, presence);
        if let Some(write) = channel.render(pattern, now_ms) {
            writes.push(write);
        }
    }
    writes
}
