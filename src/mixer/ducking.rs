//! Priority-based ducking of background sources.
//!
//! The engine tracks a reference count of active non-exempt event sources
//! and a duck level the pull loop multiplies into every non-exempt
//! background row. Ramps are re-armed strictly on the 0<->1 edges of the
//! count, so nested events never restart an attack.
//!
//! All values read on the pull-loop side live in atomics; the loop calls
//! [`DuckingEngine::advance`] once per tick to move the level toward its
//! target.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::audio::BUS_SAMPLE_RATE;
use crate::config::DuckPolicy;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::source::AudioSource;

/// Observable ducking state.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct DuckingState {
    pub is_ducking: bool,
    pub current_duck_level: f32,
    pub active_event_count: u32,
}

/// Ducking ramp configuration.
#[derive(Debug, Clone, Copy)]
pub struct DuckConfig {
    /// Attenuation while ducked: level target is `percentage / 100`
    pub percentage: u8,
    pub attack_ms: u32,
    pub release_ms: u32,
    pub policy: DuckPolicy,
}

impl Default for DuckConfig {
    fn default() -> Self {
        Self {
            percentage: 20,
            attack_ms: 200,
            release_ms: 500,
            policy: DuckPolicy::FadeSmooth,
        }
    }
}

pub struct DuckingEngine {
    config: Mutex<DuckConfig>,
    /// Current level, f32 bits
    level_bits: AtomicU32,
    /// Ramp target, f32 bits
    target_bits: AtomicU32,
    /// Per-frame ramp step magnitude, f32 bits
    step_bits: AtomicU32,
    /// Active non-exempt events
    active_events: AtomicU32,
}

impl DuckingEngine {
    pub fn new(config: DuckConfig) -> Self {
        Self {
            config: Mutex::new(config),
            level_bits: AtomicU32::new(1.0_f32.to_bits()),
            target_bits: AtomicU32::new(1.0_f32.to_bits()),
            step_bits: AtomicU32::new(0.0_f32.to_bits()),
            active_events: AtomicU32::new(0),
        }
    }

    /// The multiplier applied to non-exempt background rows.
    #[inline]
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    pub fn active_event_count(&self) -> u32 {
        self.active_events.load(Ordering::Relaxed)
    }

    pub fn is_ducking(&self) -> bool {
        self.active_event_count() > 0
    }

    pub fn state(&self) -> DuckingState {
        DuckingState {
            is_ducking: self.is_ducking(),
            current_duck_level: self.level(),
            active_event_count: self.active_event_count(),
        }
    }

    pub fn config(&self) -> DuckConfig {
        *self.config.lock()
    }

    /// Replace the configuration. Takes effect on the next edge.
    pub fn set_config(&self, config: DuckConfig) {
        *self.config.lock() = config;
    }

    /// A non-exempt event became active. Arms the attack ramp on the
    /// 0 -> 1 edge only.
    pub fn event_started(&self) {
        let previous = self.active_events.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            let config = self.config();
            let target = f32::from(config.percentage) / 100.0;
            self.arm_ramp(target, config.attack_ms, config.policy);
        }
    }

    /// A non-exempt event finished. Arms the release ramp on the 1 -> 0
    /// edge only.
    pub fn event_ended(&self) {
        let previous = self.active_events.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "event_ended without matching event_started");
        if previous == 1 {
            let config = self.config();
            self.arm_ramp(1.0, config.release_ms, config.policy);
        }
    }

    fn arm_ramp(&self, target: f32, window_ms: u32, policy: DuckPolicy) {
        let effective_ms = match policy {
            DuckPolicy::FadeSmooth => window_ms,
            DuckPolicy::FadeQuick => window_ms / 4,
            DuckPolicy::Instant => 0,
        };

        self.target_bits.store(target.to_bits(), Ordering::Relaxed);
        if effective_ms == 0 {
            self.step_bits.store(0.0_f32.to_bits(), Ordering::Relaxed);
            self.level_bits.store(target.to_bits(), Ordering::Relaxed);
            return;
        }

        let frames = effective_ms as f32 * BUS_SAMPLE_RATE as f32 / 1000.0;
        let distance = (self.level() - target).abs();
        let step = if frames > 0.0 { distance / frames } else { distance };
        self.step_bits.store(step.to_bits(), Ordering::Relaxed);
    }

    /// Move the level toward its target by `frames` worth of ramp.
    /// Called from the pull loop; lock-free. Returns true while ramping.
    pub fn advance(&self, frames: usize) -> bool {
        let level = self.level();
        let target = f32::from_bits(self.target_bits.load(Ordering::Relaxed));
        if level == target {
            return false;
        }
        let step = f32::from_bits(self.step_bits.load(Ordering::Relaxed)) * frames as f32;
        let next = if level > target {
            (level - step).max(target)
        } else {
            (level + step).min(target)
        };
        self.level_bits.store(next.to_bits(), Ordering::Relaxed);
        next != target
    }
}

impl Default for DuckingEngine {
    fn default() -> Self {
        Self::new(DuckConfig::default())
    }
}

struct ActiveEvent {
    id: String,
    priority: u8,
    duck_exempt: bool,
    source: Arc<dyn AudioSource>,
    paused_by_override: bool,
}

/// Tracks active event sources, drives the engine's edges and applies the
/// priority-override rule: a strictly higher-priority event pauses lower
/// ones (position preserved) until it completes.
pub struct EventCoordinator {
    engine: Arc<DuckingEngine>,
    bus: Arc<EventBus>,
    active: Mutex<Vec<ActiveEvent>>,
}

impl EventCoordinator {
    pub fn new(engine: Arc<DuckingEngine>, bus: Arc<EventBus>) -> Self {
        Self {
            engine,
            bus,
            active: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Arc<DuckingEngine> {
        &self.engine
    }

    /// Register a newly playing event source.
    pub fn event_started(
        &self,
        source: Arc<dyn AudioSource>,
        priority: u8,
        duck_exempt: bool,
    ) -> Result<()> {
        let mut active = self.active.lock();

        // Exempt events still participate in priority override
        for existing in active.iter_mut() {
            if !existing.paused_by_override && existing.priority < priority {
                if let Err(e) = existing.source.pause() {
                    tracing::warn!(event = %existing.id, "priority override pause failed: {e}");
                } else {
                    existing.paused_by_override = true;
                }
            }
        }

        if !duck_exempt {
            self.engine.event_started();
        }
        active.push(ActiveEvent {
            id: source.id().to_string(),
            priority,
            duck_exempt,
            source,
        paused_by_override: false,
        });
        drop(active);

        self.bus.publish(EngineEvent::DuckingChanged(self.engine.state()));
        Ok(())
    }

    /// Deregister a finished event source and resume anything it had
    /// overridden.
    pub fn event_finished(&self, id: &str) {
        let mut active = self.active.lock();
        let Some(pos) = active.iter().position(|e| e.id == id) else {
            return;
        };
        let finished = active.remove(pos);
        if !finished.duck_exempt {
            self.engine.event_ended();
        }

        // Resume events no longer outranked by anything still playing
        let playing_max = active
            .iter()
            .filter(|e| !e.paused_by_override)
            .map(|e| e.priority)
            .max();
        for event in active.iter_mut() {
            if event.paused_by_override
                && playing_max.is_none_or(|max| event.priority >= max)
            {
                if let Err(e) = event.source.resume() {
                    tracing::warn!(event = %event.id, "priority override resume failed: {e}");
                }
                event.paused_by_override = false;
            }
        }
        drop(active);

        self.bus.publish(EngineEvent::DuckingChanged(self.engine.state()));
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAMES_PER_TICK;

    fn ticks_for_ms(ms: u32) -> usize {
        (ms as usize * BUS_SAMPLE_RATE as usize / 1000).div_ceil(FRAMES_PER_TICK)
    }

    fn engine(percentage: u8, attack_ms: u32, release_ms: u32, policy: DuckPolicy) -> DuckingEngine {
        DuckingEngine::new(DuckConfig {
            percentage,
            attack_ms,
            release_ms,
            policy,
        })
    }

    #[test]
    fn test_attack_ramp_reaches_target() {
        let e = engine(20, 200, 500, DuckPolicy::FadeSmooth);
        assert_eq!(e.level(), 1.0);

        e.event_started();
        // Halfway through the attack the level is between target and 1.0
        for _ in 0..ticks_for_ms(100) {
            e.advance(FRAMES_PER_TICK);
        }
        let mid = e.level();
        assert!(mid > 0.2 && mid < 1.0, "mid-ramp level {mid}");

        for _ in 0..ticks_for_ms(200) {
            e.advance(FRAMES_PER_TICK);
        }
        assert!((e.level() - 0.2).abs() < 0.02, "settled level {}", e.level());
    }

    #[test]
    fn test_release_ramp_returns_to_unity() {
        let e = engine(20, 200, 500, DuckPolicy::FadeSmooth);
        e.event_started();
        for _ in 0..ticks_for_ms(300) {
            e.advance(FRAMES_PER_TICK);
        }
        e.event_ended();
        for _ in 0..ticks_for_ms(600) {
            e.advance(FRAMES_PER_TICK);
        }
        assert!((e.level() - 1.0).abs() < 0.02);
        assert!(!e.is_ducking());
    }

    #[test]
    fn test_instant_policy_jumps() {
        let e = engine(40, 200, 500, DuckPolicy::Instant);
        e.event_started();
        assert_eq!(e.level(), 0.4);
        e.event_ended();
        assert_eq!(e.level(), 1.0);
    }

    #[test]
    fn test_nested_events_do_not_rearm() {
        let e = engine(20, 200, 500, DuckPolicy::FadeSmooth);
        e.event_started();
        for _ in 0..ticks_for_ms(250) {
            e.advance(FRAMES_PER_TICK);
        }
        let settled = e.level();
        assert!((settled - 0.2).abs() < 0.02);

        // Second event while already ducked: level must not move
        e.event_started();
        e.advance(FRAMES_PER_TICK);
        assert_eq!(e.level(), settled);
        assert_eq!(e.active_event_count(), 2);

        // First ends: still one active, no release yet
        e.event_ended();
        for _ in 0..ticks_for_ms(100) {
            e.advance(FRAMES_PER_TICK);
        }
        assert_eq!(e.level(), settled);
        assert!(e.is_ducking());

        // Final 1 -> 0 edge releases
        e.event_ended();
        for _ in 0..ticks_for_ms(600) {
            e.advance(FRAMES_PER_TICK);
        }
        assert!((e.level() - 1.0).abs() < 0.02);
    }

    #[test]
    fn test_level_monotonic_between_edges() {
        let e = engine(30, 150, 400, DuckPolicy::FadeSmooth);
        e.event_started();
        let mut previous = e.level();
        for _ in 0..ticks_for_ms(200) {
            e.advance(FRAMES_PER_TICK);
            let level = e.level();
            assert!(level <= previous + 1e-6, "attack must be non-increasing");
            assert!((0.3..=1.0).contains(&level));
            previous = level;
        }
        e.event_ended();
        for _ in 0..ticks_for_ms(500) {
            e.advance(FRAMES_PER_TICK);
            let level = e.level();
            assert!(level >= previous - 1e-6, "release must be non-decreasing");
            previous = level;
        }
    }
}
