//! Decides which recognition results may become attendance events.

use rollcall_core::RecognitionResult;
use rollcall_store::AppConfig;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Pass,
    Unknown,
    LowConfidence { confidence: f32, required: f32 },
    CoolingDown { remaining: Duration },
}

/// Per-person cooldown plus a minimum confidence. `Unknown` never passes.
#[derive(Debug)]
pub struct AttendanceGate {
    cooldown: Duration,
    min_confidence: f32,
    last_pass: HashMap<String, Instant>,
}

impl AttendanceGate {
    pub fn new(cooldown: Duration, min_confidence: f32) -> Self {
        Self {
            cooldown,
            min_confidence,
            last_pass: HashMap::new(),
        }
    }

    pub fn from_config(config: &AppConfig, classifier_mode: bool) -> Self {
        Self::new(
            Duration::from_secs(config.attendance.cooldown_seconds),
            config.min_attendance_confidence(classifier_mode),
        )
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    /// Evaluate `result` at `now`. A pass starts that person's cooldown.
    pub fn evaluate(&mut self, result: &RecognitionResult, now: Instant) -> GateDecision {
        if !result.is_known() {
            return GateDecision::Unknown;
        }
        if result.confidence < self.min_confidence {
            return GateDecision::LowConfidence {
                confidence: result.confidence,
                required: self.min_confidence,
            };
        }
        if let Some(last) = self.last_pass.get(&result.name) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.cooldown {
                return GateDecision::CoolingDown {
                    remaining: self.cooldown - elapsed,
                };
            }
        }
        self.last_pass.insert(result.name.clone(), now);
        GateDecision::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{FaceBox, UNKNOWN_LABEL};

    fn result(name: &str, confidence: f32) -> RecognitionResult {
        RecognitionResult {
            name: name.into(),
            confidence,
            bbox: FaceBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9 },
            metadata: None,
        }
    }

    #[test]
    fn test_unknown_never_passes() {
        let mut gate = AttendanceGate::new(Duration::ZERO, 0.0);
        assert_eq!(gate.evaluate(&result(UNKNOWN_LABEL, 1.0), Instant::now()), GateDecision::Unknown);
    }

    #[test]
    fn test_min_confidence_is_inclusive() {
        let mut gate = AttendanceGate::new(Duration::ZERO, 0.7);
        let now = Instant::now();
        assert_eq!(gate.evaluate(&result("Alice", 0.7), now), GateDecision::Pass);
        assert!(matches!(
            gate.evaluate(&result("Bob", 0.41), now),
            GateDecision::LowConfidence { .. }
        ));
    }

    #[test]
    fn test_cooldown_per_person() {
        let mut gate = AttendanceGate::new(Duration::from_secs(5), 0.5);
        let t0 = Instant::now();
        assert_eq!(gate.evaluate(&result("Alice", 0.9), t0), GateDecision::Pass);
        assert_eq!(
            gate.evaluate(&result("Alice", 0.9), t0 + Duration::from_secs(3)),
            GateDecision::CoolingDown { remaining: Duration::from_secs(2) }
        );
        assert_eq!(gate.evaluate(&result("Bob", 0.9), t0 + Duration::from_secs(3)), GateDecision::Pass);
        assert_eq!(gate.evaluate(&result("Alice", 0.9), t0 + Duration::from_secs(5)), GateDecision::Pass);
    }

    #[test]
    fn test_from_config_by_mode() {
        let config = AppConfig::default();
        assert_eq!(AttendanceGate::from_config(&config, true).min_confidence(), 0.7);
        assert!((AttendanceGate::from_config(&config, false).min_confidence() - 0.4).abs() < 1e-6);
    }
}
