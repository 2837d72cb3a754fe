//! One-shot detection alerts.
//!
//! The policy is a monotonic latch. It fires on the first detection that
//! matches the trigger and stays fired for the rest of the session. It does
//! not re-arm when the object leaves the scene. The only way back is a new
//! session, which starts with a fresh `AlertState`.

use std::io::Write;

use crate::detect::Detection;

/// Class/confidence pair that raises an alert.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertTrigger {
    pub class_label: String,
    pub min_confidence: f32,
}

impl AlertTrigger {
    pub fn new(class_label: impl Into<String>, min_confidence: f32) -> Self {
        Self {
            class_label: class_label.into(),
            min_confidence,
        }
    }

    pub fn matches(&self, detection: &Detection) -> bool {
        detection.class_label == self.class_label && detection.confidence >= self.min_confidence
    }
}

/// Session-scoped latch. It cannot be cleared; a new session starts fresh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AlertState {
    fired: bool,
}

impl AlertState {
    pub fn fired(&self) -> bool {
        self.fired
    }
}

/// Pure policy step: `(fire, new_state)`.
///
/// Fires only when `state` has not fired yet and some detection matches.
pub fn evaluate(
    detections: &[Detection],
    state: AlertState,
    trigger: &AlertTrigger,
) -> (bool, AlertState) {
    if state.fired {
        return (false, state);
    }
    if detections.iter().any(|d| trigger.matches(d)) {
        (true, AlertState { fired: true })
    } else {
        (false, state)
    }
}

/// Side effect run when an alert fires.
pub trait AlertSink: Send {
    fn raise(&mut self, detection: &Detection);
}

/// Logs the alert and optionally rings the terminal bell.
#[derive(Clone, Debug, Default)]
pub struct LogAlertSink {
    bell: bool,
}

impl LogAlertSink {
    pub fn new(bell: bool) -> Self {
        Self { bell }
    }
}

impl AlertSink for LogAlertSink {
    fn raise(&mut self, detection: &Detection) {
        log::warn!(
            "{} detected! ({:.0}% at {:.0},{:.0})",
            detection.class_label,
            detection.confidence * 100.0,
            detection.bbox.x,
            detection.bbox.y
        );
        if self.bell {
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(b"\x07");
            let _ = stderr.flush();
        }
    }
}

/// Optional trigger plus the session's latch.
#[derive(Clone, Debug, Default)]
pub struct AlertPolicy {
    trigger: Option<AlertTrigger>,
    state: AlertState,
}

impl AlertPolicy {
    pub fn new(trigger: Option<AlertTrigger>) -> Self {
        Self {
            trigger,
            state: AlertState::default(),
        }
    }

    pub fn state(&self) -> AlertState {
        self.state
    }

    /// Advance the latch. Returns the detection that fired it, if any.
    pub fn check<'a>(&mut self, detections: &'a [Detection]) -> Option<&'a Detection> {
        let trigger = self.trigger.as_ref()?;
        let (fire, state) = evaluate(detections, self.state, trigger);
        self.state = state;
        if fire {
            detections.iter().find(|d| trigger.matches(d))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn detection(label: &str, confidence: f32) -> Detection {
        Detection::new(label, confidence, BoundingBox::new(1.0, 2.0, 3.0, 4.0))
    }

    fn phone_trigger() -> AlertTrigger {
        AlertTrigger::new("cell phone", 0.85)
    }

    #[test]
    fn matching_detection_fires_once() {
        let detections = vec![detection("cell phone", 0.9)];
        let (fire, state) = evaluate(&detections, AlertState::default(), &phone_trigger());
        assert!(fire);
        assert!(state.fired());

        let (fire, state) = evaluate(&detections, state, &phone_trigger());
        assert!(!fire);
        assert!(state.fired());
    }

    #[test]
    fn below_threshold_never_fires() {
        for confidence in [0.0, 0.5, 0.84, 0.8499] {
            let detections = vec![detection("cell phone", confidence)];
            let (fire, state) = evaluate(&detections, AlertState::default(), &phone_trigger());
            assert!(!fire, "fired at {}", confidence);
            assert!(!state.fired());
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let detections = vec![detection("cell phone", 0.85)];
        assert!(evaluate(&detections, AlertState::default(), &phone_trigger()).0);
    }

    #[test]
    fn other_classes_do_not_fire() {
        let detections = vec![detection("cup", 0.99), detection("Cell Phone", 0.99)];
        assert!(!evaluate(&detections, AlertState::default(), &phone_trigger()).0);
    }

    #[test]
    fn fired_state_is_idempotent_for_any_input() {
        let fired = evaluate(
            &[detection("cell phone", 1.0)],
            AlertState::default(),
            &phone_trigger(),
        )
        .1;
        let inputs = vec![
            vec![],
            vec![detection("cell phone", 0.9)],
            vec![detection("cup", 0.2), detection("cell phone", 1.0)],
        ];
        for input in inputs {
            for _ in 0..2 {
                let (fire, state) = evaluate(&input, fired, &phone_trigger());
                assert!(!fire);
                assert!(state.fired());
            }
        }
    }

    #[test]
    fn latch_does_not_rearm_on_absence() {
        let mut policy = AlertPolicy::new(Some(phone_trigger()));
        let phone = vec![detection("cup", 0.95), detection("cell phone", 0.9)];

        let fired = policy.check(&phone).cloned();
        assert_eq!(fired, Some(detection("cell phone", 0.9)));
        assert!(policy.check(&[]).is_none());
        assert!(policy.check(&phone).is_none());
        assert!(policy.state().fired());
    }

    #[test]
    fn policy_without_trigger_never_fires() {
        let mut policy = AlertPolicy::new(None);
        assert!(policy.check(&[detection("cell phone", 1.0)]).is_none());
        assert!(!policy.state().fired());
    }
}
