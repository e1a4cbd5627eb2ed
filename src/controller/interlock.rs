use crate::utils::error::DeviceError;

/// Cross-axis safety rule: the horizontal axis may only move or home
/// while the vertical plate sits at or below the configured guard height.
///
/// The decision is a pure function of the last-known vertical position
/// and is re-evaluated before every horizontal command; it is never
/// cached across calls because the vertical axis can move in between.
#[derive(Debug, Clone, Copy)]
pub struct SafetyInterlock {
    guard_mm: f64,
}

impl SafetyInterlock {
    pub fn new(guard_mm: f64) -> Self {
        Self { guard_mm }
    }

    pub fn guard_mm(&self) -> f64 {
        self.guard_mm
    }

    /// Check whether horizontal motion is allowed for the given vertical
    /// position. Unknown position locks the axis.
    pub fn evaluate(&self, vertical_mm: Option<f64>) -> Result<(), DeviceError> {
        match vertical_mm {
            None => Err(DeviceError::Interlocked(
                "horizontal axis locked: waiting for vertical axis feedback".to_string(),
            )),
            Some(position) if position > self.guard_mm => {
                Err(DeviceError::Interlocked(format!(
                    "horizontal axis locked: vertical axis at {:.2} mm (> {:.1} mm limit)",
                    position, self.guard_mm
                )))
            }
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_vertical_position_locks() {
        let interlock = SafetyInterlock::new(10.0);
        assert!(matches!(
            interlock.evaluate(None),
            Err(DeviceError::Interlocked(_))
        ));
    }

    #[test]
    fn guard_boundary_is_inclusive() {
        let interlock = SafetyInterlock::new(10.0);
        assert!(interlock.evaluate(Some(0.0)).is_ok());
        assert!(interlock.evaluate(Some(10.0)).is_ok());
        assert!(interlock.evaluate(Some(10.01)).is_err());
        assert!(interlock.evaluate(Some(33.0)).is_err());
    }

    #[test]
    fn lock_message_names_the_offending_position() {
        let interlock = SafetyInterlock::new(10.0);
        let err = interlock.evaluate(Some(33.0)).unwrap_err();
        assert!(err.to_string().contains("33.00 mm"));
    }
}
