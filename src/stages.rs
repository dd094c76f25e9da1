//! Stage definitions and the pure range validator
//!
//! A stage is one step of a multi-step test plan, carrying an inclusive acceptance range for
//! each of the three measured quantities. Validation is deterministic and side-effect free so
//! it can be exercised exhaustively without hardware.

use std::fmt;

use crate::telemetry::Measurement;

/// An inclusive acceptance range for one measured quantity
///
/// Both ends are part of the range: a measurement exactly equal to `min` or `max` passes.
/// Degenerate ranges (`min == max`) are legal; inverted ranges are a contract violation by
/// whatever produced the stage definition, never constructed by this engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeLimits
{
    pub min: f64,
    pub max: f64,
}

impl RangeLimits
{
    pub fn new(min: f64, max: f64) -> Self
    {
        Self { min: min, max: max }
    }

    /// Inclusive containment check at both ends
    pub fn contains(&self, value: f64) -> bool
    {
        self.min <= value && value <= self.max
    }

    /// Whether the range honors the `min <= max` invariant
    pub fn is_well_formed(&self) -> bool
    {
        self.min <= self.max
    }
}

impl fmt::Display for RangeLimits
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}..{}", self.min, self.max)
    }
}

/// One step of a test plan with its acceptance ranges
///
/// Created by configuration tooling and read back through the config store; read-only to this
/// engine. `sequence_index` is 1-based and unique within a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDefinition
{
    pub sequence_index: u32,
    pub name: String,
    pub voltage: RangeLimits,
    pub current: RangeLimits,
    pub resistance: RangeLimits,
}

impl StageDefinition
{
    /// Whether all three ranges honor the `min <= max` invariant
    pub fn is_well_formed(&self) -> bool
    {
        self.voltage.is_well_formed()
            && self.current.is_well_formed()
            && self.resistance.is_well_formed()
    }
}

/// The outcome of checking one measurement against one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageVerdict
{
    pub passed: bool,
    /// One human-readable entry per out-of-range quantity, always ordered voltage, current,
    /// resistance
    pub reasons: Vec<String>,
}

/// Checks a measurement against a stage's acceptance ranges
///
/// Each quantity is tested with inclusive bounds. The verdict passes only when all three are in
/// range, and the failure reasons are emitted in the fixed order voltage, current, resistance so
/// downstream reporting and assertions are deterministic.
pub fn validate(measurement: &Measurement, stage: &StageDefinition) -> StageVerdict
{
    debug_assert!(stage.is_well_formed(), "stage '{}' has an inverted range", stage.name);

    let mut reasons = Vec::new();

    if !stage.voltage.contains(measurement.voltage) {
        reasons.push(format!(
            "voltage {} V out of range {} V",
            measurement.voltage, stage.voltage
        ));
    }

    if !stage.current.contains(measurement.current) {
        reasons.push(format!(
            "current {} A out of range {} A",
            measurement.current, stage.current
        ));
    }

    if !stage.resistance.contains(measurement.resistance) {
        reasons.push(format!(
            "resistance {} Ω out of range {} Ω",
            measurement.resistance, stage.resistance
        ));
    }

    StageVerdict {
        passed: reasons.is_empty(),
        reasons: reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn power_stage() -> StageDefinition
    {
        StageDefinition {
            sequence_index: 1,
            name: String::from("Power rail"),
            voltage: RangeLimits::new(4.5, 5.5),
            current: RangeLimits::new(0.1, 1.0),
            resistance: RangeLimits::new(90.0, 110.0),
        }
    }

    #[test]
    fn in_range_measurement_passes()
    {
        let verdict = validate(&Measurement::new(5.0, 0.5, 100.0), &power_stage());

        assert!(verdict.passed);
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn boundary_values_pass_at_both_ends()
    {
        let stage = power_stage();

        assert!(validate(&Measurement::new(4.5, 0.1, 90.0), &stage).passed);
        assert!(validate(&Measurement::new(5.5, 1.0, 110.0), &stage).passed);
    }

    #[test]
    fn degenerate_range_accepts_only_its_value()
    {
        let mut stage = power_stage();
        stage.voltage = RangeLimits::new(5.0, 5.0);

        assert!(validate(&Measurement::new(5.0, 0.5, 100.0), &stage).passed);
        assert!(!validate(&Measurement::new(5.0001, 0.5, 100.0), &stage).passed);
    }

    #[test]
    fn single_failure_names_the_quantity()
    {
        let verdict = validate(&Measurement::new(5.7, 0.5, 100.0), &power_stage());

        assert!(!verdict.passed);
        assert_eq!(verdict.reasons.len(), 1);
        assert!(verdict.reasons[0].contains("voltage"));
        assert!(verdict.reasons[0].contains("5.7"));
    }

    #[test]
    fn voltage_reason_sorts_first_among_multiple_failures()
    {
        let verdict = validate(&Measurement::new(5.7, 2.0, 100.0), &power_stage());

        assert_eq!(verdict.reasons.len(), 2);
        assert!(verdict.reasons[0].contains("voltage"));
        assert!(verdict.reasons[1].contains("current"));
    }

    #[test]
    fn all_three_failures_keep_fixed_order()
    {
        let verdict = validate(&Measurement::new(0.0, 0.0, 0.0), &power_stage());

        assert_eq!(verdict.reasons.len(), 3);
        assert!(verdict.reasons[0].contains("voltage"));
        assert!(verdict.reasons[1].contains("current"));
        assert!(verdict.reasons[2].contains("resistance"));
    }
}
