pub mod conviction;
pub mod historical_slope;
pub mod ndvi_scan;
pub mod sentinel_enrich;
pub mod vacancy_enrich;

use crate::services::flags::{combine_confidence, FlagResult, SignalCode};

/// Outcome counters every batch pass reports.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PassSummary {
    pub scanned: usize,
    pub flagged: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl std::fmt::Display for PassSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scanned={} flagged={} errors={} skipped={}",
            self.scanned, self.flagged, self.errors, self.skipped
        )
    }
}

/// Flag results flattened into the persisted column shape.
#[derive(Debug, Clone, Default)]
pub struct FlagRollup {
    pub distress_flags: Option<String>,
    pub flag_veg: bool,
    pub flag_flood: bool,
    pub flag_structural: bool,
    pub flag_neglect: bool,
    pub veg_confidence: Option<f64>,
    pub flood_confidence: Option<f64>,
}

impl FlagRollup {
    pub fn from_flags(flags: &[FlagResult]) -> Self {
        let mut codes: Vec<&str> = flags.iter().map(|f| f.code.as_str()).collect();
        codes.sort_unstable();

        let conf = |code: SignalCode| -> Option<f64> {
            flags
                .iter()
                .find(|f| f.code == code)
                .map(|f| f.confidence)
        };

        Self {
            distress_flags: (!codes.is_empty()).then(|| codes.join(",")),
            flag_veg: conf(SignalCode::VegetationOvergrowth).is_some(),
            flag_flood: conf(SignalCode::FloodRisk).is_some(),
            flag_structural: conf(SignalCode::StructuralChange).is_some(),
            flag_neglect: conf(SignalCode::VegetationNeglect).is_some(),
            // max, not or: a present 0.0 must survive the combination
            veg_confidence: combine_confidence(
                conf(SignalCode::VegetationOvergrowth),
                conf(SignalCode::VegetationNeglect),
            ),
            flood_confidence: conf(SignalCode::FloodRisk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flag(code: SignalCode, confidence: f64) -> FlagResult {
        FlagResult {
            code,
            confidence,
            evidence: json!({}),
        }
    }

    #[test]
    fn rollup_codes_are_sorted_and_joined() {
        let rollup = FlagRollup::from_flags(&[
            flag(SignalCode::FloodRisk, 1.0),
            flag(SignalCode::VegetationNeglect, 0.4),
        ]);
        assert_eq!(
            rollup.distress_flags.as_deref(),
            Some("flood_risk,vegetation_neglect")
        );
        assert!(rollup.flag_flood && rollup.flag_neglect);
        assert!(!rollup.flag_veg);
    }

    #[test]
    fn veg_confidence_is_the_max_of_both_vegetation_flags() {
        let rollup = FlagRollup::from_flags(&[
            flag(SignalCode::VegetationOvergrowth, 0.0),
            flag(SignalCode::VegetationNeglect, 0.4),
        ]);
        assert_eq!(rollup.veg_confidence, Some(0.4));

        // a lone present 0.0 is still a value, not an absence
        let rollup = FlagRollup::from_flags(&[flag(SignalCode::VegetationNeglect, 0.0)]);
        assert_eq!(rollup.veg_confidence, Some(0.0));
    }

    #[test]
    fn empty_flags_roll_up_to_nothing() {
        let rollup = FlagRollup::from_flags(&[]);
        assert!(rollup.distress_flags.is_none());
        assert!(rollup.veg_confidence.is_none());
        assert!(!rollup.flag_flood);
    }
}
