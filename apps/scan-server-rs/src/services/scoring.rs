use crate::services::flags::{FlagResult, SignalCode};

// Conviction model constants, contract v1.0.
pub const W_DS: f64 = 0.35;
pub const W_MC: f64 = 0.40;
pub const MC_CAP: f64 = 7.0;
pub const VAC_BONUS_MAX: f64 = 2.5;
pub const MODEL_VERSION: &str = "v1.0";

pub fn signal_weight(code: SignalCode) -> f64 {
    match code {
        SignalCode::VegetationOvergrowth => 2.0,
        SignalCode::VegetationNeglect => 1.5,
        SignalCode::FloodRisk => 1.5,
        SignalCode::StructuralChange => 2.5,
        SignalCode::UspsVacancy => 2.5,
    }
}

/// Weighted sum of flag confidences, clamped to [0, 10].
pub fn distress_score(flags: &[FlagResult]) -> f64 {
    let score: f64 = flags
        .iter()
        .map(|flag| signal_weight(flag.code) * flag.confidence)
        .sum();
    round2(score.clamp(0.0, 10.0))
}

/// Inputs to the conviction fusion. `mc_raw` is the sum of motivation-signal
/// confidences for the parcel; `mc_count == 0` means missing coverage, not
/// zero evidence.
#[derive(Debug, Clone, Default)]
pub struct ConvictionInput {
    pub distress_composite: Option<f64>,
    pub mc_raw: f64,
    pub mc_count: i64,
    pub flag_vacancy: bool,
    pub vacancy_confidence: Option<f64>,
    pub vacancy_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvictionScore {
    /// None when neither component is present (not rankable).
    pub score: Option<f64>,
    pub base: Option<f64>,
    pub vacancy_bonus: f64,
    pub components: Vec<&'static str>,
}

/// Reweighted-average fusion. A missing component is excluded from both the
/// numerator and the denominator, never folded in as a zero.
pub fn conviction(input: &ConvictionInput) -> ConvictionScore {
    let ds_comp = input
        .distress_composite
        .map(|ds| (ds / 10.0).clamp(0.0, 1.0));
    let mc_comp = (input.mc_count > 0).then(|| (input.mc_raw / MC_CAP).clamp(0.0, 1.0));

    let vacancy_bonus = if input.flag_vacancy && !input.vacancy_error {
        let conf = input.vacancy_confidence.unwrap_or(0.8).clamp(0.0, 1.0);
        round2(VAC_BONUS_MAX * conf)
    } else {
        0.0
    };

    let base_sum = ds_comp.map_or(0.0, |_| W_DS) + mc_comp.map_or(0.0, |_| W_MC);
    if base_sum == 0.0 {
        return ConvictionScore {
            score: None,
            base: None,
            vacancy_bonus,
            components: Vec::new(),
        };
    }

    let base =
        10.0 * (W_DS * ds_comp.unwrap_or(0.0) + W_MC * mc_comp.unwrap_or(0.0)) / base_sum;
    let score = round2((base + vacancy_bonus).clamp(0.0, 10.0));

    let mut components = Vec::new();
    if ds_comp.is_some() {
        components.push("DS");
    }
    if mc_comp.is_some() {
        components.push("MC");
    }
    if vacancy_bonus > 0.0 {
        components.push("VAC");
    }

    ConvictionScore {
        score: Some(score),
        base: Some(round2(base)),
        vacancy_bonus,
        components,
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::flags::{
        evaluate_vegetation_neglect, AerialEvidence, EvidenceBundle,
    };
    use crate::services::fema::{FloodRisk, FloodZone};
    use serde_json::json;

    fn flag(code: SignalCode, confidence: f64) -> FlagResult {
        FlagResult {
            code,
            confidence,
            evidence: json!({}),
        }
    }

    #[test]
    fn overgrowth_alone_scores_one_point_two() {
        // NDVI 0.72, no history: overgrowth at 0.6, weight 2.0
        let score = distress_score(&[flag(SignalCode::VegetationOvergrowth, 0.6)]);
        assert!((score - 1.2).abs() < 1e-9);
    }

    #[test]
    fn neglect_plus_flood_matches_hand_computation() {
        // NDVI 0.20 in zone AE: neglect 0.5 + 0.15 boost, flood 1.0
        let aerial = AerialEvidence {
            current_ndvi: Some(0.20),
            baseline_ndvi: None,
        };
        let zone = FloodZone {
            flood_zone: Some("AE".to_string()),
            zone_subtype: None,
            is_sfha: true,
            risk: FloodRisk::High,
        };
        let neglect = evaluate_vegetation_neglect(Some(&aerial), Some(&zone)).unwrap();
        let score = distress_score(&[
            neglect,
            flag(SignalCode::FloodRisk, 1.0),
        ]);
        // 1.5*0.65 + 1.5*1.0 = 2.475, rounded to 2 decimals either way
        assert!((score - 2.475).abs() < 0.006);
    }

    #[test]
    fn score_is_capped_at_ten() {
        let flags: Vec<FlagResult> = [
            SignalCode::VegetationOvergrowth,
            SignalCode::VegetationNeglect,
            SignalCode::FloodRisk,
            SignalCode::StructuralChange,
            SignalCode::UspsVacancy,
        ]
        .into_iter()
        .map(|code| flag(code, 1.0))
        .collect();
        assert_eq!(distress_score(&flags), 10.0);
    }

    #[test]
    fn ds_only_conviction_passes_the_composite_through() {
        let result = conviction(&ConvictionInput {
            distress_composite: Some(7.59),
            ..Default::default()
        });
        // one component: 10 * (0.35 * 0.759) / 0.35 = 7.59
        assert_eq!(result.score, Some(7.59));
        assert_eq!(result.components, vec!["DS"]);
        assert_eq!(result.vacancy_bonus, 0.0);
    }

    #[test]
    fn full_fusion_matches_the_contract_arithmetic() {
        let result = conviction(&ConvictionInput {
            distress_composite: Some(8.0),
            mc_raw: 3.5,
            mc_count: 2,
            flag_vacancy: true,
            vacancy_confidence: Some(0.90),
            vacancy_error: false,
        });
        // base = 10*(0.35*0.8 + 0.40*0.5)/0.75 = 6.40; bonus = 2.25
        assert_eq!(result.base, Some(6.4));
        assert_eq!(result.vacancy_bonus, 2.25);
        assert_eq!(result.score, Some(8.65));
        assert_eq!(result.components, vec!["DS", "MC", "VAC"]);
    }

    #[test]
    fn mc_only_conviction_scales_the_component() {
        let result = conviction(&ConvictionInput {
            mc_raw: 3.5,
            mc_count: 3,
            ..Default::default()
        });
        // 10 * mc_component = 10 * 0.5
        assert_eq!(result.score, Some(5.0));
        assert_eq!(result.components, vec!["MC"]);
    }

    #[test]
    fn zero_mc_signals_is_missing_coverage_not_zero_evidence() {
        let with_zero_count = conviction(&ConvictionInput {
            distress_composite: Some(6.0),
            mc_raw: 0.0,
            mc_count: 0,
            ..Default::default()
        });
        // MC absent: score must equal the DS passthrough, not be dragged down
        assert_eq!(with_zero_count.score, Some(6.0));
        assert_eq!(with_zero_count.components, vec!["DS"]);
    }

    #[test]
    fn neither_component_is_not_rankable() {
        let result = conviction(&ConvictionInput {
            flag_vacancy: true,
            vacancy_confidence: Some(0.9),
            ..Default::default()
        });
        assert_eq!(result.score, None);
        assert_eq!(result.base, None);
        // bonus is still reported for diagnostics
        assert_eq!(result.vacancy_bonus, 2.25);
    }

    #[test]
    fn vacancy_error_suppresses_the_bonus() {
        let result = conviction(&ConvictionInput {
            distress_composite: Some(8.0),
            flag_vacancy: true,
            vacancy_confidence: Some(0.9),
            vacancy_error: true,
            ..Default::default()
        });
        assert_eq!(result.vacancy_bonus, 0.0);
        assert_eq!(result.score, Some(8.0));
    }

    #[test]
    fn mc_raw_is_capped_before_weighting() {
        let result = conviction(&ConvictionInput {
            mc_raw: 21.0,
            mc_count: 9,
            ..Default::default()
        });
        assert_eq!(result.score, Some(10.0));
    }

    #[test]
    fn conviction_stays_in_range() {
        let result = conviction(&ConvictionInput {
            distress_composite: Some(10.0),
            mc_raw: 7.0,
            mc_count: 5,
            flag_vacancy: true,
            vacancy_confidence: Some(1.0),
            vacancy_error: false,
        });
        assert_eq!(result.score, Some(10.0));
    }

    #[test]
    fn bundle_scoring_is_deterministic() {
        let bundle = EvidenceBundle {
            aerial: Some(AerialEvidence {
                current_ndvi: Some(0.72),
                baseline_ndvi: None,
            }),
            ..Default::default()
        };
        let a = distress_score(&crate::services::flags::generate_flags(&bundle));
        let b = distress_score(&crate::services::flags::generate_flags(&bundle));
        assert_eq!(a, b);
    }
}
