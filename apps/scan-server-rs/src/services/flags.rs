use serde_json::json;

use crate::services::fema::{FloodRisk, FloodZone};
use crate::services::trends::{NdviTrend, TrendDirection};

// Vegetation neglect band: below the floor is impervious surface, not
// neglect.
const NDVI_NEGLECT_MIN: f64 = 0.10;
const NDVI_NEGLECT_MAX: f64 = 0.30;

// Overgrowth tiers. Exactly 0.65 is strong tier.
const NDVI_OVERGROWTH_MODERATE: f64 = 0.50;
const NDVI_OVERGROWTH_STRONG: f64 = 0.65;
const NDVI_OVERGROWTH_DELTA: f64 = 0.15;

// Structural change: NDVI collapse from the historical baseline.
const NDVI_DROP_THRESHOLD: f64 = 0.20;

// Two independent sources agreeing on direction and magnitude.
const AGREEMENT_BOOST: f64 = 0.1;

const FLOOD_HIGH_CONFIDENCE: f64 = 1.0;
const FLOOD_MODERATE_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalCode {
    VegetationOvergrowth,
    VegetationNeglect,
    FloodRisk,
    StructuralChange,
    UspsVacancy,
}

impl SignalCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalCode::VegetationOvergrowth => "vegetation_overgrowth",
            SignalCode::VegetationNeglect => "vegetation_neglect",
            SignalCode::FloodRisk => "flood_risk",
            SignalCode::StructuralChange => "structural_change",
            SignalCode::UspsVacancy => "usps_vacancy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlagResult {
    pub code: SignalCode,
    pub confidence: f64,
    pub evidence: serde_json::Value,
}

/// Aerial NDVI reading with optional historical baseline mean.
#[derive(Debug, Clone, Default)]
pub struct AerialEvidence {
    pub current_ndvi: Option<f64>,
    pub baseline_ndvi: Option<f64>,
}

/// Carrier vacancy facts as persisted on the parcel row.
#[derive(Debug, Clone, Default)]
pub struct VacancyEvidence {
    pub vacant: Option<bool>,
    pub dpv_confirmed: Option<bool>,
    pub address_mismatch: bool,
}

/// Everything the evaluators may consume for one parcel. Each source is
/// optional; evaluators fire on whatever subset is present.
#[derive(Debug, Clone, Default)]
pub struct EvidenceBundle {
    pub aerial: Option<AerialEvidence>,
    pub trend: Option<NdviTrend>,
    pub flood: Option<FloodZone>,
    pub vacancy: Option<VacancyEvidence>,
}

fn ndvi_in_range(value: f64) -> bool {
    (-1.0..=1.0).contains(&value) && value.is_finite()
}

/// Drop any source whose NDVI is outside [-1, 1]. The diagnostic is logged
/// and only that source's evaluators are skipped.
fn validated_aerial(aerial: Option<&AerialEvidence>) -> Option<&AerialEvidence> {
    let aerial = aerial?;
    if let Some(ndvi) = aerial.current_ndvi {
        if !ndvi_in_range(ndvi) {
            tracing::warn!(ndvi, "aerial NDVI outside [-1, 1], skipping aerial evaluators");
            return None;
        }
    }
    if let Some(baseline) = aerial.baseline_ndvi {
        if !ndvi_in_range(baseline) {
            tracing::warn!(baseline, "aerial baseline outside [-1, 1], skipping aerial evaluators");
            return None;
        }
    }
    Some(aerial)
}

fn validated_trend(trend: Option<&NdviTrend>) -> Option<&NdviTrend> {
    let trend = trend?;
    if let Some(latest) = trend.latest_ndvi {
        if !ndvi_in_range(latest) {
            tracing::warn!(latest, "satellite NDVI outside [-1, 1], skipping trend evaluators");
            return None;
        }
    }
    Some(trend)
}

/// Two-tier overgrowth. Strong tier (NDVI >= 0.65) fires even without a
/// baseline; the moderate tier needs the historical delta to confirm.
/// Aerial and satellite agreeing on an upward move boosts additively.
pub fn evaluate_vegetation_overgrowth(
    aerial: Option<&AerialEvidence>,
    trend: Option<&NdviTrend>,
) -> Option<FlagResult> {
    let aerial = validated_aerial(aerial);
    let trend = validated_trend(trend);

    let mut evidence = serde_json::Map::new();

    let aerial_conf: Option<f64> = aerial.and_then(|a| {
        let current = a.current_ndvi?;
        if current >= NDVI_OVERGROWTH_STRONG {
            evidence.insert("aerial_ndvi".into(), json!(current));
            evidence.insert("tier".into(), json!("strong"));
            match a.baseline_ndvi {
                Some(baseline) if current - baseline > NDVI_OVERGROWTH_DELTA => {
                    let delta = current - baseline;
                    evidence.insert("baseline_ndvi".into(), json!(baseline));
                    evidence.insert("delta".into(), json!(delta));
                    Some((delta / 0.3).clamp(0.6, 1.0))
                }
                Some(baseline) => {
                    evidence.insert("baseline_ndvi".into(), json!(baseline));
                    Some(0.6)
                }
                None => {
                    evidence.insert("note".into(), json!("no_historical_baseline"));
                    Some(0.6)
                }
            }
        } else if current >= NDVI_OVERGROWTH_MODERATE {
            let baseline = a.baseline_ndvi?;
            let delta = current - baseline;
            if delta > NDVI_OVERGROWTH_DELTA {
                evidence.insert("aerial_ndvi".into(), json!(current));
                evidence.insert("baseline_ndvi".into(), json!(baseline));
                evidence.insert("delta".into(), json!(delta));
                evidence.insert("tier".into(), json!("moderate"));
                Some((delta / 0.3).min(0.8))
            } else {
                None
            }
        } else {
            None
        }
    });

    let trend_conf: Option<f64> = trend.and_then(|t| {
        let slope = t.slope?;
        if t.direction == TrendDirection::Rising
            && t.latest_ndvi.is_some_and(|latest| latest > NDVI_OVERGROWTH_MODERATE)
        {
            evidence.insert("trend_slope".into(), json!(slope));
            evidence.insert("trend_latest_ndvi".into(), json!(t.latest_ndvi));
            Some((slope / 0.02).clamp(0.0, 1.0))
        } else {
            None
        }
    });

    let confidence = match (aerial_conf, trend_conf) {
        (Some(a), Some(t)) => {
            evidence.insert("agreement".into(), json!("aerial_and_satellite"));
            (a.max(t) + AGREEMENT_BOOST).min(1.0)
        }
        (Some(a), None) => a,
        (None, Some(t)) => t,
        (None, None) => return None,
    };

    Some(FlagResult {
        code: SignalCode::VegetationOvergrowth,
        confidence,
        evidence: serde_json::Value::Object(evidence),
    })
}

/// Bare-lot neglect. Confidence is linear across the band:
/// 0.10 -> 1.0, 0.30 -> 0.0. A high-risk flood zone compounds the distress.
pub fn evaluate_vegetation_neglect(
    aerial: Option<&AerialEvidence>,
    flood: Option<&FloodZone>,
) -> Option<FlagResult> {
    let aerial = validated_aerial(aerial)?;
    let current = aerial.current_ndvi?;
    if !(NDVI_NEGLECT_MIN..=NDVI_NEGLECT_MAX).contains(&current) {
        return None;
    }

    let mut confidence =
        (NDVI_NEGLECT_MAX - current) / (NDVI_NEGLECT_MAX - NDVI_NEGLECT_MIN);
    let mut evidence = serde_json::Map::new();
    evidence.insert("aerial_ndvi".into(), json!(current));

    if let Some(flood) = flood {
        if flood.risk == FloodRisk::High {
            confidence = (confidence + 0.15).min(1.0);
            evidence.insert("flood_boost".into(), json!(true));
            evidence.insert("flood_risk".into(), json!(flood.risk.as_str()));
        }
    }

    Some(FlagResult {
        code: SignalCode::VegetationNeglect,
        confidence,
        evidence: serde_json::Value::Object(evidence),
    })
}

pub fn evaluate_flood_risk(flood: Option<&FloodZone>) -> Option<FlagResult> {
    let flood = flood?;
    let confidence = match flood.risk {
        FloodRisk::High => FLOOD_HIGH_CONFIDENCE,
        FloodRisk::Moderate => FLOOD_MODERATE_CONFIDENCE,
        FloodRisk::Low | FloodRisk::None => return None,
    };
    Some(FlagResult {
        code: SignalCode::FloodRisk,
        confidence,
        evidence: json!({
            "flood_zone": flood.flood_zone,
            "zone_subtype": flood.zone_subtype,
            "is_sfha": flood.is_sfha,
            "risk": flood.risk.as_str(),
        }),
    })
}

/// Demolition, fire, clearing: a large NDVI drop from the baseline, or a
/// falling satellite trend with the same magnitude.
pub fn evaluate_structural_change(
    aerial: Option<&AerialEvidence>,
    trend: Option<&NdviTrend>,
) -> Option<FlagResult> {
    let aerial = validated_aerial(aerial);
    let trend = validated_trend(trend);

    let mut evidence = serde_json::Map::new();

    let aerial_conf: Option<f64> = aerial.and_then(|a| {
        let current = a.current_ndvi?;
        let baseline = a.baseline_ndvi?;
        let drop = baseline - current;
        if drop > NDVI_DROP_THRESHOLD {
            evidence.insert("aerial_ndvi".into(), json!(current));
            evidence.insert("baseline_ndvi".into(), json!(baseline));
            evidence.insert("drop".into(), json!(drop));
            Some((drop / 0.4).min(1.0))
        } else {
            None
        }
    });

    let trend_conf: Option<f64> = trend.and_then(|t| {
        let slope = t.slope?;
        if t.direction != TrendDirection::Falling {
            return None;
        }
        let (earliest, latest) = (t.earliest_ndvi?, t.latest_ndvi?);
        if earliest - latest > NDVI_DROP_THRESHOLD {
            evidence.insert("trend_slope".into(), json!(slope));
            evidence.insert("trend_drop".into(), json!(earliest - latest));
            Some((slope.abs() / 0.02).min(1.0))
        } else {
            None
        }
    });

    let confidence = match (aerial_conf, trend_conf) {
        (Some(a), Some(t)) => {
            evidence.insert("agreement".into(), json!("aerial_and_satellite"));
            (a.max(t) + AGREEMENT_BOOST).min(1.0)
        }
        (Some(a), None) => a,
        (None, Some(t)) => t,
        (None, None) => return None,
    };

    Some(FlagResult {
        code: SignalCode::StructuralChange,
        confidence,
        evidence: serde_json::Value::Object(evidence),
    })
}

/// Carrier-confirmed vacancy (no mail collected for 90+ days). Delivery
/// point validation raises confidence; an address the carrier corrected
/// caps it regardless of DPV.
pub fn evaluate_usps_vacancy(vacancy: Option<&VacancyEvidence>) -> Option<FlagResult> {
    let vacancy = vacancy?;
    if vacancy.vacant != Some(true) {
        return None;
    }

    let mut confidence: f64 = match vacancy.dpv_confirmed {
        Some(true) => 0.90,
        _ => 0.75,
    };
    if vacancy.address_mismatch {
        confidence = confidence.min(0.70);
    }

    Some(FlagResult {
        code: SignalCode::UspsVacancy,
        confidence,
        evidence: json!({
            "vacant": true,
            "dpv_confirmed": vacancy.dpv_confirmed,
            "address_mismatch": vacancy.address_mismatch,
        }),
    })
}

/// Run every evaluator over the bundle, returning only the flags that fired.
pub fn generate_flags(bundle: &EvidenceBundle) -> Vec<FlagResult> {
    let flags: Vec<FlagResult> = [
        evaluate_vegetation_overgrowth(bundle.aerial.as_ref(), bundle.trend.as_ref()),
        evaluate_vegetation_neglect(bundle.aerial.as_ref(), bundle.flood.as_ref()),
        evaluate_flood_risk(bundle.flood.as_ref()),
        evaluate_structural_change(bundle.aerial.as_ref(), bundle.trend.as_ref()),
        evaluate_usps_vacancy(bundle.vacancy.as_ref()),
    ]
    .into_iter()
    .flatten()
    .collect();

    tracing::debug!(
        triggered = flags.len(),
        codes = ?flags.iter().map(|f| f.code.as_str()).collect::<Vec<_>>(),
        "flags evaluated"
    );
    flags
}

/// Combine two optional confidences with max. A present 0.0 stays a 0.0;
/// it is never treated as falsy.
pub fn combine_confidence(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aerial(current: f64) -> AerialEvidence {
        AerialEvidence {
            current_ndvi: Some(current),
            baseline_ndvi: None,
        }
    }

    fn aerial_with_baseline(current: f64, baseline: f64) -> AerialEvidence {
        AerialEvidence {
            current_ndvi: Some(current),
            baseline_ndvi: Some(baseline),
        }
    }

    fn flood(risk: FloodRisk) -> FloodZone {
        FloodZone {
            flood_zone: Some("AE".to_string()),
            zone_subtype: None,
            is_sfha: risk == FloodRisk::High,
            risk,
        }
    }

    #[test]
    fn strong_overgrowth_fires_at_exactly_the_threshold() {
        let flag = evaluate_vegetation_overgrowth(Some(&aerial(0.65)), None).unwrap();
        assert_eq!(flag.confidence, 0.6);

        // just below the strong tier, with no baseline delta, nothing fires
        assert!(evaluate_vegetation_overgrowth(Some(&aerial(0.6499)), None).is_none());
    }

    #[test]
    fn moderate_tier_needs_the_historical_delta() {
        let no_delta = aerial_with_baseline(0.60, 0.55);
        assert!(evaluate_vegetation_overgrowth(Some(&no_delta), None).is_none());

        let with_delta = aerial_with_baseline(0.60, 0.40);
        let flag = evaluate_vegetation_overgrowth(Some(&with_delta), None).unwrap();
        assert!(flag.confidence > 0.0 && flag.confidence <= 0.8);
    }

    #[test]
    fn strong_tier_without_history_is_point_six() {
        let flag = evaluate_vegetation_overgrowth(Some(&aerial(0.72)), None).unwrap();
        assert_eq!(flag.confidence, 0.6);
    }

    #[test]
    fn agreement_boosts_additively_and_caps() {
        let a = aerial_with_baseline(0.80, 0.40);
        let trend = NdviTrend {
            direction: TrendDirection::Rising,
            slope: Some(0.03),
            latest_ndvi: Some(0.78),
            earliest_ndvi: Some(0.50),
            mean_ndvi: Some(0.6),
            months_with_data: 10,
        };
        let flag = evaluate_vegetation_overgrowth(Some(&a), Some(&trend)).unwrap();
        assert_eq!(flag.confidence, 1.0);
        assert_eq!(flag.evidence["agreement"], "aerial_and_satellite");
    }

    #[test]
    fn neglect_confidence_is_linear_across_the_band() {
        let at_floor = evaluate_vegetation_neglect(Some(&aerial(0.10)), None).unwrap();
        assert!((at_floor.confidence - 1.0).abs() < 1e-9);

        let midpoint = evaluate_vegetation_neglect(Some(&aerial(0.20)), None).unwrap();
        assert!((midpoint.confidence - 0.5).abs() < 1e-9);

        let at_ceiling = evaluate_vegetation_neglect(Some(&aerial(0.30)), None).unwrap();
        assert!(at_ceiling.confidence.abs() < 1e-9);

        assert!(evaluate_vegetation_neglect(Some(&aerial(0.09)), None).is_none());
        assert!(evaluate_vegetation_neglect(Some(&aerial(0.31)), None).is_none());
    }

    #[test]
    fn neglect_gets_flood_boost_in_high_risk_zones_only() {
        let boosted =
            evaluate_vegetation_neglect(Some(&aerial(0.20)), Some(&flood(FloodRisk::High)))
                .unwrap();
        assert!((boosted.confidence - 0.65).abs() < 1e-9);

        let moderate =
            evaluate_vegetation_neglect(Some(&aerial(0.20)), Some(&flood(FloodRisk::Moderate)))
                .unwrap();
        assert!((moderate.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn flood_flag_confidences() {
        assert_eq!(
            evaluate_flood_risk(Some(&flood(FloodRisk::High))).unwrap().confidence,
            1.0
        );
        assert_eq!(
            evaluate_flood_risk(Some(&flood(FloodRisk::Moderate)))
                .unwrap()
                .confidence,
            0.6
        );
        assert!(evaluate_flood_risk(Some(&flood(FloodRisk::Low))).is_none());
        assert!(evaluate_flood_risk(None).is_none());
    }

    #[test]
    fn structural_change_needs_a_real_drop() {
        let small = aerial_with_baseline(0.45, 0.60);
        assert!(evaluate_structural_change(Some(&small), None).is_none());

        let big = aerial_with_baseline(0.20, 0.55);
        let flag = evaluate_structural_change(Some(&big), None).unwrap();
        assert!((flag.confidence - 0.35 / 0.4).abs() < 1e-9);
    }

    #[test]
    fn vacancy_confidence_ladder() {
        let confirmed = VacancyEvidence {
            vacant: Some(true),
            dpv_confirmed: Some(true),
            address_mismatch: false,
        };
        assert_eq!(evaluate_usps_vacancy(Some(&confirmed)).unwrap().confidence, 0.90);

        let unknown_dpv = VacancyEvidence {
            vacant: Some(true),
            dpv_confirmed: None,
            address_mismatch: false,
        };
        assert_eq!(evaluate_usps_vacancy(Some(&unknown_dpv)).unwrap().confidence, 0.75);

        // mismatch caps at 0.70 regardless of DPV
        let mismatched = VacancyEvidence {
            vacant: Some(true),
            dpv_confirmed: Some(true),
            address_mismatch: true,
        };
        assert_eq!(evaluate_usps_vacancy(Some(&mismatched)).unwrap().confidence, 0.70);

        let occupied = VacancyEvidence {
            vacant: Some(false),
            dpv_confirmed: Some(true),
            address_mismatch: false,
        };
        assert!(evaluate_usps_vacancy(Some(&occupied)).is_none());
    }

    #[test]
    fn out_of_range_ndvi_skips_only_that_source() {
        let bundle = EvidenceBundle {
            aerial: Some(AerialEvidence {
                current_ndvi: Some(3.2),
                baseline_ndvi: None,
            }),
            flood: Some(flood(FloodRisk::High)),
            ..Default::default()
        };
        let flags = generate_flags(&bundle);
        // flood evaluator still runs; aerial evaluators are skipped
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].code, SignalCode::FloodRisk);
    }

    #[test]
    fn combining_a_present_zero_never_increases_the_result() {
        // metamorphic: replacing a 0.15 confidence with 0.0 must not raise
        // the combined value
        let with_low = combine_confidence(Some(0.15), Some(0.4));
        let with_zero = combine_confidence(Some(0.0), Some(0.4));
        assert!(with_zero.unwrap() <= with_low.unwrap());

        assert_eq!(combine_confidence(Some(0.0), None), Some(0.0));
        assert_eq!(combine_confidence(None, None), None);
    }

    #[test]
    fn all_confidences_stay_in_unit_range() {
        let bundle = EvidenceBundle {
            aerial: Some(aerial_with_baseline(0.95, 0.10)),
            trend: Some(NdviTrend {
                direction: TrendDirection::Rising,
                slope: Some(0.5),
                latest_ndvi: Some(0.9),
                earliest_ndvi: Some(0.1),
                mean_ndvi: Some(0.5),
                months_with_data: 12,
            }),
            flood: Some(flood(FloodRisk::High)),
            vacancy: Some(VacancyEvidence {
                vacant: Some(true),
                dpv_confirmed: Some(true),
                address_mismatch: false,
            }),
        };
        for flag in generate_flags(&bundle) {
            assert!((0.0..=1.0).contains(&flag.confidence), "{:?}", flag.code);
        }
    }
}
