use serde::{Deserialize, Serialize};

/// One month of aggregated satellite NDVI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyNdvi {
    pub month: String,
    pub mean_ndvi: Option<f64>,
    pub valid_pixels: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
    Insufficient,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Rising => "rising",
            TrendDirection::Falling => "falling",
            TrendDirection::Stable => "stable",
            TrendDirection::Insufficient => "insufficient",
        }
    }
}

/// Trend summary persisted into the satellite band.
#[derive(Debug, Clone, Serialize)]
pub struct NdviTrend {
    pub direction: TrendDirection,
    pub slope: Option<f64>,
    pub latest_ndvi: Option<f64>,
    pub earliest_ndvi: Option<f64>,
    pub mean_ndvi: Option<f64>,
    pub months_with_data: usize,
}

impl NdviTrend {
    pub fn insufficient() -> Self {
        Self {
            direction: TrendDirection::Insufficient,
            slope: None,
            latest_ndvi: None,
            earliest_ndvi: None,
            mean_ndvi: None,
            months_with_data: 0,
        }
    }
}

const SLOPE_STABLE_BAND: f64 = 0.005;

/// Least-squares slope of monthly means against month index, with the
/// direction bucketed by the +/-0.005 per-month band. Fewer than three data
/// months is not enough signal to call a direction.
pub fn compute_trend(monthly: &[MonthlyNdvi]) -> NdviTrend {
    let values: Vec<f64> = monthly.iter().filter_map(|m| m.mean_ndvi).collect();
    if values.len() < 3 {
        let mut trend = NdviTrend::insufficient();
        trend.months_with_data = values.len();
        trend.latest_ndvi = values.last().copied();
        trend.earliest_ndvi = values.first().copied();
        if !values.is_empty() {
            trend.mean_ndvi = Some(values.iter().sum::<f64>() / values.len() as f64);
        }
        return trend;
    }

    let points: Vec<(f64, f64)> = values
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64, *v))
        .collect();
    let slope = ols_slope(&points);

    let direction = match slope {
        Some(s) if s > SLOPE_STABLE_BAND => TrendDirection::Rising,
        Some(s) if s < -SLOPE_STABLE_BAND => TrendDirection::Falling,
        Some(_) => TrendDirection::Stable,
        None => TrendDirection::Insufficient,
    };

    NdviTrend {
        direction,
        slope,
        latest_ndvi: values.last().copied(),
        earliest_ndvi: values.first().copied(),
        mean_ndvi: Some(values.iter().sum::<f64>() / values.len() as f64),
        months_with_data: values.len(),
    }
}

/// Ordinary least-squares slope: sum((x-x̄)(y-ȳ)) / sum((x-x̄)²).
/// Degenerate inputs (under two points, all x equal, non-finite result)
/// yield no slope rather than NaN.
pub fn ols_slope(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let x_mean = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let y_mean = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut num = 0.0;
    let mut denom = 0.0;
    for (x, y) in points {
        num += (x - x_mean) * (y - y_mean);
        denom += (x - x_mean) * (x - x_mean);
    }
    if denom <= 0.0 {
        return None;
    }
    let slope = num / denom;
    slope.is_finite().then_some(slope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn months(values: &[f64]) -> Vec<MonthlyNdvi> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| MonthlyNdvi {
                month: format!("2025-{:02}", i + 1),
                mean_ndvi: Some(*v),
                valid_pixels: Some(2500),
            })
            .collect()
    }

    #[test]
    fn exact_slope_on_a_line() {
        let slope = ols_slope(&[(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)]).unwrap();
        assert!((slope - 2.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_inputs_have_no_slope() {
        assert!(ols_slope(&[]).is_none());
        assert!(ols_slope(&[(2020.0, 0.4)]).is_none());
        assert!(ols_slope(&[(2020.0, 0.4), (2020.0, 0.5)]).is_none());
    }

    #[test]
    fn rising_falling_and_stable_bands() {
        let rising = compute_trend(&months(&[0.30, 0.35, 0.40, 0.45]));
        assert_eq!(rising.direction, TrendDirection::Rising);

        let falling = compute_trend(&months(&[0.45, 0.40, 0.35, 0.30]));
        assert_eq!(falling.direction, TrendDirection::Falling);

        let stable = compute_trend(&months(&[0.40, 0.401, 0.399, 0.40]));
        assert_eq!(stable.direction, TrendDirection::Stable);
    }

    #[test]
    fn fewer_than_three_months_is_insufficient() {
        let trend = compute_trend(&months(&[0.4, 0.5]));
        assert_eq!(trend.direction, TrendDirection::Insufficient);
        assert!(trend.slope.is_none());
        assert_eq!(trend.months_with_data, 2);
        // summary stats still populated for the persisted row
        assert_eq!(trend.latest_ndvi, Some(0.5));
    }

    #[test]
    fn gaps_in_monthly_data_are_skipped_not_zeroed() {
        let mut data = months(&[0.40, 0.45, 0.50]);
        data.insert(
            1,
            MonthlyNdvi {
                month: "2025-xx".into(),
                mean_ndvi: None,
                valid_pixels: None,
            },
        );
        let trend = compute_trend(&data);
        assert_eq!(trend.months_with_data, 3);
        assert_eq!(trend.direction, TrendDirection::Rising);
    }
}
