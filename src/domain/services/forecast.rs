use chrono::{Duration, Months, NaiveDate};

use crate::domain::entities::forecast::{ForecastPoint, ForecastResult, HistoryPoint, ModelMetadata};
use crate::domain::errors::{PipelineError, PipelineResult};

/// Fewest observations a trend is fitted on
pub const MIN_HISTORY_POINTS: usize = 3;

/// Two-sided 95% normal quantile
const Z_95: f64 = 1.96;

const MODEL_NAME: &str = "linear_trend";

/// Fitted ordinary least squares line over the period index
#[derive(Debug, Clone, Copy, PartialEq)]
struct LinearFit {
    slope: f64,
    intercept: f64,
    r_squared: f64,
    residual_std_error: f64,
    mean_x: f64,
    sxx: f64,
    n: usize,
}

impl LinearFit {
    fn new(values: &[f64]) -> Self {
        let n = values.len();
        let nf = n as f64;
        let mean_x = (nf - 1.0) / 2.0;
        let mean_y = values.iter().sum::<f64>() / nf;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for (i, y) in values.iter().enumerate() {
            let dx = i as f64 - mean_x;
            sxx += dx * dx;
            sxy += dx * (y - mean_y);
        }
        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
        let intercept = mean_y - slope * mean_x;

        let mut sse = 0.0;
        let mut sst = 0.0;
        for (i, y) in values.iter().enumerate() {
            let fitted = intercept + slope * i as f64;
            sse += (y - fitted).powi(2);
            sst += (y - mean_y).powi(2);
        }
        let r_squared = if sst > 0.0 { 1.0 - sse / sst } else { 1.0 };
        let residual_std_error = if n > 2 {
            (sse / (nf - 2.0)).sqrt()
        } else {
            0.0
        };

        LinearFit {
            slope,
            intercept,
            r_squared,
            residual_std_error,
            mean_x,
            sxx,
            n,
        }
    }

    fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }

    /// Half-width of the prediction interval at `x`
    fn margin(&self, x: f64) -> f64 {
        let leverage = if self.sxx > 0.0 {
            (x - self.mean_x).powi(2) / self.sxx
        } else {
            0.0
        };
        Z_95 * self.residual_std_error * (1.0 + 1.0 / self.n as f64 + leverage).sqrt()
    }
}

/// Project `history` forward by `horizon` periods with a 95% prediction band.
///
/// Fails with `InsufficientHistory` below three points and never returns a
/// partial series.
pub fn project(history: &[HistoryPoint], horizon: usize) -> PipelineResult<ForecastResult> {
    if history.len() < MIN_HISTORY_POINTS {
        return Err(PipelineError::InsufficientHistory {
            required: MIN_HISTORY_POINTS,
            available: history.len(),
        });
    }
    if horizon == 0 {
        return Err(PipelineError::InvalidRequest(
            "Forecast horizon must be at least 1".to_string(),
        ));
    }

    let values: Vec<f64> = history.iter().map(|p| p.value).collect();
    let fit = LinearFit::new(&values);
    let last_period = history
        .last()
        .map(|p| p.period.as_str())
        .unwrap_or_default();

    let series = (1..=horizon)
        .map(|step| {
            let x = (history.len() - 1 + step) as f64;
            let projected_value = fit.predict(x);
            let margin = fit.margin(x);
            ForecastPoint {
                period: next_period(last_period, step),
                projected_value,
                confidence_low: projected_value - margin,
                confidence_high: projected_value + margin,
            }
        })
        .collect();

    Ok(ForecastResult {
        series,
        model_metadata: ModelMetadata {
            model: MODEL_NAME.to_string(),
            slope: fit.slope,
            intercept: fit.intercept,
            r_squared: fit.r_squared,
            residual_std_error: fit.residual_std_error,
            history_points: history.len(),
            confidence_level: 0.95,
        },
    })
}

/// Label of the period `step` positions after `last`, continuing its format
fn next_period(last: &str, step: usize) -> String {
    if last.len() == 7 {
        if let Ok(month) = NaiveDate::parse_from_str(&format!("{}-01", last), "%Y-%m-%d") {
            if let Some(next) = month.checked_add_months(Months::new(step as u32)) {
                return next.format("%Y-%m").to_string();
            }
        }
    }
    if let Ok(day) = NaiveDate::parse_from_str(last, "%Y-%m-%d") {
        if let Some(next) = day.checked_add_signed(Duration::days(step as i64)) {
            return next.format("%Y-%m-%d").to_string();
        }
    }
    format!("+{}", step)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monthly(values: &[f64]) -> Vec<HistoryPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| HistoryPoint::new(format!("2024-{:02}", i + 1), *v))
            .collect()
    }

    #[test]
    fn test_upward_trend_projection() {
        let history = monthly(&[85000.0, 92000.0, 88000.0, 98000.0, 105000.0, 112000.0]);
        let result = project(&history, 1).unwrap();

        assert_eq!(result.series.len(), 1);
        let point = &result.series[0];
        assert_eq!(point.period, "2024-07");
        assert!(point.projected_value > 112000.0);
        assert!((point.projected_value - 115066.67).abs() < 0.01);
        assert!(point.confidence_low < point.projected_value);
        assert!(point.projected_value < point.confidence_high);

        let meta = &result.model_metadata;
        assert!((meta.slope - 5257.142857).abs() < 1e-3);
        assert!((meta.intercept - 83523.809524).abs() < 1e-3);
        assert!(meta.r_squared > 0.8 && meta.r_squared <= 1.0);
        assert_eq!(meta.history_points, 6);
        assert_eq!(meta.confidence_level, 0.95);
    }

    #[test]
    fn test_short_history_is_rejected() {
        for n in 0..MIN_HISTORY_POINTS {
            let history = monthly(&vec![100.0; n]);
            assert_eq!(
                project(&history, 3),
                Err(PipelineError::InsufficientHistory {
                    required: 3,
                    available: n
                })
            );
        }
    }

    #[test]
    fn test_band_widens_with_horizon() {
        let history = monthly(&[10.0, 14.0, 9.0, 16.0, 12.0]);
        let result = project(&history, 3).unwrap();
        let widths: Vec<f64> = result
            .series
            .iter()
            .map(|p| p.confidence_high - p.confidence_low)
            .collect();
        assert!(widths[0] < widths[1] && widths[1] < widths[2]);
    }

    #[test]
    fn test_perfect_line_has_zero_band() {
        let history = monthly(&[1.0, 2.0, 3.0, 4.0]);
        let result = project(&history, 2).unwrap();
        assert!((result.series[1].projected_value - 6.0).abs() < 1e-9);
        assert_eq!(result.model_metadata.residual_std_error, 0.0);
        assert_eq!(result.model_metadata.r_squared, 1.0);
        assert_eq!(result.series[1].confidence_low, result.series[1].confidence_high);
    }

    #[test]
    fn test_projection_is_deterministic() {
        let history = monthly(&[3.0, 7.0, 5.0, 11.0]);
        assert_eq!(project(&history, 4), project(&history, 4));
    }

    #[test]
    fn test_zero_horizon_is_invalid() {
        let history = monthly(&[1.0, 2.0, 3.0]);
        assert!(matches!(
            project(&history, 0),
            Err(PipelineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_next_period_labels() {
        assert_eq!(next_period("2024-11", 2), "2025-01");
        assert_eq!(next_period("2024-02-28", 2), "2024-03-01");
        assert_eq!(next_period("Q3", 1), "+1");
    }
}
