//! Derived cost metrics computed over a merged creator profile.

use serde_json::{Map, Value};

use super::field::Field;

const EXPOSURE_SUFFIX: &str = "exposure_median";

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `numerator / denominator * multiplier`, rounded to 2 decimals; 0 when the
/// denominator is not positive.
pub fn safe_div(numerator: f64, denominator: f64, multiplier: f64) -> f64 {
    if denominator > 0.0 {
        round2(numerator / denominator * multiplier)
    } else {
        0.0
    }
}

/// Add `cpm`, `cpc` and `cpe` for every median group in the profile.
///
/// Median groups are recognized by their `exposure_median` key, optionally
/// prefixed by a phase (`daily_exposure_median`). Each metric is the lower of
/// the graphic-price and video-price variants.
pub fn derive_cost_metrics(profile: &mut Map<String, Value>) {
    let doc = Value::Object(profile.clone());
    let root = Field::of(&doc);
    let graphic_price = root.get("graphic_price").f64_or(0.0);
    let video_price = root.get("video_price").f64_or(0.0);

    let prefixes: Vec<String> = profile
        .keys()
        .filter_map(|k| k.strip_suffix(EXPOSURE_SUFFIX))
        .map(str::to_string)
        .collect();

    for prefix in prefixes {
        let exposure = root.get(&format!("{prefix}exposure_median")).f64_or(0.0);
        let read = root.get(&format!("{prefix}read_median")).f64_or(0.0);
        let engage = root.get(&format!("{prefix}engage_median")).f64_or(0.0);

        let cpm = safe_div(graphic_price, exposure, 1000.0).min(safe_div(video_price, exposure, 1000.0));
        let cpc = safe_div(graphic_price, read, 1.0).min(safe_div(video_price, read, 1.0));
        let cpe = safe_div(graphic_price, engage, 1.0).min(safe_div(video_price, engage, 1.0));

        profile.insert(format!("{prefix}cpm"), Value::from(cpm));
        profile.insert(format!("{prefix}cpc"), Value::from(cpc));
        profile.insert(format!("{prefix}cpe"), Value::from(cpe));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(1000.0, 3.0, 1.0), 333.33);
        assert_eq!(safe_div(1000.0, 0.0, 1000.0), 0.0);
        assert_eq!(safe_div(1000.0, -5.0, 1.0), 0.0);
    }

    #[test]
    fn test_metrics_take_cheaper_variant() {
        let mut profile = json!({
            "graphic_price": 5000,
            "video_price": 8000,
            "daily_exposure_median": 20000,
            "daily_read_median": 1000,
            "daily_engage_median": 0,
        })
        .as_object()
        .cloned()
        .unwrap();
        derive_cost_metrics(&mut profile);
        assert_eq!(profile["daily_cpm"], json!(250.0));
        assert_eq!(profile["daily_cpc"], json!(5.0));
        assert_eq!(profile["daily_cpe"], json!(0.0));
    }

    #[test]
    fn test_missing_price_gives_zero() {
        let mut profile = json!({"exposure_median": 100, "read_median": 10, "engage_median": 5})
            .as_object()
            .cloned()
            .unwrap();
        derive_cost_metrics(&mut profile);
        assert_eq!(profile["cpm"], json!(0.0));
        assert_eq!(profile["cpc"], json!(0.0));
    }
}
