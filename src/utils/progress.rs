use once_cell::sync::Lazy;
use regex::Regex;

static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").unwrap());

/// Percentages reported by `curl --progress-bar` or `wget --progress=dot` in stderr,
/// in order of appearance and without consecutive repeats.
pub fn parse_progress_percentages(stderr: &str) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    // curl redraws its bar with carriage returns rather than newlines.
    for segment in stderr.split(['\r', '\n']) {
        let Some(value) = PERCENT_RE
            .captures_iter(segment)
            .filter_map(|caps| caps.get(1))
            .filter_map(|m| m.as_str().parse::<f64>().ok())
            .last()
        else {
            continue;
        };
        if !(0.0..=100.0).contains(&value) {
            continue;
        }
        let pct = value.floor() as u8;
        if out.last() != Some(&pct) {
            out.push(pct);
        }
    }
    out
}

pub fn percent_of(done: u64, total: Option<u64>) -> Option<u8> {
    let total = total.filter(|t| *t > 0)?;
    Some(((done.min(total) * 100) / total) as u8)
}
