use serde::Serialize;

const NEUTRAL_SCORE: i64 = 5;
const MOVING_AVERAGE_WINDOW: usize = 3;
const FINAL_SCORE_WEIGHT: i64 = 3;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum SentimentCategory {
    Frustrated,
    Neutral,
    Satisfied,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum SentimentTrend {
    Improving,
    Deteriorating,
    Stable,
    #[serde(rename = "No interaction")]
    NoInteraction,
}

/// Summary of a conversation's sentiment over time.
#[derive(Debug, Clone, Serialize)]
pub struct SentimentReport {
    pub weighted_average: i64,
    pub category: SentimentCategory,
    pub moving_averages: Vec<f64>,
    pub trend: SentimentTrend,
}

/// Condenses a chronological series of per-message sentiment scores
/// (0 to 10, oldest first) into an overall read of the conversation.
///
/// The most recent message carries triple weight in the overall average:
/// how the customer sounds right now matters more than how they opened.
/// The trend comes from a window-3 moving average over the raw scores,
/// comparing the first window against the last.
///
/// Pure and deterministic; an empty series is a valid input meaning "no
/// interaction yet", not an error. Scores outside 0 to 10 are a caller
/// contract violation and are not checked here.
pub fn analyze(scores: &[u8]) -> SentimentReport {
    if scores.is_empty() {
        return SentimentReport {
            weighted_average: NEUTRAL_SCORE,
            category: SentimentCategory::Neutral,
            moving_averages: Vec::new(),
            trend: SentimentTrend::NoInteraction,
        };
    }

    let weighted_average = weighted_average(scores);
    let moving_averages = moving_averages(scores);
    let trend = trend(&moving_averages);

    SentimentReport {
        weighted_average,
        category: categorize(weighted_average),
        moving_averages,
        trend,
    }
}

fn weighted_average(scores: &[u8]) -> i64 {
    let mut weighted_sum = 0i64;
    let mut total_weight = 0i64;
    for (index, &score) in scores.iter().enumerate() {
        let weight = if index == scores.len() - 1 {
            FINAL_SCORE_WEIGHT
        } else {
            1
        };
        weighted_sum += i64::from(score) * weight;
        total_weight += weight;
    }
    (weighted_sum as f64 / total_weight as f64).round() as i64
}

fn categorize(weighted_average: i64) -> SentimentCategory {
    if weighted_average <= 2 {
        SentimentCategory::Frustrated
    } else if weighted_average <= 6 {
        SentimentCategory::Neutral
    } else {
        SentimentCategory::Satisfied
    }
}

/// One average per window position, rounded to 2 decimal places; fewer
/// than 3 scores produce nothing to average.
fn moving_averages(scores: &[u8]) -> Vec<f64> {
    scores
        .windows(MOVING_AVERAGE_WINDOW)
        .map(|window| {
            let sum: u32 = window.iter().map(|&s| u32::from(s)).sum();
            let mean = f64::from(sum) / MOVING_AVERAGE_WINDOW as f64;
            (mean * 100.0).round() / 100.0
        })
        .collect()
}

fn trend(moving_averages: &[f64]) -> SentimentTrend {
    let (Some(first), Some(last)) = (moving_averages.first(), moving_averages.last()) else {
        return SentimentTrend::Stable;
    };
    if moving_averages.len() < 2 {
        // A single window cannot show direction.
        return SentimentTrend::Stable;
    }

    if *last > first + 1.0 {
        SentimentTrend::Improving
    } else if *last < first - 1.0 {
        SentimentTrend::Deteriorating
    } else {
        SentimentTrend::Stable
    }
}
