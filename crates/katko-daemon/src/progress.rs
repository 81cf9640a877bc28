use katko_proto::state::ProgressText;

/// Whole-break progress summed over every track.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AggregateProgress {
    pub elapsed: f64,
    pub total: f64,
}

impl AggregateProgress {
    /// Sum `(position, duration)` pairs.  An unknown duration counts as zero.
    pub fn sum<I>(tracks: I) -> Self
    where
        I: IntoIterator<Item = (f64, Option<f64>)>,
    {
        tracks
            .into_iter()
            .fold(Self::default(), |acc, (position, duration)| Self {
                elapsed: acc.elapsed + sanitize(position),
                total: acc.total + duration.map(sanitize).unwrap_or(0.0),
            })
    }

    pub fn remaining(&self) -> f64 {
        (self.total - self.elapsed).max(0.0)
    }

    pub fn text(&self) -> ProgressText {
        ProgressText {
            elapsed: format_time(self.elapsed),
            remaining: format_time(self.remaining()),
            total: format_time(self.total),
        }
    }
}

fn sanitize(secs: f64) -> f64 {
    if secs.is_finite() && secs > 0.0 {
        secs
    } else {
        0.0
    }
}

/// `MM:SS`, seconds rounded to nearest.  Minutes are not capped at 59.
pub fn format_time(secs: f64) -> String {
    let total = sanitize(secs).round() as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}
