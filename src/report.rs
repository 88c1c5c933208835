use std::fmt::Write;

use crate::models::ScoredObservation;

#[derive(Debug, Clone, PartialEq)]
pub struct AuditSummary {
    pub scored: usize,
    pub corrected: usize,
    pub mean_probability: f64,
    /// Share of corrected rows whose thresholded prediction matched `true_class`.
    pub accuracy: Option<f64>,
}

pub fn summarize(rows: &[ScoredObservation], threshold: f64) -> AuditSummary {
    let scored = rows.len();
    let mean_probability = if scored == 0 {
        0.0
    } else {
        rows.iter().map(|row| row.proba).sum::<f64>() / scored as f64
    };

    let mut corrected = 0usize;
    let mut matched = 0usize;
    for row in rows {
        if let Some(true_class) = row.true_class {
            corrected += 1;
            if (row.proba >= threshold) == (true_class == 1) {
                matched += 1;
            }
        }
    }

    AuditSummary {
        scored,
        corrected,
        mean_probability,
        accuracy: (corrected > 0).then(|| matched as f64 / corrected as f64),
    }
}

pub fn build_report(rows: &[ScoredObservation], threshold: f64) -> String {
    let summary = summarize(rows, threshold);
    let mut output = String::new();

    let _ = writeln!(output, "# Prediction Audit Report");
    let _ = writeln!(output, "Decision threshold {:.2}", threshold);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Totals");

    if summary.scored == 0 {
        let _ = writeln!(output, "No predictions recorded.");
    } else {
        let _ = writeln!(output, "- scored observations: {}", summary.scored);
        let _ = writeln!(
            output,
            "- corrected observations: {}",
            summary.corrected
        );
        let _ = writeln!(
            output,
            "- mean probability: {:.3}",
            summary.mean_probability
        );
        match summary.accuracy {
            Some(accuracy) => {
                let _ = writeln!(output, "- accuracy on corrected: {:.1}%", accuracy * 100.0);
            }
            None => {
                let _ = writeln!(output, "- accuracy on corrected: n/a");
            }
        }
    }

    let mut pending: Vec<&ScoredObservation> =
        rows.iter().filter(|row| row.true_class.is_none()).collect();
    pending.sort_by(|a, b| {
        b.proba
            .partial_cmp(&a.proba)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.observation_id.cmp(&b.observation_id))
    });

    let _ = writeln!(output);
    let _ = writeln!(output, "## Awaiting Correction");

    if pending.is_empty() {
        let _ = writeln!(output, "No observations awaiting correction.");
    } else {
        for row in pending.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} probability {:.3}",
                row.observation_id, row.proba
            );
        }
    }

    output
}

/// Writes every row as CSV with a header line. Returns the number of rows written.
pub fn export_csv<W: std::io::Write>(
    rows: &[ScoredObservation],
    writer: W,
) -> anyhow::Result<usize> {
    let mut writer = csv::Writer::from_writer(writer);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(rows.len())
}
