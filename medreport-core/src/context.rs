use std::fmt::Write;

use crate::models::{AiAnalysis, Report};

/// Build the textual summary that grounds chat answers in one report.
///
/// Categories appear in a fixed order (symptoms, diagnoses, medications, tests)
/// and are left out entirely when empty.
pub fn build_report_context(report: &Report) -> String {
    summarize_analysis(&report.analysis)
}

pub fn summarize_analysis(analysis: &AiAnalysis) -> String {
    let mut out = String::from("Medical Report Summary:\n\n");

    let categories: [(&str, &[String]); 4] = [
        ("Symptoms", analysis.entities.symptoms.as_slice()),
        ("Diagnoses", analysis.entities.diagnoses.as_slice()),
        ("Medications", analysis.entities.medications.as_slice()),
        ("Tests", analysis.entities.tests.as_slice()),
    ];
    for (label, items) in categories {
        if !items.is_empty() {
            let _ = writeln!(out, "{}: {}", label, items.join(", "));
        }
    }

    if !analysis.recommendations.is_empty() {
        out.push_str("\nRecommended Tests:\n");
        for (i, rec) in analysis.recommendations.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}. {} - {} (Confidence: {:.0}%, Urgency: {})",
                i + 1,
                rec.test,
                rec.reason,
                rec.confidence,
                rec.urgency
            );
        }
    }

    let _ = writeln!(
        out,
        "\nOverall Confidence Score: {:.1}%",
        analysis.confidence_score
    );
    out
}
