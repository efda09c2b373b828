// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;

#[test]
fn claude_windows_verbatim_utilization() {
    let data = json!({
        "five_hour": { "utilization": 45.25, "resets_at": "2026-03-01T10:00:00Z" },
        "seven_day": { "utilization": 12.0, "resets_at": "2026-03-05T00:00:00Z" },
        "seven_day_sonnet": { "utilization": 0.0, "resets_at": null },
    });

    let windows = parse_claude_usage(&data);
    assert_eq!(windows.len(), 3);
    assert_eq!(windows[0].window_type, "five_hour");
    assert_eq!(windows[0].percentage, 45.3);
    assert!(windows[0].resets_at.is_some());
    // Percentage-only mode: token counts are recorded as zero.
    assert_eq!(windows[0].tokens_limit, 0);
    assert_eq!(windows[2].resets_at, None);
}

#[test]
fn claude_missing_windows_skipped() {
    let data = json!({ "five_hour": { "utilization": 5 } });
    let windows = parse_claude_usage(&data);
    assert_eq!(windows.len(), 1);
}

#[test]
fn codex_base_and_model_windows_with_matching_plan() {
    let data = json!({
        "plan_type": "Pro",
        "rate_limit": {
            "primary_window": { "used_percent": 30.0, "reset_at": 1767225600.0 },
            "secondary_window": { "used_percent": 10.0 },
        },
        "additional_rate_limits": [
            {
                "limit_name": "GPT-5.3-Codex-Spark",
                "rate_limit": {
                    "primary_window": { "used_percent": 55.5 },
                },
            },
        ],
    });

    let windows = parse_codex_usage(&data, Some("pro"));
    let types: Vec<&str> = windows.iter().map(|w| w.window_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "GPT-5.3-Codex_primary_window",
            "GPT-5.3-Codex_secondary_window",
            "GPT-5.3-Codex-Spark_primary_window",
        ]
    );
    assert!(windows[0].resets_at.is_some());
    assert_eq!(windows[2].percentage, 55.5);
}

#[test]
fn codex_model_buckets_gated_on_plan_mismatch() {
    let data = json!({
        "plan_type": "pro",
        "rate_limit": { "primary_window": { "used_percent": 1.0 } },
        "additional_rate_limits": [
            { "limit_name": "GPT-5.3-Codex-Spark",
              "rate_limit": { "primary_window": { "used_percent": 99.0 } } },
        ],
    });

    // Recorded plan differs from the server's plan_type: only base windows.
    let windows = parse_codex_usage(&data, Some("plus"));
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].window_type, "GPT-5.3-Codex_primary_window");

    // Account without a recorded plan includes everything.
    let windows = parse_codex_usage(&data, None);
    assert_eq!(windows.len(), 2);
}

#[test]
fn codex_status_output_parses_labels_and_reset() {
    let output = "\
Plan: Pro
Primary usage: 45% used
Weekly limit: 12.5%
Resets at 2026-03-01T10:00:00Z
";
    let windows = parse_codex_status_output(output);
    assert!(windows.len() >= 2, "windows: {windows:?}");
    assert!(windows.iter().any(|w| w.percentage == 45.0));
    assert!(windows.iter().any(|w| w.percentage == 12.5));
    // The reset timestamp backfills windows that lack one.
    assert!(windows.iter().all(|w| w.resets_at.is_some()));
}

#[test]
fn codex_status_without_percentages_is_empty() {
    assert!(parse_codex_status_output("no usage information").is_empty());
}

#[test]
fn gemini_inverts_remaining_fraction_and_filters() {
    let data = json!({
        "buckets": [
            { "modelId": "gemini-3-pro-preview", "remainingFraction": 0.25,
              "resetTime": "2026-03-01T10:00:00Z" },
            { "modelId": "gemini-2.5-pro", "remainingFraction": 0.9 },
            { "modelId": "gemini-3-pro-preview_vertex", "remainingFraction": 0.5 },
            { "modelId": "gemini-2.0-flash", "remainingFraction": 1.0 },
            { "modelId": "gemini-2.5-flash", "remainingFraction": 1.0 },
        ],
    });

    let windows = parse_gemini_quota(&data);
    // Vertex duplicate, deprecated 2.0/2.5-flash, and the older 2.x major
    // are all filtered out.
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].window_type, "gemini-3-pro-preview");
    assert_eq!(windows[0].percentage, 75.0);
    assert!(windows[0].resets_at.is_some());
}

#[test]
fn gemini_single_family_kept() {
    let data = json!({
        "buckets": [
            { "modelId": "gemini-2.5-pro", "remainingFraction": 0.5 },
        ],
    });
    let windows = parse_gemini_quota(&data);
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].percentage, 50.0);
}

#[test]
fn gemini_empty_buckets() {
    assert!(parse_gemini_quota(&json!({})).is_empty());
}
