//! Rendering health reports: text, table, JSON and NDJSON

use crate::events::HealthState;

use super::HealthReport;

/// Console icon for a health state
pub fn icon(state: HealthState) -> &'static str {
    match state {
        HealthState::Healthy => "✓",
        HealthState::Degraded => "!",
        HealthState::Unhealthy => "✗",
        HealthState::Starting => "…",
        HealthState::Unknown => "?",
    }
}

/// Icon + name + status + check type + response time + details, one line
/// per service, summary last
pub fn render_text(report: &HealthReport) -> String {
    let mut out = String::new();

    for result in &report.services {
        out.push_str(&format!(
            "{} {:<20} {:<10} {:<8} {:>5}ms",
            icon(result.status),
            result.service_name,
            result.status.to_string(),
            result.check_type.to_string(),
            result.response_time_ms,
        ));

        if let Some(endpoint) = &result.endpoint {
            out.push_str(&format!("  {}", endpoint));
        } else if let Some(port) = result.port {
            out.push_str(&format!("  :{}", port));
        }
        if let Some(error) = &result.error {
            out.push_str(&format!("  ({})", error));
        }
        out.push('\n');
    }

    let s = &report.summary;
    out.push_str(&format!(
        "\n{} {}: {} healthy, {} degraded, {} unhealthy, {} unknown ({} total)\n",
        icon(s.overall),
        s.overall,
        s.healthy,
        s.degraded,
        s.unhealthy,
        s.unknown,
        s.total,
    ));

    out
}

/// Column-aligned table of the same data
pub fn render_table(report: &HealthReport) -> String {
    let headers = ["SERVICE", "STATUS", "CHECK", "TIME", "TARGET", "ERROR"];

    let rows: Vec<[String; 6]> = report
        .services
        .iter()
        .map(|r| {
            [
                r.service_name.clone(),
                format!("{} {}", icon(r.status), r.status),
                r.check_type.to_string(),
                format!("{}ms", r.response_time_ms),
                r.endpoint
                    .clone()
                    .or_else(|| r.port.map(|p| format!(":{}", p)))
                    .unwrap_or_default(),
                r.error.clone().unwrap_or_default(),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for (i, header) in headers.iter().enumerate() {
        out.push_str(&format!("{:<width$}  ", header, width = widths[i]));
    }
    out.push('\n');

    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            out.push_str(&format!("{:<width$}  ", cell, width = widths[i]));
        }
        out.push('\n');
    }

    out
}

/// Pretty JSON document
pub fn render_json(report: &HealthReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

/// One compact JSON object, newline-terminated, for pipes
pub fn render_ndjson_line(report: &HealthReport) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(report)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{CheckType, HealthResult};

    fn report() -> HealthReport {
        let mut ok = HealthResult::new("web", CheckType::Http);
        ok.status = HealthState::Healthy;
        ok.endpoint = Some("http://localhost:3000/health".into());
        ok.response_time_ms = 12;

        let mut bad = HealthResult::new("api", CheckType::Tcp);
        bad.status = HealthState::Unhealthy;
        bad.port = Some(4000);
        bad.error = Some("connect failed".into());

        HealthReport::new("demo", vec![ok, bad])
    }

    #[test]
    fn test_text_contains_services_and_summary() {
        let text = render_text(&report());
        assert!(text.contains("web"));
        assert!(text.contains("api"));
        assert!(text.contains("1 healthy"));
        assert!(text.contains("1 unhealthy"));
    }

    #[test]
    fn test_table_is_aligned() {
        let table = render_table(&report());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("SERVICE"));
        // The status column starts at the same offset in every row
        let offset = lines[0].find("STATUS").unwrap();
        assert!(lines[1].len() > offset);
    }

    #[test]
    fn test_ndjson_is_single_line() {
        let line = render_ndjson_line(&report()).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with('\n'));

        let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["project"], "demo");
        assert_eq!(parsed["summary"]["total"], 2);
    }
}
